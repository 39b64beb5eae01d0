//! Coordinated-set lock coordinator.
//!
//! Locking rides on the regular fan-out: an operation that needs exclusive
//! access to a coordinated set runs a lock round first. If any device refuses,
//! the devices that did lock are unlocked again and the operation reports
//! [`Failure::LockUnavailable`] without running its own rounds.

use smallvec::SmallVec;

use crate::cap::{
   group::{DeviceRecord, GroupInstance, LockState},
   request::PendingOp,
   subclient::{CsipRequest, Lane, SubRequest},
   types::{Cid, Service},
};

/// Whether `op` has to lock the set before fanning out.
pub fn needs_lock(group: &GroupInstance, op: &PendingOp) -> bool {
   group.is_coordinated()
      && op.request.requires_lock()
      && op
         .touched
         .iter()
         .filter_map(|cid| group.device(*cid))
         .filter(|d| d.supports(Service::Csip))
         .any(|d| d.lock != LockState::Locked)
}

/// Touched devices in ascending set rank, ties kept in connection order.
pub fn lock_order(group: &GroupInstance, touched: &[Cid]) -> SmallVec<[Cid; 2]> {
   let mut order: SmallVec<[Cid; 2]> = SmallVec::from_slice(touched);
   order.sort_by_key(|cid| group.device(*cid).map_or(u8::MAX, DeviceRecord::rank));
   order
}

pub fn lock_request(device: &mut DeviceRecord) -> Option<SubRequest> {
   if !device.supports(Service::Csip) || device.lock == LockState::Locked {
      return None;
   }
   device.lock = LockState::Pending;
   Some(SubRequest::Csip(CsipRequest::SetLock(true)))
}

pub fn unlock_request(device: &DeviceRecord) -> Option<SubRequest> {
   (device.supports(Service::Csip) && device.lock == LockState::Locked)
      .then_some(SubRequest::Csip(CsipRequest::SetLock(false)))
}

/// Records the remote's answer to a lock write.
pub const fn apply_lock(device: &mut DeviceRecord, locking: bool, ok: bool) {
   device.lock = match (locking, ok) {
      (true, true) => LockState::Locked,
      (true, false) | (false, true) => LockState::Unlocked,
      (false, false) => LockState::Locked,
   };
}

/// Whether the lock round left any touched device without the lock.
pub fn lock_failed(group: &GroupInstance, op: &PendingOp) -> bool {
   op.touched
      .iter()
      .filter_map(|cid| group.device(*cid))
      .any(|d| d.slot(Lane::General).status.is_failed())
}

#[cfg(test)]
mod tests {
   use smol_str::SmolStr;

   use super::*;
   use crate::cap::{
      arena::Arena,
      request::{AppTask, ConnectionSpec},
      subclient::{CsipHandles, DeviceHandles},
      types::SetInfo,
   };

   fn group(ranks: &[(u32, u8)]) -> GroupInstance {
      let mut arena = Arena::new();
      let id = arena.insert_with(|id| id);
      let mut group = GroupInstance::new(id, ranks.len() as u8, AppTask::new("test"));
      for (cid, rank) in ranks {
         let mut device = DeviceRecord::new(&ConnectionSpec {
            cid: Cid(*cid),
            address: SmolStr::new_static("00:00:00:00:00:00"),
            cached: Some(DeviceHandles {
               csip: Some(CsipHandles::default()),
               ..Default::default()
            }),
         });
         device.set_info = Some(SetInfo {
            size: ranks.len() as u8,
            rank: *rank,
            locked: false,
         });
         group.devices.push(device);
      }
      group
   }

   #[test]
   fn test_rank_order() {
      let group = group(&[(1, 2), (2, 1), (3, 2)]);
      let order = lock_order(&group, &[Cid(1), Cid(2), Cid(3)]);
      assert_eq!(order.as_slice(), &[Cid(2), Cid(1), Cid(3)]);
   }

   #[test]
   fn test_lock_requests() {
      let mut group = group(&[(1, 1)]);
      let device = group.device_mut(Cid(1)).unwrap();
      assert_eq!(
         lock_request(device),
         Some(SubRequest::Csip(CsipRequest::SetLock(true)))
      );
      assert_eq!(device.lock, LockState::Pending);
      assert_eq!(unlock_request(device), None);

      apply_lock(device, true, true);
      assert_eq!(device.lock, LockState::Locked);
      assert_eq!(lock_request(device), None);
      assert_eq!(
         unlock_request(device),
         Some(SubRequest::Csip(CsipRequest::SetLock(false)))
      );

      // A refused unlock leaves the lock held
      apply_lock(device, false, false);
      assert_eq!(device.lock, LockState::Locked);
      apply_lock(device, false, true);
      assert_eq!(device.lock, LockState::Unlocked);
   }
}
