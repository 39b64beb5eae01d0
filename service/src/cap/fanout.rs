//! Fan-out / fan-in engine.
//!
//! Each round of an operation issues sub-requests to the touched devices and
//! counts them on the device's lane slot. The round is complete once every
//! touched device has resolved everything it was asked for. Completions may
//! arrive in any order; the engine only counts.

use log::warn;
use smallvec::SmallVec;

use crate::cap::{
   group::GroupInstance,
   lock,
   phase,
   request::{Phase, Request},
   status::{Failure, OpResult},
   subclient::{Lane, SubClients, SubRequest, Ticket},
   types::Cid,
};

/// Sub-requests one device receives in one round.
pub type Requests = SmallVec<[SubRequest; 2]>;

/// Devices `request` addresses, in record order.
pub fn resolve_touched(group: &GroupInstance, request: &Request) -> SmallVec<[Cid; 2]> {
   let eligible = group
      .devices
      .iter()
      .filter(|d| d.eligible(request))
      .map(|d| d.cid);
   match request {
      // Issued through a single assistant
      Request::SyncToSource(_)
      | Request::CancelSyncToSource
      | Request::TerminateSyncToSource { .. } => eligible.take(1).collect(),
      _ => eligible.collect(),
   }
}

/// Prepares the lane slots of the touched devices for a new operation.
pub fn begin(group: &mut GroupInstance, lane: Lane, touched: &[Cid]) {
   for cid in touched {
      if let Some(device) = group.device_mut(*cid) {
         device.slot_mut(lane).begin();
      }
   }
}

/// Issues the current round of the lane's operation, returning how many
/// sub-requests went out.
///
/// Devices that already failed earlier in the operation sit the round out. A
/// device whose requests cannot be built counts as one failed sub-request.
pub fn issue<S: SubClients>(
   group: &mut GroupInstance,
   lane: Lane,
   subclients: &mut S,
) -> Result<usize, Failure> {
   let group_id = group.id;
   let (seq, round, request, order) = {
      let op = group.pending(lane).ok_or(Failure::NullInstance)?;
      let order = match op.phase {
         Phase::Lock => lock::lock_order(group, &op.touched),
         // Locks held before the operation started are not ours to release
         Phase::Unlock if op.recovering => op.acquired.clone(),
         _ => op.touched.clone(),
      };
      (op.seq, op.phase, op.request.clone(), order)
   };

   let mut issued = 0;
   let mut locked: SmallVec<[Cid; 2]> = SmallVec::new();
   for cid in order {
      let Some(device) = group.device_mut(cid) else {
         continue;
      };
      if !device.connected {
         continue;
      }
      let slot = device.slot_mut(lane);
      if slot.status.is_failed() {
         continue;
      }
      slot.counter.reset();

      let built = phase::build(group, cid, round, &request);
      let slot = group
         .device_mut(cid)
         .ok_or(Failure::NullInstance)?
         .slot_mut(lane);
      match built {
         Ok(requests) => {
            if round == Phase::Lock && !requests.is_empty() {
               locked.push(cid);
            }
            for sub in requests {
               slot.counter.request()?;
               let ticket = Ticket {
                  group: group_id,
                  cid,
                  lane,
                  seq,
                  service: sub.service(),
               };
               subclients.issue(ticket, sub);
               issued += 1;
            }
         },
         Err(failure) => {
            warn!("{group_id} {cid}: cannot build {round} round: {failure}");
            slot.counter.request()?;
            slot.counter.resolve(false)?;
            slot.status.record(Err(failure));
         },
      }
   }
   if let Some(op) = group.lane(lane).pending_mut() {
      op.acquired.extend(locked);
   }
   Ok(issued)
}

/// Whether every touched device resolved the current round.
pub fn is_complete(group: &GroupInstance, lane: Lane) -> bool {
   let Some(op) = group.pending(lane) else {
      return false;
   };
   op.touched
      .iter()
      .filter_map(|cid| group.device(*cid))
      .all(|device| device.slot(lane).counter.is_complete())
}

/// Counts one completion against the device's slot.
pub fn record(group: &mut GroupInstance, lane: Lane, cid: Cid, result: OpResult) -> OpResult {
   let slot = group
      .device_mut(cid)
      .ok_or(Failure::InvalidDevice)?
      .slot_mut(lane);
   slot.counter.resolve(result.is_ok())?;
   slot.status.record(result);
   Ok(())
}

/// Fails the device's share of the lane's operation, including whatever it
/// still owes the current round. Returns whether anything was outstanding.
pub fn fail_device(group: &mut GroupInstance, lane: Lane, cid: Cid, failure: Failure) -> bool {
   let touched = group
      .pending(lane)
      .is_some_and(|op| op.touched.contains(&cid));
   let Some(device) = group.device_mut(cid).filter(|_| touched) else {
      return false;
   };
   let slot = device.slot_mut(lane);
   slot.status.record(Err(failure));
   slot.counter.fail_outstanding() > 0
}

/// Turns still-running statuses into success once the operation is over.
pub fn settle(group: &mut GroupInstance, lane: Lane, touched: &[Cid]) {
   for cid in touched {
      if let Some(device) = group.device_mut(*cid) {
         device.slot_mut(lane).status.settle();
      }
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::oneshot;

   use super::*;
   use crate::cap::{
      arena::Arena,
      group::DeviceRecord,
      request::{AppTask, ConnectionSpec, PendingOp, QueuedRequest},
      status::RecentStatus,
      subclient::{DeviceHandles, VcpHandles, VcpRequest},
      testing::MockSubClients,
   };

   fn group(cids: &[u32]) -> GroupInstance {
      let mut arena = Arena::new();
      let id = arena.insert_with(|id| id);
      let mut group = GroupInstance::new(id, 1, AppTask::new("test"));
      for cid in cids {
         group.devices.push(DeviceRecord::new(&ConnectionSpec {
            cid: Cid(*cid),
            address: "00:00:00:00:00:00".into(),
            cached: Some(DeviceHandles {
               vcp: Some(VcpHandles::default()),
               ..Default::default()
            }),
         }));
      }
      group
   }

   fn start(group: &mut GroupInstance, request: Request) {
      let (reply, _rx) = oneshot::channel();
      let mut op = PendingOp::new(
         7,
         QueuedRequest {
            task: AppTask::new("test"),
            request,
            reply,
         },
      );
      op.touched = resolve_touched(group, &op.request);
      begin(group, Lane::General, &op.touched);
      group.general.state.begin(op).unwrap();
   }

   #[test]
   fn test_fan_in_counts_any_order() {
      let mut group = group(&[1, 2, 3]);
      let mut subclients = MockSubClients::default();
      start(&mut group, Request::SetVolume(40));
      assert_eq!(issue(&mut group, Lane::General, &mut subclients), Ok(3));
      assert_eq!(
         subclients.issued[0].1,
         SubRequest::Vcp(VcpRequest::SetAbsoluteVolume(40))
      );

      for cid in [3, 1] {
         record(&mut group, Lane::General, Cid(cid), Ok(())).unwrap();
         assert!(!is_complete(&group, Lane::General));
      }
      record(&mut group, Lane::General, Cid(2), Err(Failure::Timeout)).unwrap();
      assert!(is_complete(&group, Lane::General));
      // A duplicate completion is a consistency failure
      assert_eq!(
         record(&mut group, Lane::General, Cid(2), Ok(())),
         Err(Failure::NullInstance)
      );
      for device in &group.devices {
         let counter = device.slot(Lane::General).counter;
         assert!(counter.succeeded() + counter.failed() <= counter.requested());
      }
   }

   #[test]
   fn test_failed_device_sits_out() {
      let mut group = group(&[1, 2]);
      let mut subclients = MockSubClients::default();
      start(&mut group, Request::Mute(true));
      issue(&mut group, Lane::General, &mut subclients).unwrap();
      record(&mut group, Lane::General, Cid(1), Err(Failure::Timeout)).unwrap();
      record(&mut group, Lane::General, Cid(2), Ok(())).unwrap();

      subclients.issued.clear();
      assert_eq!(issue(&mut group, Lane::General, &mut subclients), Ok(1));
      assert_eq!(subclients.issued[0].0.cid, Cid(2));
   }

   #[test]
   fn test_build_failure_counts_as_failed() {
      let mut group = group(&[1]);
      let mut subclients = MockSubClients::default();
      // Nothing is configured, so the enable round cannot be built
      group.devices[0].handles.bap = Some(Default::default());
      let request = Request::StartStream {
         use_case: crate::cap::types::Context::MEDIA,
         metadata: Default::default(),
      };
      start(&mut group, request);
      group.general.state.pending_mut().unwrap().phase = Phase::Enable;
      assert_eq!(issue(&mut group, Lane::General, &mut subclients), Ok(0));
      assert!(is_complete(&group, Lane::General));
      assert_eq!(
         group.devices[0].slot(Lane::General).status,
         RecentStatus::Failed(Failure::NotConfigured)
      );
   }

   #[test]
   fn test_fail_device() {
      let mut group = group(&[1, 2]);
      let mut subclients = MockSubClients::default();
      start(&mut group, Request::Mute(false));
      issue(&mut group, Lane::General, &mut subclients).unwrap();
      record(&mut group, Lane::General, Cid(1), Ok(())).unwrap();

      assert!(!fail_device(&mut group, Lane::General, Cid(1), Failure::Disconnected));
      assert!(fail_device(&mut group, Lane::General, Cid(2), Failure::Disconnected));
      assert!(is_complete(&group, Lane::General));
      // Missing later rounds still counts against the device
      assert_eq!(
         group.devices[0].slot(Lane::General).status,
         RecentStatus::Failed(Failure::Disconnected)
      );
      assert!(!fail_device(&mut group, Lane::Assistant, Cid(2), Failure::Disconnected));
   }
}
