//! Broadcast-assistant sub-state machine.
//!
//! Assistant operations run on their own lane. Unlike the general lane they
//! are never queued: a request that arrives while the assistant is busy is
//! rejected with [`Failure::Busy`].

use serde::Serialize;
use smallvec::SmallVec;
use strum::{Display, IntoStaticStr};

use crate::cap::{
   UpdateOp,
   fanout::Requests,
   group::DeviceRecord,
   queue::LaneState,
   request::{Request, SourceIds},
   status::Failure,
   subclient::{BassRequest, SubRequest},
   types::{Cid, ReceiveState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum AssistantState {
   #[default]
   Idle,
   StartScan,
   StopScan,
   SyncToSource,
   CancelSync,
   TerminateSync,
   AddingSource,
   ModifyingSource,
   RemovingSource,
   SendCodes,
}

impl AssistantState {
   pub const fn for_request(request: &Request) -> Option<Self> {
      Some(match request {
         Request::StartSourceScan { .. } => Self::StartScan,
         Request::StopSourceScan { .. } => Self::StopScan,
         Request::SyncToSource(_) => Self::SyncToSource,
         Request::CancelSyncToSource => Self::CancelSync,
         Request::TerminateSyncToSource { .. } => Self::TerminateSync,
         Request::AddSource { .. } => Self::AddingSource,
         Request::ModifySource { .. } => Self::ModifyingSource,
         Request::RemoveSource { .. } => Self::RemovingSource,
         Request::SetBroadcastCode { .. } => Self::SendCodes,
         _ => return None,
      })
   }
}

/// Assistant lane of a group.
#[derive(Debug, Default)]
pub struct AssistantLane {
   pub state: AssistantState,
   pub op: LaneState,
   /// Devices whose remote scanning was started and not yet stopped.
   pub scanning: SmallVec<[Cid; 2]>,
}

impl AssistantLane {
   /// Enters the state for `request`, or explains why it cannot start.
   pub fn admit(&mut self, request: &Request) -> Result<AssistantState, Failure> {
      let next = AssistantState::for_request(request).ok_or(Failure::InvalidOperation)?;
      if self.state != AssistantState::Idle || !self.op.is_idle() {
         return Err(Failure::Busy);
      }
      if let Request::StopSourceScan { target } = request
         && !self.scanning.iter().any(|cid| target.matches(*cid))
      {
         return Err(Failure::InvalidAssistantState);
      }
      self.state = next;
      Ok(next)
   }

   /// Whether `cid` has remote scanning running.
   pub fn is_scanning(&self, cid: Cid) -> bool {
      self.scanning.contains(&cid)
   }

   /// Leaves the current state once its fan-in completed. Each device's scan
   /// flag follows its own result.
   pub fn settle(&mut self, results: impl IntoIterator<Item = (Cid, bool)>) {
      let state = self.state;
      for (cid, ok) in results {
         match state {
            AssistantState::StartScan if ok && !self.is_scanning(cid) => self.scanning.push(cid),
            AssistantState::StopScan if ok => self.forget(cid),
            _ => {},
         }
      }
      self.state = AssistantState::Idle;
   }

   /// Drops a device that left the group or lost its link.
   pub fn forget(&mut self, cid: Cid) {
      self.scanning.retain(|c| *c != cid);
   }
}

/// Source ids of `sources` that live on `device`, refusing ids the device is
/// known not to report.
fn source_ids(device: &DeviceRecord, sources: &SourceIds) -> Result<SmallVec<[u8; 2]>, Failure> {
   let ids: SmallVec<[u8; 2]> = sources
      .iter()
      .filter(|(cid, _)| *cid == device.cid)
      .map(|(_, id)| *id)
      .collect();
   let known = &device.receive_states;
   if !known.is_empty() && ids.iter().any(|id| known.iter().all(|s| s.source_id != *id)) {
      return Err(Failure::InvalidParameter);
   }
   Ok(ids)
}

/// Assistant requests for one device.
pub fn build(device: &DeviceRecord, request: &Request) -> Result<Requests, Failure> {
   let one = |request: BassRequest| -> Requests { SmallVec::from_elem(SubRequest::Bass(request), 1) };
   let each = |ids: SmallVec<[u8; 2]>, f: &dyn Fn(u8) -> BassRequest| -> Requests {
      ids.into_iter().map(|id| SubRequest::Bass(f(id))).collect()
   };
   Ok(match request {
      Request::StartSourceScan { .. } => one(BassRequest::RemoteScanStarted),
      Request::StopSourceScan { .. } => one(BassRequest::RemoteScanStopped),
      Request::SyncToSource(source) => one(BassRequest::SyncToSource(source.clone())),
      Request::CancelSyncToSource => one(BassRequest::CancelSyncToSource),
      Request::TerminateSyncToSource { sync_handle } => {
         one(BassRequest::TerminateSyncToSource { sync_handle: *sync_handle })
      },
      Request::AddSource { add, .. } => one(BassRequest::AddSource(add.clone())),
      Request::ModifySource { sources, modify } => {
         each(source_ids(device, sources)?, &|source_id| BassRequest::ModifySource {
            source_id,
            modify: modify.clone(),
         })
      },
      Request::RemoveSource { sources } => {
         each(source_ids(device, sources)?, &|source_id| BassRequest::RemoveSource { source_id })
      },
      Request::SetBroadcastCode { sources, code } => {
         each(source_ids(device, sources)?, &|source_id| BassRequest::SetBroadcastCode {
            source_id,
            code: *code,
         })
      },
      _ => return Err(Failure::NullInstance),
   })
}

/// Stores a receive state reported by a scan delegator.
pub fn upsert_receive_state(
   states: &mut Vec<ReceiveState>,
   state: ReceiveState,
) -> UpdateOp<ReceiveState> {
   match states.iter_mut().find(|s| s.source_id == state.source_id) {
      Some(existing) if *existing == state => UpdateOp::Noop,
      Some(existing) => UpdateOp::Updated(std::mem::replace(existing, state)),
      None => {
         states.push(state);
         UpdateOp::Inserted
      },
   }
}

/// Forgets a source the delegator no longer reports.
pub fn remove_receive_state(states: &mut Vec<ReceiveState>, source_id: u8) -> UpdateOp<ReceiveState> {
   match states.iter().position(|s| s.source_id == source_id) {
      Some(index) => UpdateOp::Deleted(states.remove(index)),
      None => UpdateOp::Noop,
   }
}

#[cfg(test)]
mod tests {
   use smallvec::SmallVec;

   use super::*;
   use crate::cap::{
      request::SourceIds,
      subclient::ModifySource,
      types::{
         BigEncryption, BroadcastSource, Cid, PaSync, PaSyncState, SourceAddress, Target,
      },
   };

   fn receive_state(source_id: u8, encryption: BigEncryption) -> ReceiveState {
      ReceiveState {
         source_id,
         source: BroadcastSource {
            address: SourceAddress {
               addr: [1, 2, 3, 4, 5, 6],
               random: false,
            },
            adv_sid: 0,
            broadcast_id: 0x00AB_CDEF,
            pa_interval: 0xFFFF,
         },
         pa_sync_state: PaSyncState::Synced,
         encryption,
         subgroups: SmallVec::new(),
      }
   }

   fn modify() -> Request {
      let sources: SourceIds = SmallVec::from_slice(&[(Cid(1), 1)]);
      Request::ModifySource {
         sources,
         modify: ModifySource {
            pa_sync: PaSync::SyncPast,
            pa_interval: 0xFFFF,
            subgroups: SmallVec::new(),
         },
      }
   }

   #[test]
   fn test_busy_while_scanning() {
      let mut lane = AssistantLane::default();
      let start = Request::StartSourceScan { target: Target::All };
      assert_eq!(lane.admit(&start), Ok(AssistantState::StartScan));

      assert_eq!(lane.admit(&modify()), Err(Failure::Busy));
      // Rejection leaves the state alone
      assert_eq!(lane.state, AssistantState::StartScan);

      lane.settle([(Cid(1), true)]);
      assert_eq!(lane.state, AssistantState::Idle);
      assert!(lane.is_scanning(Cid(1)));
      assert_eq!(lane.admit(&modify()), Ok(AssistantState::ModifyingSource));
   }

   #[test]
   fn test_stop_scan_requires_scanning() {
      let mut lane = AssistantLane::default();
      let stop = Request::StopSourceScan { target: Target::All };
      assert_eq!(lane.admit(&stop), Err(Failure::InvalidAssistantState));
      lane.scanning.push(Cid(1));
      assert_eq!(lane.admit(&stop), Ok(AssistantState::StopScan));
      lane.settle([(Cid(1), true)]);
      assert!(lane.scanning.is_empty());
   }

   #[test]
   fn test_failed_scan_start_not_scanning() {
      let mut lane = AssistantLane::default();
      lane.admit(&Request::StartSourceScan { target: Target::All }).unwrap();
      lane.settle([(Cid(1), false), (Cid(2), false)]);
      assert!(lane.scanning.is_empty());
   }

   #[test]
   fn test_scan_tracked_per_device() {
      let mut lane = AssistantLane::default();
      lane.admit(&Request::StartSourceScan { target: Target::All }).unwrap();
      lane.settle([(Cid(1), true), (Cid(2), true)]);

      let stop_one = Request::StopSourceScan { target: Target::Device(Cid(1)) };
      assert_eq!(lane.admit(&stop_one), Ok(AssistantState::StopScan));
      lane.settle([(Cid(1), true)]);
      assert!(!lane.is_scanning(Cid(1)));
      assert!(lane.is_scanning(Cid(2)));

      // The other device is still scanning and can be stopped on its own
      assert_eq!(lane.admit(&stop_one), Err(Failure::InvalidAssistantState));
      let stop_two = Request::StopSourceScan { target: Target::Device(Cid(2)) };
      assert_eq!(lane.admit(&stop_two), Ok(AssistantState::StopScan));
      lane.settle([(Cid(2), true)]);
      assert!(lane.scanning.is_empty());
   }

   #[test]
   fn test_partial_scan_start() {
      let mut lane = AssistantLane::default();
      lane.admit(&Request::StartSourceScan { target: Target::All }).unwrap();
      lane.settle([(Cid(1), false), (Cid(2), true)]);
      assert!(!lane.is_scanning(Cid(1)));
      assert!(lane.is_scanning(Cid(2)));

      lane.forget(Cid(2));
      let stop = Request::StopSourceScan { target: Target::All };
      assert_eq!(lane.admit(&stop), Err(Failure::InvalidAssistantState));
   }

   #[test]
   fn test_sync_cancel_and_terminate_admitted() {
      let mut lane = AssistantLane::default();
      assert_eq!(lane.admit(&Request::CancelSyncToSource), Ok(AssistantState::CancelSync));
      let terminate = Request::TerminateSyncToSource { sync_handle: 1 };
      assert_eq!(lane.admit(&terminate), Err(Failure::Busy));
      lane.settle([(Cid(1), true)]);
      assert_eq!(lane.admit(&terminate), Ok(AssistantState::TerminateSync));
      // Neither touches the scan flags
      lane.settle([(Cid(1), true)]);
      assert!(lane.scanning.is_empty());
   }

   #[test]
   fn test_general_request_not_admitted() {
      let mut lane = AssistantLane::default();
      assert_eq!(lane.admit(&Request::Mute(true)), Err(Failure::InvalidOperation));
   }

   #[test]
   fn test_receive_state_upsert() {
      let mut states = Vec::new();
      let first = receive_state(1, BigEncryption::NotEncrypted);
      assert!(matches!(upsert_receive_state(&mut states, first.clone()), UpdateOp::Inserted));
      assert!(matches!(upsert_receive_state(&mut states, first), UpdateOp::Noop));
      assert!(matches!(
         upsert_receive_state(&mut states, receive_state(1, BigEncryption::CodeRequired)),
         UpdateOp::Updated(prev) if prev.encryption == BigEncryption::NotEncrypted
      ));
      assert_eq!(states.len(), 1);
      assert!(matches!(remove_receive_state(&mut states, 1), UpdateOp::Deleted(_)));
      assert!(matches!(remove_receive_state(&mut states, 1), UpdateOp::Noop));
   }
}
