//! Group instances and the per-device records they own.

use serde::Serialize;
use smallvec::SmallVec;
use smol_str::SmolStr;
use strum::{Display, IntoStaticStr};

use crate::cap::{
   arena::GroupId,
   aggregate::DeviceValue,
   ase::EndpointList,
   bass::AssistantLane,
   queue::{GeneralLane, LaneState},
   request::{AppTask, ConnectionSpec, OpKind, PendingOp, Request},
   status::{Failure, OpResult, RecentStatus},
   subclient::{CisBinding, DeviceHandles, HandleSet, Lane},
   types::{
      AvailableContexts, Capabilities, CisDirection, Cid, Context, MicState, ReceiveState,
      Service, SetInfo, VolumeState,
   },
};

/// Connected isochronous groups a single group may allocate.
pub const MAX_CIGS: usize = 4;

// === Operation Counter ===

/// Tracks the sub-requests of one fan-out on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounter {
   requested: u16,
   succeeded: u16,
   failed: u16,
}

impl OperationCounter {
   pub const fn reset(&mut self) {
      *self = Self {
         requested: 0,
         succeeded: 0,
         failed: 0,
      };
   }

   pub const fn request(&mut self) -> Result<(), Failure> {
      match self.requested.checked_add(1) {
         Some(requested) => {
            self.requested = requested;
            Ok(())
         },
         None => Err(Failure::NullInstance),
      }
   }

   /// Counts one resolved sub-request; resolving more than was requested is an
   /// internal consistency failure.
   pub const fn resolve(&mut self, ok: bool) -> Result<(), Failure> {
      if self.is_complete() {
         return Err(Failure::NullInstance);
      }
      if ok {
         self.succeeded += 1;
      } else {
         self.failed += 1;
      }
      Ok(())
   }

   /// Fails every outstanding sub-request, returning how many there were.
   pub const fn fail_outstanding(&mut self) -> u16 {
      let outstanding = self.outstanding();
      self.failed += outstanding;
      outstanding
   }

   pub const fn outstanding(&self) -> u16 {
      self.requested - self.succeeded - self.failed
   }

   pub const fn is_complete(&self) -> bool {
      self.succeeded + self.failed == self.requested
   }

   pub const fn requested(&self) -> u16 {
      self.requested
   }

   pub const fn succeeded(&self) -> u16 {
      self.succeeded
   }

   pub const fn failed(&self) -> u16 {
      self.failed
   }
}

/// Fan-out bookkeeping a device keeps per lane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneSlot {
   pub counter: OperationCounter,
   pub status: RecentStatus,
   /// Value collected by a read.
   pub value: Option<DeviceValue>,
}

impl LaneSlot {
   /// Prepares the slot for a new logical operation.
   pub fn begin(&mut self) {
      self.counter.reset();
      self.status = RecentStatus::InProgress;
      self.value = None;
   }
}

// === Device Record ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LockState {
   #[default]
   Unlocked,
   Pending,
   Locked,
}

/// One remote connection inside a group.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
   pub cid: Cid,
   pub address: SmolStr,
   pub connected: bool,
   pub handles: DeviceHandles,
   pub endpoints: EndpointList,
   pub lock: LockState,
   pub set_info: Option<SetInfo>,
   pub capabilities: Option<Capabilities>,
   pub available: AvailableContexts,
   pub volume: Option<VolumeState>,
   pub mic: Option<MicState>,
   pub receive_states: Vec<ReceiveState>,
   slots: [LaneSlot; 2],
}

impl DeviceRecord {
   pub fn new(spec: &ConnectionSpec) -> Self {
      let handles = spec.cached.clone().unwrap_or_default();
      let endpoints = handles
         .bap
         .as_ref()
         .map(EndpointList::from_handles)
         .unwrap_or_default();
      Self {
         cid: spec.cid,
         address: spec.address.clone(),
         connected: true,
         handles,
         endpoints,
         lock: LockState::Unlocked,
         set_info: None,
         capabilities: None,
         available: AvailableContexts::default(),
         volume: None,
         mic: None,
         receive_states: Vec::new(),
         slots: Default::default(),
      }
   }

   pub const fn supports(&self, service: Service) -> bool {
      self.handles.has(service)
   }

   pub fn apply_handles(&mut self, set: HandleSet) {
      if let HandleSet::Bap(bap) = &set {
         self.endpoints = EndpointList::from_handles(bap);
      }
      self.handles.apply(set);
   }

   /// CSIP rank; unranked devices sort last.
   pub fn rank(&self) -> u8 {
      self.set_info.map_or(u8::MAX, |info| info.rank)
   }

   pub const fn slot(&self, lane: Lane) -> &LaneSlot {
      match lane {
         Lane::General => &self.slots[0],
         Lane::Assistant => &self.slots[1],
      }
   }

   pub const fn slot_mut(&mut self, lane: Lane) -> &mut LaneSlot {
      match lane {
         Lane::General => &mut self.slots[0],
         Lane::Assistant => &mut self.slots[1],
      }
   }

   /// Whether the device may take part in `request`.
   pub fn eligible(&self, request: &Request) -> bool {
      self.connected
         && request.matches(self.cid)
         && request.required_service().is_none_or(|service| self.supports(service))
   }
}

// === CAP State ===

/// Coarse stream lifecycle of a whole group.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CapState {
   #[default]
   Initializing,
   Initialized,
   CapabilitiesDiscovered,
   UnicastConnected,
   StreamStarted,
   StreamStopped,
   AudioUpdated,
}

impl CapState {
   /// Whether an operation of `kind` may start in this state.
   pub const fn validate(self, kind: OpKind) -> OpResult {
      use CapState::*;
      let streaming = matches!(self, StreamStarted | AudioUpdated);
      match (self, kind) {
         (Initializing, OpKind::Init) => Ok(()),
         (Initializing, _) => Err(Failure::InvalidOperation),
         (_, OpKind::Init) => Err(Failure::InvalidOperation),

         (Initialized, OpKind::UnicastConnect | OpKind::StartStream | OpKind::UpdateAudio) => {
            Err(Failure::CapabilitiesNotDiscovered)
         },
         (_, OpKind::UnicastConnect) if streaming => Err(Failure::StreamAlreadyActive),
         (_, OpKind::UnicastConnect) => Ok(()),

         (_, OpKind::StartStream) if streaming => Err(Failure::StreamAlreadyActive),
         (UnicastConnected | StreamStopped, OpKind::StartStream) => Ok(()),
         (_, OpKind::StartStream) => Err(Failure::NotConfigured),

         (_, OpKind::UpdateAudio) if streaming => Ok(()),
         (_, OpKind::UpdateAudio) => Err(Failure::NotConfigured),

         (UnicastConnected | StreamStarted | AudioUpdated, OpKind::StopStream) => Ok(()),
         (_, OpKind::StopStream) => Err(Failure::NotConfigured),

         (_, OpKind::UnicastDisconnect) if streaming => Err(Failure::InvalidOperation),
         (UnicastConnected | StreamStopped, OpKind::UnicastDisconnect) => Ok(()),
         (_, OpKind::UnicastDisconnect) => Err(Failure::NotConfigured),

         _ => Ok(()),
      }
   }

   /// State after `request` succeeded on at least one device.
   pub const fn after(self, request: &Request) -> Self {
      match request {
         Request::Init => Self::Initialized,
         Request::DiscoverCapabilities if matches!(self, Self::Initialized) => {
            Self::CapabilitiesDiscovered
         },
         Request::UnicastConnect(_) => Self::UnicastConnected,
         Request::StartStream { .. } => Self::StreamStarted,
         Request::UpdateAudio { .. } => Self::AudioUpdated,
         Request::StopStream { release: false, .. } => Self::StreamStopped,
         Request::StopStream { release: true, .. } | Request::UnicastDisconnect { .. } => {
            Self::CapabilitiesDiscovered
         },
         _ => self,
      }
   }
}

// === Group ===

/// A connected isochronous group allocated for one use case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cig {
   pub id: u8,
   pub use_case: Context,
   pub direction: CisDirection,
   next_cis: u8,
}

impl Cig {
   pub const fn next_cis_id(&mut self) -> u8 {
      let id = self.next_cis;
      self.next_cis = self.next_cis.wrapping_add(1);
      id
   }

   pub const fn restart(&mut self) {
      self.next_cis = 0;
   }
}

/// One coordinated set, or a single device, under orchestration.
#[derive(Debug)]
pub struct GroupInstance {
   pub id: GroupId,
   pub set_size: u8,
   pub cap_state: CapState,
   /// Connection order; never reordered.
   pub devices: Vec<DeviceRecord>,
   pub tasks: SmallVec<[AppTask; 2]>,
   pub general: GeneralLane,
   pub assistant: AssistantLane,
   pub cigs: SmallVec<[Cig; 2]>,
   next_seq: u32,
}

impl GroupInstance {
   pub fn new(id: GroupId, set_size: u8, task: AppTask) -> Self {
      Self {
         id,
         set_size,
         cap_state: CapState::Initializing,
         devices: Vec::new(),
         tasks: SmallVec::from_elem(task, 1),
         general: GeneralLane::default(),
         assistant: AssistantLane::default(),
         cigs: SmallVec::new(),
         next_seq: 0,
      }
   }

   pub fn device(&self, cid: Cid) -> Option<&DeviceRecord> {
      self.devices.iter().find(|d| d.cid == cid)
   }

   pub fn device_mut(&mut self, cid: Cid) -> Option<&mut DeviceRecord> {
      self.devices.iter_mut().find(|d| d.cid == cid)
   }

   pub fn current_device_count(&self) -> usize {
      self.devices.iter().filter(|d| d.connected).count()
   }

   /// A set larger than one whose members expose set coordination.
   pub fn is_coordinated(&self) -> bool {
      self.set_size > 1 && self.devices.iter().any(|d| d.supports(Service::Csip))
   }

   pub fn is_registered(&self, task: &AppTask) -> bool {
      self.tasks.contains(task)
   }

   pub fn register_task(&mut self, task: AppTask) -> OpResult {
      if self.is_registered(&task) {
         return Err(Failure::InvalidParameter);
      }
      self.tasks.push(task);
      Ok(())
   }

   pub fn deregister_task(&mut self, task: &AppTask) -> OpResult {
      let index = self
         .tasks
         .iter()
         .position(|t| t == task)
         .ok_or(Failure::TaskNotRegistered)?;
      self.tasks.remove(index);
      Ok(())
   }

   pub const fn lane(&mut self, lane: Lane) -> &mut LaneState {
      match lane {
         Lane::General => &mut self.general.state,
         Lane::Assistant => &mut self.assistant.op,
      }
   }

   pub fn pending(&self, lane: Lane) -> Option<&PendingOp> {
      match lane {
         Lane::General => self.general.state.pending(),
         Lane::Assistant => self.assistant.op.pending(),
      }
   }

   pub const fn next_seq(&mut self) -> u32 {
      self.next_seq = self.next_seq.wrapping_add(1);
      self.next_seq
   }

   // === CIG bookkeeping ===

   pub fn cig(&self, use_case: Context) -> Option<&Cig> {
      self.cigs.iter().find(|c| c.use_case == use_case)
   }

   pub fn cig_mut(&mut self, use_case: Context) -> Option<&mut Cig> {
      self.cigs.iter_mut().find(|c| c.use_case == use_case)
   }

   /// Returns the CIG serving `use_case`, allocating the lowest free id if needed.
   pub fn allocate_cig(&mut self, use_case: Context, direction: CisDirection) -> Result<u8, Failure> {
      if let Some(cig) = self.cig(use_case) {
         return Ok(cig.id);
      }
      if self.cigs.len() >= MAX_CIGS {
         return Err(Failure::InsufficientResources);
      }
      let id = (0u8..)
         .find(|id| self.cigs.iter().all(|c| c.id != *id))
         .ok_or(Failure::InsufficientResources)?;
      self.cigs.push(Cig {
         id,
         use_case,
         direction,
         next_cis: 0,
      });
      Ok(id)
   }

   pub fn drop_cig(&mut self, use_case: Context) {
      self.cigs.retain(|c| c.use_case != use_case);
   }

   /// Accepts CIS handles reported for `cid`, refusing any handle another
   /// endpoint of the group already holds.
   pub fn bind_cis(&mut self, cid: Cid, cig_id: u8, bindings: &[CisBinding]) -> OpResult {
      for (i, binding) in bindings.iter().enumerate() {
         if binding.cis_handle == 0 {
            continue;
         }
         let duplicate = Failure::DuplicateCisHandle {
            handle: binding.cis_handle,
         };
         if bindings[..i]
            .iter()
            .any(|b| b.cis_handle == binding.cis_handle && b.cis_id != binding.cis_id)
         {
            return Err(duplicate);
         }
         let taken = self.devices.iter().any(|device| {
            device.endpoints.iter().any(|ase| {
               ase.cis_handle == binding.cis_handle
                  && !(device.cid == cid
                     && ase.cig_id == Some(cig_id)
                     && ase.cis_id == binding.cis_id)
            })
         });
         if taken {
            return Err(duplicate);
         }
      }

      let Some(device) = self.device_mut(cid) else {
         return Err(Failure::InvalidDevice);
      };
      for binding in bindings {
         for ase in device
            .endpoints
            .iter_mut()
            .filter(|ase| ase.cig_id == Some(cig_id) && ase.cis_id == binding.cis_id)
         {
            ase.cis_handle = binding.cis_handle;
         }
      }
      Ok(())
   }
}
