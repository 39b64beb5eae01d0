//! Boundary between the orchestrator and the per-service sub-client adapters.
//!
//! The orchestrator hands each adapter a [`Ticket`] together with a
//! [`SubRequest`]. The adapter performs the GATT procedure on its own time and
//! reports back exactly once per ticket with a [`SubOutcome`]. Unsolicited
//! remote changes arrive separately as [`SubNotification`]s.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::cap::{
   arena::GroupId,
   ase::{AseIds, AseState},
   status::Failure,
   types::{
      BroadcastCode, BroadcastSource, Capabilities, AvailableContexts, Cid, CodecConfig,
      Direction, Metadata, MicState, PaSync, QosParams, ReceiveState, Service, SetInfo,
      SourceReport, Subgroup, VolumeState,
   },
};

/// Independent in-flight slots of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
   /// Queued logical operations.
   General,
   /// Broadcast-assistant operations.
   Assistant,
}

/// Correlates one sub-request with the fan-out slot that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
   pub group: GroupId,
   pub cid: Cid,
   pub lane: Lane,
   pub seq: u32,
   pub service: Service,
}

// === Cached Handles ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AseHandle {
   pub ase_id: u8,
   pub handle: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BapHandles {
   pub service: u16,
   pub control_point: u16,
   pub sink_ases: SmallVec<[AseHandle; 2]>,
   pub source_ases: SmallVec<[AseHandle; 2]>,
   pub pacs_service: u16,
   pub sink_pac: Option<u16>,
   pub source_pac: Option<u16>,
   pub available_contexts: u16,
   pub supported_contexts: u16,
}

impl BapHandles {
   pub fn ase(&self, ase_id: u8) -> Option<(Direction, u16)> {
      let find = |list: &[AseHandle]| list.iter().find(|a| a.ase_id == ase_id).map(|a| a.handle);
      find(&self.sink_ases)
         .map(|h| (Direction::Sink, h))
         .or_else(|| find(&self.source_ases).map(|h| (Direction::Source, h)))
   }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsipHandles {
   pub service: u16,
   pub size: u16,
   pub lock: u16,
   pub rank: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpHandles {
   pub service: u16,
   pub state: u16,
   pub control_point: u16,
   pub flags: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicpHandles {
   pub service: u16,
   pub mute: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BassHandles {
   pub service: u16,
   pub control_point: u16,
   pub receive_states: SmallVec<[u16; 2]>,
}

/// Result of discovering one service on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleSet {
   Bap(BapHandles),
   Csip(CsipHandles),
   Vcp(VcpHandles),
   Micp(MicpHandles),
   Bass(BassHandles),
}

/// Every handle known for one device; `None` means absent or not yet discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandles {
   pub bap: Option<BapHandles>,
   pub csip: Option<CsipHandles>,
   pub vcp: Option<VcpHandles>,
   pub micp: Option<MicpHandles>,
   pub bass: Option<BassHandles>,
}

impl DeviceHandles {
   pub fn apply(&mut self, set: HandleSet) {
      match set {
         HandleSet::Bap(h) => self.bap = Some(h),
         HandleSet::Csip(h) => self.csip = Some(h),
         HandleSet::Vcp(h) => self.vcp = Some(h),
         HandleSet::Micp(h) => self.micp = Some(h),
         HandleSet::Bass(h) => self.bass = Some(h),
      }
   }

   pub const fn has(&self, service: Service) -> bool {
      match service {
         Service::Bap => self.bap.is_some(),
         Service::Csip => self.csip.is_some(),
         Service::Vcp => self.vcp.is_some(),
         Service::Micp => self.micp.is_some(),
         Service::Bass => self.bass.is_some(),
      }
   }

   pub const fn is_empty(&self) -> bool {
      self.bap.is_none()
         && self.csip.is_none()
         && self.vcp.is_none()
         && self.micp.is_none()
         && self.bass.is_none()
   }
}

// === Requests ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AseConfig {
   pub ase_id: u8,
   pub direction: Direction,
   pub codec: CodecConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AseQos {
   pub ase_id: u8,
   pub cig_id: u8,
   pub cis_id: u8,
   pub qos: QosParams,
}

/// Stream endpoint procedures. Each completes with the endpoint states the
/// remote confirmed, except where noted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BapRequest {
   /// Completes with [`SubResponse::Capabilities`].
   ReadCapabilities,
   /// Completes with [`SubResponse::Contexts`].
   ReadAvailableContexts,
   ConfigureCodec(SmallVec<[AseConfig; 2]>),
   ConfigureQos(SmallVec<[AseQos; 2]>),
   Enable { ases: AseIds, metadata: Metadata },
   /// Completes with [`SubResponse::CisBound`].
   ConnectCis { cig_id: u8, cis_ids: SmallVec<[u8; 2]> },
   /// Resolves once every listed endpoint streams; source endpoints get a
   /// receiver-start-ready write.
   ReceiverStartReady(AseIds),
   Disable(AseIds),
   ReceiverStopReady(AseIds),
   UpdateMetadata { ases: AseIds, metadata: Metadata },
   Release(AseIds),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsipRequest {
   SetLock(bool),
   /// Completes with [`SubResponse::SetInfo`].
   ReadSetInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpRequest {
   SetAbsoluteVolume(u8),
   SetMute(bool),
   /// Completes with [`SubResponse::Volume`].
   ReadState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicpRequest {
   SetMute(bool),
   /// Completes with [`SubResponse::Mic`].
   ReadState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSource {
   pub source: BroadcastSource,
   pub pa_sync: PaSync,
   pub subgroups: SmallVec<[Subgroup; 1]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifySource {
   pub pa_sync: PaSync,
   pub pa_interval: u16,
   pub subgroups: SmallVec<[Subgroup; 1]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BassRequest {
   RemoteScanStarted,
   RemoteScanStopped,
   SyncToSource(BroadcastSource),
   CancelSyncToSource,
   TerminateSyncToSource { sync_handle: u16 },
   AddSource(AddSource),
   ModifySource { source_id: u8, modify: ModifySource },
   RemoveSource { source_id: u8 },
   SetBroadcastCode { source_id: u8, code: BroadcastCode },
   /// Completes with [`SubResponse::ReceiveStates`].
   ReadReceiveStates,
}

/// One asynchronous unit of work for a sub-client adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubRequest {
   /// Completes with [`SubResponse::Discovered`], or `NotSupported` when the remote lacks it.
   Discover(Service),
   SetNotify { service: Service, enable: bool },
   Bap(BapRequest),
   Csip(CsipRequest),
   Vcp(VcpRequest),
   Micp(MicpRequest),
   Bass(BassRequest),
}

impl SubRequest {
   pub const fn service(&self) -> Service {
      match self {
         Self::Discover(service) | Self::SetNotify { service, .. } => *service,
         Self::Bap(_) => Service::Bap,
         Self::Csip(_) => Service::Csip,
         Self::Vcp(_) => Service::Vcp,
         Self::Micp(_) => Service::Micp,
         Self::Bass(_) => Service::Bass,
      }
   }
}

// === Completions ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CisBinding {
   pub cis_id: u8,
   pub cis_handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubResponse {
   Done,
   Discovered(HandleSet),
   Capabilities(Capabilities),
   Contexts(AvailableContexts),
   AseStates(SmallVec<[(u8, AseState); 4]>),
   CisBound(SmallVec<[CisBinding; 2]>),
   SetInfo(SetInfo),
   Volume(VolumeState),
   Mic(MicState),
   ReceiveStates(Vec<ReceiveState>),
}

pub type SubOutcome = Result<SubResponse, Failure>;

/// Unsolicited change reported by a remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubNotification {
   AseState { ase_id: u8, state: AseState },
   Contexts(AvailableContexts),
   Volume(VolumeState),
   Mic(MicState),
   LockReleased,
   ReceiveState(ReceiveState),
   /// A receive state characteristic went empty.
   ReceiveStateCleared { source_id: u8 },
   SourceFound(SourceReport),
}

/// Issues sub-requests on behalf of the orchestrator.
///
/// Implementations must not call back into the orchestrator from `issue`;
/// every outcome is delivered later through the owner's event loop.
pub trait SubClients {
   fn issue(&mut self, ticket: Ticket, request: SubRequest);

   /// Seeds an adapter with handles the application cached from an earlier session.
   fn restore(&mut self, cid: Cid, handles: &DeviceHandles);

   /// Drops all adapter state kept for a connection.
   fn release(&mut self, cid: Cid);
}
