//! Logical operations an application can submit to a group.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use strum::{Display, EnumString, IntoStaticStr};
use tokio::sync::oneshot;

use crate::cap::{
   aggregate::Confirmation,
   status::Failure,
   subclient::{AddSource, DeviceHandles, Lane, ModifySource},
   types::{BroadcastCode, BroadcastSource, Cid, CodecConfig, Context, Metadata, Service, Target},
};

/// Channel the single confirmation of a request is delivered on.
pub type Responder = oneshot::Sender<Confirmation>;

/// `(device, source id)` pairs addressed by a broadcast-assistant request.
pub type SourceIds = SmallVec<[(Cid, u8); 2]>;

/// Application task allowed to drive a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppTask(SmolStr);

impl AppTask {
   pub fn new(name: impl Into<SmolStr>) -> Self {
      Self(name.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

/// A connection joining a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
   pub cid: Cid,
   pub address: SmolStr,
   /// Handles the application persisted from an earlier session.
   pub cached: Option<DeviceHandles>,
}

/// Initial membership of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
   pub devices: Vec<ConnectionSpec>,
   pub set_size: u8,
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   Display,
   EnumString,
   IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
   Init,
   AddDevice,
   RemoveDevice,
   Destroy,
   DiscoverCapabilities,
   UnicastConnect,
   UnicastDisconnect,
   StartStream,
   UpdateAudio,
   StopStream,
   Mute,
   SetVolume,
   SetMicMute,
   ReadState,
   RegisterNotifications,
   UnlockSet,
   StartSourceScan,
   StopSourceScan,
   SyncToSource,
   CancelSyncToSource,
   TerminateSyncToSource,
   AddSource,
   ModifySource,
   RemoveSource,
   SetBroadcastCode,
}

/// Value a `read_state` request collects.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReadItem {
   Volume,
   Mic,
   ReceiveStates,
   SetInfo,
   AvailableContexts,
}

impl ReadItem {
   pub const fn service(self) -> Service {
      match self {
         Self::Volume => Service::Vcp,
         Self::Mic => Service::Micp,
         Self::ReceiveStates => Service::Bass,
         Self::SetInfo => Service::Csip,
         Self::AvailableContexts => Service::Bap,
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastConnect {
   pub use_case: Context,
   pub sink: Option<CodecConfig>,
   pub source: Option<CodecConfig>,
   pub sinks_per_device: u8,
   pub sources_per_device: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
   Init,
   AddDevice(ConnectionSpec),
   DiscoverCapabilities,
   UnicastConnect(UnicastConnect),
   UnicastDisconnect { use_case: Context },
   StartStream { use_case: Context, metadata: Metadata },
   UpdateAudio { use_case: Context, metadata: Metadata },
   StopStream { use_case: Context, release: bool },
   Mute(bool),
   SetVolume(u8),
   SetMicMute { target: Target, mute: bool },
   Read { target: Target, item: ReadItem },
   RegisterNotifications { services: SmallVec<[Service; 5]>, enable: bool },
   UnlockSet,
   StartSourceScan { target: Target },
   StopSourceScan { target: Target },
   SyncToSource(BroadcastSource),
   /// Abandons a sync-to-source attempt still in progress.
   CancelSyncToSource,
   /// Drops an established periodic-advertising sync.
   TerminateSyncToSource { sync_handle: u16 },
   AddSource { target: Target, add: AddSource },
   ModifySource { sources: SourceIds, modify: ModifySource },
   RemoveSource { sources: SourceIds },
   SetBroadcastCode { sources: SourceIds, code: BroadcastCode },
}

/// Step of a logical operation; each step is one fan-out/fan-in round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
   Discover,
   ReadSetInfo,
   ReadCapabilities,
   Lock,
   Unlock,
   CodecConfig,
   QosConfig,
   Enable,
   ConnectCis,
   StartReady,
   UpdateMetadata,
   Disable,
   StopReady,
   Release,
   Volume,
   Mute,
   MicMute,
   Read,
   Notify,
   Assistant,
}

impl Request {
   pub const fn kind(&self) -> OpKind {
      match self {
         Self::Init => OpKind::Init,
         Self::AddDevice(_) => OpKind::AddDevice,
         Self::DiscoverCapabilities => OpKind::DiscoverCapabilities,
         Self::UnicastConnect(_) => OpKind::UnicastConnect,
         Self::UnicastDisconnect { .. } => OpKind::UnicastDisconnect,
         Self::StartStream { .. } => OpKind::StartStream,
         Self::UpdateAudio { .. } => OpKind::UpdateAudio,
         Self::StopStream { .. } => OpKind::StopStream,
         Self::Mute(_) => OpKind::Mute,
         Self::SetVolume(_) => OpKind::SetVolume,
         Self::SetMicMute { .. } => OpKind::SetMicMute,
         Self::Read { .. } => OpKind::ReadState,
         Self::RegisterNotifications { .. } => OpKind::RegisterNotifications,
         Self::UnlockSet => OpKind::UnlockSet,
         Self::StartSourceScan { .. } => OpKind::StartSourceScan,
         Self::StopSourceScan { .. } => OpKind::StopSourceScan,
         Self::SyncToSource(_) => OpKind::SyncToSource,
         Self::CancelSyncToSource => OpKind::CancelSyncToSource,
         Self::TerminateSyncToSource { .. } => OpKind::TerminateSyncToSource,
         Self::AddSource { .. } => OpKind::AddSource,
         Self::ModifySource { .. } => OpKind::ModifySource,
         Self::RemoveSource { .. } => OpKind::RemoveSource,
         Self::SetBroadcastCode { .. } => OpKind::SetBroadcastCode,
      }
   }

   pub const fn lane(&self) -> Lane {
      match self {
         Self::StartSourceScan { .. }
         | Self::StopSourceScan { .. }
         | Self::SyncToSource(_)
         | Self::CancelSyncToSource
         | Self::TerminateSyncToSource { .. }
         | Self::AddSource { .. }
         | Self::ModifySource { .. }
         | Self::RemoveSource { .. }
         | Self::SetBroadcastCode { .. } => Lane::Assistant,
         _ => Lane::General,
      }
   }

   /// Whether a coordinated set must be locked before this request fans out.
   pub const fn requires_lock(&self) -> bool {
      matches!(
         self,
         Self::UnicastConnect(_)
            | Self::UnicastDisconnect { .. }
            | Self::StartStream { .. }
            | Self::UpdateAudio { .. }
            | Self::StopStream { .. }
            | Self::Mute(_)
            | Self::SetVolume(_)
      )
   }

   /// Whether the request addresses `cid` at all.
   pub fn matches(&self, cid: Cid) -> bool {
      match self {
         Self::AddDevice(spec) => spec.cid == cid,
         Self::SetMicMute { target, .. }
         | Self::Read { target, .. }
         | Self::StartSourceScan { target }
         | Self::StopSourceScan { target }
         | Self::AddSource { target, .. } => target.matches(cid),
         Self::ModifySource { sources, .. }
         | Self::RemoveSource { sources }
         | Self::SetBroadcastCode { sources, .. } => sources.iter().any(|(c, _)| *c == cid),
         _ => true,
      }
   }

   /// Service a device must expose to take part.
   pub const fn required_service(&self) -> Option<Service> {
      match self {
         Self::Init | Self::AddDevice(_) | Self::RegisterNotifications { .. } => None,
         Self::DiscoverCapabilities
         | Self::UnicastConnect(_)
         | Self::UnicastDisconnect { .. }
         | Self::StartStream { .. }
         | Self::UpdateAudio { .. }
         | Self::StopStream { .. } => Some(Service::Bap),
         Self::Mute(_) | Self::SetVolume(_) => Some(Service::Vcp),
         Self::SetMicMute { .. } => Some(Service::Micp),
         Self::Read { item, .. } => Some(item.service()),
         Self::UnlockSet => Some(Service::Csip),
         Self::StartSourceScan { .. }
         | Self::StopSourceScan { .. }
         | Self::SyncToSource(_)
         | Self::CancelSyncToSource
         | Self::TerminateSyncToSource { .. }
         | Self::AddSource { .. }
         | Self::ModifySource { .. }
         | Self::RemoveSource { .. }
         | Self::SetBroadcastCode { .. } => Some(Service::Bass),
      }
   }

   /// The use case a unicast request is scoped to.
   pub const fn use_case(&self) -> Option<Context> {
      match self {
         Self::UnicastConnect(UnicastConnect { use_case, .. })
         | Self::UnicastDisconnect { use_case }
         | Self::StartStream { use_case, .. }
         | Self::UpdateAudio { use_case, .. }
         | Self::StopStream { use_case, .. } => Some(*use_case),
         _ => None,
      }
   }

   /// Rounds this request runs after any lock acquisition.
   pub const fn plan(&self) -> &'static [Phase] {
      use Phase::*;
      match self {
         Self::Init | Self::AddDevice(_) => &[Discover, ReadSetInfo],
         Self::DiscoverCapabilities => &[ReadCapabilities],
         Self::UnicastConnect(_) => &[CodecConfig, QosConfig],
         Self::UnicastDisconnect { .. } => &[Release],
         Self::StartStream { .. } => &[Enable, ConnectCis, StartReady],
         Self::UpdateAudio { .. } => &[UpdateMetadata],
         Self::StopStream { release: false, .. } => &[Disable, StopReady],
         Self::StopStream { release: true, .. } => &[Disable, StopReady, Release],
         Self::Mute(_) => &[Mute],
         Self::SetVolume(_) => &[Volume],
         Self::SetMicMute { .. } => &[MicMute],
         Self::Read { .. } => &[Read],
         Self::RegisterNotifications { .. } => &[Notify],
         Self::UnlockSet => &[Unlock],
         Self::StartSourceScan { .. }
         | Self::StopSourceScan { .. }
         | Self::SyncToSource(_)
         | Self::CancelSyncToSource
         | Self::TerminateSyncToSource { .. }
         | Self::AddSource { .. }
         | Self::ModifySource { .. }
         | Self::RemoveSource { .. }
         | Self::SetBroadcastCode { .. } => &[Assistant],
      }
   }
}

/// A request waiting in a group's queue.
#[derive(Debug)]
pub struct QueuedRequest {
   pub task: AppTask,
   pub request: Request,
   pub reply: Responder,
}

/// The logical operation currently owning a lane of a group.
#[derive(Debug)]
pub struct PendingOp {
   pub seq: u32,
   pub task: AppTask,
   pub request: Request,
   pub phase: Phase,
   step: usize,
   /// Releasing partially acquired locks after a failed acquisition.
   pub recovering: bool,
   /// Devices this operation sent a lock write to. Recovery unlocks only these.
   pub acquired: SmallVec<[Cid; 2]>,
   /// Devices addressed by this operation, in record order.
   pub touched: SmallVec<[Cid; 2]>,
   /// Overrides the aggregated result.
   pub verdict: Option<Failure>,
   reply: Option<Responder>,
}

impl PendingOp {
   pub fn new(seq: u32, queued: QueuedRequest) -> Self {
      let phase = queued.request.plan()[0];
      Self {
         seq,
         task: queued.task,
         request: queued.request,
         phase,
         step: 0,
         recovering: false,
         acquired: SmallVec::new(),
         touched: SmallVec::new(),
         verdict: None,
         reply: Some(queued.reply),
      }
   }

   /// Enters the lock round ahead of the plan.
   pub const fn lock_first(&mut self) {
      self.phase = Phase::Lock;
   }

   /// Moves to the following round, returning `false` once the operation is done.
   pub fn advance(&mut self, lock_failed: bool) -> bool {
      if self.phase == Phase::Lock && !self.recovering {
         if lock_failed {
            self.recovering = true;
            self.verdict = Some(Failure::LockUnavailable);
            self.phase = Phase::Unlock;
         } else {
            self.phase = self.request.plan()[0];
            self.step = 0;
         }
         return true;
      }
      if self.recovering {
         return false;
      }
      let plan = self.request.plan();
      if self.step + 1 < plan.len() {
         self.step += 1;
         self.phase = plan[self.step];
         true
      } else {
         false
      }
   }

   pub fn touch(&mut self, cid: Cid) {
      if !self.touched.contains(&cid) {
         self.touched.push(cid);
      }
   }

   /// Delivers the confirmation; later calls are ignored.
   pub fn respond(&mut self, confirmation: Confirmation) {
      if let Some(reply) = self.reply.take() {
         let _ = reply.send(confirmation);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn pending(request: Request) -> PendingOp {
      let (reply, _rx) = oneshot::channel();
      PendingOp::new(
         1,
         QueuedRequest {
            task: AppTask::new("test"),
            request,
            reply,
         },
      )
   }

   #[test]
   fn test_plan_walk() {
      let mut op = pending(Request::StopStream {
         use_case: Context::MEDIA,
         release: true,
      });
      assert_eq!(op.phase, Phase::Disable);
      assert!(op.advance(false));
      assert_eq!(op.phase, Phase::StopReady);
      assert!(op.advance(false));
      assert_eq!(op.phase, Phase::Release);
      assert!(!op.advance(false));
   }

   #[test]
   fn test_lock_then_plan() {
      let mut op = pending(Request::Mute(true));
      op.lock_first();
      assert_eq!(op.phase, Phase::Lock);
      assert!(op.advance(false));
      assert_eq!(op.phase, Phase::Mute);
      assert!(!op.advance(false));
      assert_eq!(op.verdict, None);
   }

   #[test]
   fn test_lock_failure_recovers() {
      let mut op = pending(Request::UpdateAudio {
         use_case: Context::MEDIA,
         metadata: Metadata::new(),
      });
      op.lock_first();
      assert!(op.advance(true));
      assert_eq!(op.phase, Phase::Unlock);
      assert_eq!(op.verdict, Some(Failure::LockUnavailable));
      // Never reaches the metadata update
      assert!(!op.advance(false));
      assert_eq!(op.phase, Phase::Unlock);
   }

   #[test]
   fn test_matches() {
      let sources: SourceIds = SmallVec::from_slice(&[(Cid(2), 1)]);
      let request = Request::RemoveSource { sources };
      assert!(request.matches(Cid(2)));
      assert!(!request.matches(Cid(1)));
      assert!(Request::Mute(true).matches(Cid(9)));
      assert!(
         Request::Read {
            target: Target::Device(Cid(4)),
            item: ReadItem::Mic
         }
         .matches(Cid(4))
      );
   }

   #[test]
   fn test_lanes() {
      assert_eq!(Request::Mute(false).lane(), Lane::General);
      assert_eq!(
         Request::StartSourceScan { target: Target::All }.lane(),
         Lane::Assistant
      );
      assert!(Request::SetVolume(3).requires_lock());
      assert!(!Request::UnlockSet.requires_lock());
   }
}
