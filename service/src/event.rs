//! Event handling for unsolicited group indications.
//!
//! The orchestrator reports remote-driven changes (stream state, volume,
//! broadcast receive state, ...) through an [`EventBus`]; the daemon turns
//! them into D-Bus signals and persists discovered handles.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::cap::{
   arena::GroupId,
   ase::AseState,
   subclient::DeviceHandles,
   types::{Cid, Context, MicState, ReceiveState, SourceReport, VolumeState},
};

/// Indications attributed to a group and, where relevant, one of its devices.
#[derive(Debug, Clone, PartialEq)]
pub enum CapEvent {
   StreamStateChanged {
      cid: Cid,
      ase_id: u8,
      state: AseState,
      use_case: Context,
   },
   VolumeChanged {
      cid: Cid,
      state: VolumeState,
   },
   MicStateChanged {
      cid: Cid,
      state: MicState,
   },
   ReceiveStateChanged {
      cid: Cid,
      state: ReceiveState,
   },
   ReceiveStateCleared {
      cid: Cid,
      source_id: u8,
   },
   BroadcastCodeRequested {
      cid: Cid,
      source_id: u8,
   },
   SourceFound {
      cid: Cid,
      report: SourceReport,
   },
   LockReleased {
      cid: Cid,
   },
   DeviceDisconnected {
      cid: Cid,
      address: SmolStr,
   },
   /// Handles worth persisting for reuse on reconnect.
   HandlesDiscovered {
      cid: Cid,
      address: SmolStr,
      handles: DeviceHandles,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, group: GroupId, event: CapEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
