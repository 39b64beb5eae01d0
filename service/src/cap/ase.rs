//! Audio stream endpoint (ASE) tracking.
//!
//! Endpoint state only ever moves on a state reported by the remote, either
//! in the completion of a stream-endpoint sub-request or in a notification.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::{Display, FromRepr, IntoStaticStr};

use crate::cap::{
   UpdateOp,
   status::Failure,
   subclient::{AseHandle, BapHandles},
   types::{CodecConfig, Context, Direction},
};

/// Endpoint ids in one stream-endpoint request.
pub type AseIds = SmallVec<[u8; 4]>;

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   FromRepr,
   Display,
   IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum AseState {
   Idle = 0,
   DiscoverComplete = 1,
   CodecConfigured = 2,
   QosConfigured = 3,
   Enabled = 4,
   Streaming = 5,
   Disabled = 6,
   Released = 7,
}

impl AseState {
   pub const fn can_transition_to(self, next: Self) -> bool {
      use AseState::*;
      match (self, next) {
         (Idle, DiscoverComplete | CodecConfigured) => true,
         (DiscoverComplete, DiscoverComplete | CodecConfigured) => true,
         (CodecConfigured, CodecConfigured | QosConfigured | Released) => true,
         (QosConfigured, CodecConfigured | QosConfigured | Enabled | Released) => true,
         (Enabled, Enabled | Streaming | Disabled | QosConfigured | Released) => true,
         (Streaming, Streaming | Disabled | QosConfigured | Released) => true,
         (Disabled, QosConfigured | Released) => true,
         (Released, Idle | CodecConfigured | Released) => true,
         _ => false,
      }
   }

   /// States from which an endpoint may be handed a fresh codec configuration.
   pub const fn is_configurable(self) -> bool {
      matches!(
         self,
         Self::Idle
            | Self::DiscoverComplete
            | Self::CodecConfigured
            | Self::QosConfigured
            | Self::Released
      )
   }

   pub const fn is_active(self) -> bool {
      matches!(self, Self::Enabled | Self::Streaming)
   }
}

/// One stream endpoint on a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEndpoint {
   pub id: u8,
   pub handle: u16,
   pub direction: Direction,
   pub state: AseState,
   pub in_use: bool,
   pub use_case: Context,
   pub codec: Option<CodecConfig>,
   pub cig_id: Option<u8>,
   /// 0 until assigned.
   pub cis_id: u8,
   /// 0 until bound.
   pub cis_handle: u16,
}

impl StreamEndpoint {
   pub const fn new(handle: AseHandle, direction: Direction) -> Self {
      Self {
         id: handle.ase_id,
         handle: handle.handle,
         direction,
         state: AseState::Idle,
         in_use: false,
         use_case: Context::PROHIBITED,
         codec: None,
         cig_id: None,
         cis_id: 0,
         cis_handle: 0,
      }
   }

   /// Applies a state confirmed by the remote.
   pub fn apply_state(&mut self, next: AseState) -> Result<UpdateOp<AseState>, Failure> {
      if self.state == next && next != AseState::Released {
         return Ok(UpdateOp::Noop);
      }
      if !self.state.can_transition_to(next) {
         return Err(Failure::InvalidAseTransition {
            ase_id: self.id,
            from: self.state,
            to: next,
         });
      }
      let prev = std::mem::replace(&mut self.state, next);
      if matches!(next, AseState::Released | AseState::Idle) {
         self.release();
      }
      Ok(UpdateOp::Updated(prev))
   }

   /// Marks the endpoint as carrying `use_case` with `codec`.
   pub fn reserve(&mut self, use_case: Context, codec: CodecConfig) {
      self.in_use = true;
      self.use_case = use_case;
      self.codec = Some(codec);
   }

   pub fn release(&mut self) {
      self.in_use = false;
      self.use_case = Context::PROHIBITED;
      self.codec = None;
      self.cig_id = None;
      self.cis_id = 0;
      self.cis_handle = 0;
   }

   pub fn serves(&self, use_case: Context) -> bool {
      self.in_use && self.use_case == use_case
   }
}

/// Sink and source endpoints of one device, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointList {
   sink: Vec<StreamEndpoint>,
   source: Vec<StreamEndpoint>,
}

impl EndpointList {
   pub fn from_handles(handles: &BapHandles) -> Self {
      Self {
         sink: handles
            .sink_ases
            .iter()
            .map(|h| StreamEndpoint::new(*h, Direction::Sink))
            .collect(),
         source: handles
            .source_ases
            .iter()
            .map(|h| StreamEndpoint::new(*h, Direction::Source))
            .collect(),
      }
   }

   pub fn is_empty(&self) -> bool {
      self.sink.is_empty() && self.source.is_empty()
   }

   pub fn direction(&self, direction: Direction) -> &[StreamEndpoint] {
      match direction {
         Direction::Sink => &self.sink,
         Direction::Source => &self.source,
      }
   }

   pub fn iter(&self) -> impl Iterator<Item = &StreamEndpoint> {
      self.sink.iter().chain(self.source.iter())
   }

   pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamEndpoint> {
      self.sink.iter_mut().chain(self.source.iter_mut())
   }

   pub fn get(&self, ase_id: u8) -> Option<&StreamEndpoint> {
      self.iter().find(|ase| ase.id == ase_id)
   }

   pub fn get_mut(&mut self, ase_id: u8) -> Option<&mut StreamEndpoint> {
      self.iter_mut().find(|ase| ase.id == ase_id)
   }

   /// Picks the first `count` endpoints of `direction` that can take a configuration for
   /// `use_case`, or `None` when fewer qualify.
   pub fn select_configurable(
      &self,
      direction: Direction,
      use_case: Context,
      count: usize,
   ) -> Option<AseIds> {
      let picked: AseIds = self
         .direction(direction)
         .iter()
         .filter(|ase| ase.state.is_configurable() && (!ase.in_use || ase.use_case == use_case))
         .take(count)
         .map(|ase| ase.id)
         .collect();
      (picked.len() == count).then_some(picked)
   }

   /// Ids of endpoints serving `use_case` whose state satisfies `pred`.
   pub fn ids_where(&self, use_case: Context, pred: impl Fn(&StreamEndpoint) -> bool) -> AseIds {
      self
         .iter()
         .filter(|ase| ase.serves(use_case) && pred(ase))
         .map(|ase| ase.id)
         .collect()
   }

   /// Moves every endpoint not yet configured to `DiscoverComplete`.
   pub fn mark_discovered(&mut self) {
      for ase in self.iter_mut() {
         if ase.state == AseState::Idle {
            ase.state = AseState::DiscoverComplete;
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::cap::types::{FrameDuration, SamplingFrequency};

   fn endpoints(sinks: u8, sources: u8) -> EndpointList {
      let handles = BapHandles {
         sink_ases: (1..=sinks)
            .map(|id| AseHandle {
               ase_id: id,
               handle: 0x20 + u16::from(id),
            })
            .collect(),
         source_ases: (1..=sources)
            .map(|id| AseHandle {
               ase_id: 0x10 + id,
               handle: 0x40 + u16::from(id),
            })
            .collect(),
         ..Default::default()
      };
      EndpointList::from_handles(&handles)
   }

   const CODEC: CodecConfig = CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 100);

   #[test]
   fn test_forward_transitions() {
      let mut list = endpoints(1, 0);
      let ase = list.get_mut(1).unwrap();
      for next in [
         AseState::CodecConfigured,
         AseState::QosConfigured,
         AseState::Enabled,
         AseState::Streaming,
         AseState::Disabled,
         AseState::QosConfigured,
      ] {
         assert!(matches!(ase.apply_state(next), Ok(UpdateOp::Updated(_))));
      }
      assert_eq!(ase.state, AseState::QosConfigured);
   }

   #[test]
   fn test_rejects_skipped_states() {
      let mut list = endpoints(1, 0);
      let ase = list.get_mut(1).unwrap();
      let err = ase.apply_state(AseState::Streaming).unwrap_err();
      assert_eq!(
         err,
         Failure::InvalidAseTransition {
            ase_id: 1,
            from: AseState::Idle,
            to: AseState::Streaming
         }
      );
      // State untouched on rejection
      assert_eq!(ase.state, AseState::Idle);
   }

   #[test]
   fn test_same_state_is_noop() {
      let mut list = endpoints(1, 0);
      let ase = list.get_mut(1).unwrap();
      ase.apply_state(AseState::CodecConfigured).unwrap();
      assert!(matches!(ase.apply_state(AseState::CodecConfigured), Ok(UpdateOp::Noop)));
   }

   #[test]
   fn test_release_clears_binding() {
      let mut list = endpoints(1, 0);
      let ase = list.get_mut(1).unwrap();
      ase.reserve(Context::MEDIA, CODEC);
      ase.apply_state(AseState::CodecConfigured).unwrap();
      ase.cis_handle = 0x61;
      ase.cis_id = 1;
      ase.apply_state(AseState::Released).unwrap();
      assert!(!ase.in_use);
      assert_eq!(ase.cis_handle, 0);
      assert_eq!(ase.cis_id, 0);
   }

   #[test]
   fn test_select_first_n() {
      let list = endpoints(3, 1);
      let picked = list.select_configurable(Direction::Sink, Context::MEDIA, 2).unwrap();
      assert_eq!(picked.as_slice(), &[1, 2]);
      let picked = list.select_configurable(Direction::Source, Context::LIVE, 1).unwrap();
      assert_eq!(picked.as_slice(), &[0x11]);
   }

   #[test]
   fn test_select_insufficient() {
      let list = endpoints(1, 0);
      assert!(list.select_configurable(Direction::Sink, Context::MEDIA, 2).is_none());
      assert!(list.select_configurable(Direction::Source, Context::MEDIA, 1).is_none());
      assert_eq!(
         list.select_configurable(Direction::Source, Context::MEDIA, 0).as_deref(),
         Some(&[][..])
      );
   }

   #[test]
   fn test_select_skips_other_use_case() {
      let mut list = endpoints(2, 0);
      let first = list.get_mut(1).unwrap();
      first.reserve(Context::CONVERSATIONAL, CODEC);
      first.apply_state(AseState::CodecConfigured).unwrap();

      let picked = list.select_configurable(Direction::Sink, Context::MEDIA, 1).unwrap();
      assert_eq!(picked.as_slice(), &[2]);
      // Reconfiguring the same use case may reuse it
      let picked = list
         .select_configurable(Direction::Sink, Context::CONVERSATIONAL, 2)
         .unwrap();
      assert_eq!(picked.as_slice(), &[1, 2]);
   }

   #[test]
   fn test_streaming_endpoint_not_configurable() {
      let mut list = endpoints(1, 0);
      let ase = list.get_mut(1).unwrap();
      ase.reserve(Context::MEDIA, CODEC);
      for next in [
         AseState::CodecConfigured,
         AseState::QosConfigured,
         AseState::Enabled,
         AseState::Streaming,
      ] {
         ase.apply_state(next).unwrap();
      }
      assert!(list.select_configurable(Direction::Sink, Context::MEDIA, 1).is_none());
      assert_eq!(
         list.ids_where(Context::MEDIA, |ase| ase.state.is_active()).as_slice(),
         &[1]
      );
   }
}
