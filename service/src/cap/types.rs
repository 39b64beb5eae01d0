//! LE Audio vocabulary shared by the orchestrator and the sub-client adapters.
//!
//! Contains connection identifiers, audio contexts, codec and QoS settings,
//! and the broadcast-assistant data carried between `capd` and its remotes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Raw characteristic payload.
pub type Packet = SmallVec<[u8; 32]>;

/// LTV-encoded metadata attached to an endpoint.
pub type Metadata = SmallVec<[u8; 16]>;

/// 16-byte broadcast code protecting an encrypted BIG.
pub type BroadcastCode = [u8; 16];

/// Identifies one remote LE connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Cid(pub u32);

impl fmt::Display for Cid {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "cid:{:#06x}", self.0)
   }
}

/// Device filter of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Target {
   #[default]
   All,
   Device(Cid),
}

impl Target {
   /// Builds a target from the raw connection id, where zero means every device.
   pub const fn from_raw(cid: u32) -> Self {
      if cid == 0 {
         Self::All
      } else {
         Self::Device(Cid(cid))
      }
   }

   pub fn matches(self, cid: Cid) -> bool {
      match self {
         Self::All => true,
         Self::Device(want) => want == cid,
      }
   }
}

/// Underlying GATT services driven through sub-client adapters.
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
   EnumIter,
   EnumString,
   IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Service {
   Bap,
   Csip,
   Vcp,
   Micp,
   Bass,
}

impl Service {
   /// Only stream endpoints are required for a device to join a group.
   pub const fn is_mandatory(self) -> bool {
      matches!(self, Self::Bap)
   }

   /// Primary service UUID (16-bit alias).
   pub const fn uuid16(self) -> u16 {
      match self {
         Self::Bap => 0x184E,
         Self::Csip => 0x1846,
         Self::Vcp => 0x1844,
         Self::Micp => 0x184D,
         Self::Bass => 0x184F,
      }
   }
}

/// Direction of an audio stream endpoint, seen from the remote device.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
   Sink,
   Source,
}

/// Which CIS directions a use case needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CisDirection {
   Sink,
   Source,
   Bidirectional,
}

impl CisDirection {
   pub const fn has(self, direction: Direction) -> bool {
      matches!(
         (self, direction),
         (Self::Bidirectional, _)
            | (Self::Sink, Direction::Sink)
            | (Self::Source, Direction::Source)
      )
   }
}

pub const KNOWN_CONTEXTS: &[(u16, &str)] = &[
   (Context::UNSPECIFIED.bits(), "unspecified"),
   (Context::CONVERSATIONAL.bits(), "conversational"),
   (Context::MEDIA.bits(), "media"),
   (Context::GAME.bits(), "game"),
   (Context::INSTRUCTIONAL.bits(), "instructional"),
   (Context::VOICE_ASSISTANT.bits(), "voice_assistant"),
   (Context::LIVE.bits(), "live"),
   (Context::SOUND_EFFECTS.bits(), "sound_effects"),
   (Context::NOTIFICATIONS.bits(), "notifications"),
   (Context::RINGTONE.bits(), "ringtone"),
   (Context::ALERTS.bits(), "alerts"),
   (Context::EMERGENCY_ALARM.bits(), "emergency_alarm"),
];

/// Audio context bitmask; a single bit names a use case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Context(u16);

impl Context {
   pub const PROHIBITED: Self = Self(0x0000);
   pub const UNSPECIFIED: Self = Self(0x0001);
   pub const CONVERSATIONAL: Self = Self(0x0002);
   pub const MEDIA: Self = Self(0x0004);
   pub const GAME: Self = Self(0x0008);
   pub const INSTRUCTIONAL: Self = Self(0x0010);
   pub const VOICE_ASSISTANT: Self = Self(0x0020);
   pub const LIVE: Self = Self(0x0040);
   pub const SOUND_EFFECTS: Self = Self(0x0080);
   pub const NOTIFICATIONS: Self = Self(0x0100);
   pub const RINGTONE: Self = Self(0x0200);
   pub const ALERTS: Self = Self(0x0400);
   pub const EMERGENCY_ALARM: Self = Self(0x0800);

   const SINK_ONLY: u16 = Self::UNSPECIFIED.0
      | Self::MEDIA.0
      | Self::GAME.0
      | Self::INSTRUCTIONAL.0
      | Self::SOUND_EFFECTS.0
      | Self::NOTIFICATIONS.0
      | Self::RINGTONE.0
      | Self::ALERTS.0
      | Self::EMERGENCY_ALARM.0;
   const SOURCE_ONLY: u16 = Self::LIVE.0;
   const BIDIRECTIONAL: u16 = Self::CONVERSATIONAL.0 | Self::VOICE_ASSISTANT.0;

   pub const fn from_bits(bits: u16) -> Self {
      Self(bits)
   }

   pub const fn bits(self) -> u16 {
      self.0
   }

   pub const fn is_empty(self) -> bool {
      self.0 == 0
   }

   /// Whether every bit of `other` is set in `self`.
   pub const fn contains(self, other: Self) -> bool {
      other.0 != 0 && self.0 & other.0 == other.0
   }

   pub const fn union(self, other: Self) -> Self {
      Self(self.0 | other.0)
   }

   /// Stream directions the use case needs; `None` unless exactly one context bit is set.
   pub const fn cis_direction(self) -> Option<CisDirection> {
      if !self.0.is_power_of_two() {
         return None;
      }
      if self.0 & Self::BIDIRECTIONAL != 0 {
         Some(CisDirection::Bidirectional)
      } else if self.0 & Self::SOURCE_ONLY != 0 {
         Some(CisDirection::Source)
      } else if self.0 & Self::SINK_ONLY != 0 {
         Some(CisDirection::Sink)
      } else {
         None
      }
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      KNOWN_CONTEXTS
         .iter()
         .find(|(bits, _)| *bits == self.0)
         .map(|(_, name)| *name)
   }
}

impl FromStr for Context {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      for (bits, name) in KNOWN_CONTEXTS {
         if name.eq_ignore_ascii_case(s) {
            return Ok(Self(*bits));
         }
      }
      Err(strum::ParseError::VariantNotFound)
   }
}

impl fmt::Display for Context {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.try_to_str() {
         Some(name) => f.write_str(name),
         None => write!(f, "{:#06x}", self.0),
      }
   }
}

/// Contexts a remote currently accepts, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvailableContexts {
   pub sink: Context,
   pub source: Context,
}

impl AvailableContexts {
   pub const fn get(&self, direction: Direction) -> Context {
      match direction {
         Direction::Sink => self.sink,
         Direction::Source => self.source,
      }
   }
}

// === Codec Settings ===

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   PartialOrd,
   Ord,
   Hash,
   Serialize,
   Deserialize,
   FromRepr,
   Display,
   EnumString,
   IntoStaticStr,
)]
pub enum SamplingFrequency {
   #[strum(serialize = "8000")]
   Hz8000 = 0x01,
   #[strum(serialize = "16000")]
   Hz16000 = 0x03,
   #[strum(serialize = "24000")]
   Hz24000 = 0x05,
   #[strum(serialize = "32000")]
   Hz32000 = 0x06,
   #[strum(serialize = "44100")]
   Hz44100 = 0x07,
   #[strum(serialize = "48000")]
   Hz48000 = 0x08,
}

impl SamplingFrequency {
   /// Bit of this frequency in a PAC "supported sampling frequencies" field.
   pub const fn pac_bit(self) -> u16 {
      1 << (self as u8 - 1)
   }
}

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
   EnumString,
   IntoStaticStr,
)]
pub enum FrameDuration {
   #[strum(serialize = "7.5ms")]
   Ms7_5 = 0x00,
   #[strum(serialize = "10ms")]
   Ms10 = 0x01,
}

impl FrameDuration {
   pub const fn micros(self) -> u32 {
      match self {
         Self::Ms7_5 => 7_500,
         Self::Ms10 => 10_000,
      }
   }

   /// Bit of this duration in a PAC "supported frame durations" field.
   pub const fn pac_bit(self) -> u8 {
      1 << self as u8
   }
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   FromRepr,
   Display,
   EnumString,
   IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TargetLatency {
   Low = 0x01,
   #[default]
   Balanced = 0x02,
   HighReliability = 0x03,
}

/// Codec configuration applied to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
   pub codec_id: u8,
   pub sampling: SamplingFrequency,
   pub frame_duration: FrameDuration,
   pub octets_per_frame: u16,
   pub target_latency: TargetLatency,
}

/// QoS parameters written with "configure QoS".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosParams {
   pub sdu_interval_us: u32,
   pub framing: u8,
   pub phy: u8,
   pub max_sdu: u16,
   pub retransmissions: u8,
   pub max_transport_latency_ms: u16,
   pub presentation_delay_us: u32,
}

/// 2M PHY preference.
const PHY_2M: u8 = 0x02;
/// Presentation delay requested for every unicast stream
const PRESENTATION_DELAY_US: u32 = 40_000;

impl CodecConfig {
   pub const LC3: u8 = 0x06;

   pub const fn lc3(
      sampling: SamplingFrequency,
      frame_duration: FrameDuration,
      octets_per_frame: u16,
   ) -> Self {
      Self {
         codec_id: Self::LC3,
         sampling,
         frame_duration,
         octets_per_frame,
         target_latency: TargetLatency::Balanced,
      }
   }

   #[must_use]
   pub const fn with_latency(mut self, target_latency: TargetLatency) -> Self {
      self.target_latency = target_latency;
      self
   }

   /// Derives the QoS settings recommended for this codec configuration.
   pub fn qos(&self) -> QosParams {
      let high_reliability = self.target_latency == TargetLatency::HighReliability;
      let hi_rate = self.sampling >= SamplingFrequency::Hz44100;

      let retransmissions = match (high_reliability, hi_rate) {
         (true, _) => 13,
         (false, true) => 5,
         (false, false) => 2,
      };
      let max_transport_latency_ms = match (self.frame_duration, high_reliability) {
         (FrameDuration::Ms7_5, true) => 75,
         (FrameDuration::Ms10, true) => 95,
         (FrameDuration::Ms7_5, false) if hi_rate => 15,
         (FrameDuration::Ms7_5, false) => 8,
         (FrameDuration::Ms10, false) if hi_rate => 20,
         (FrameDuration::Ms10, false) => 10,
      };

      QosParams {
         sdu_interval_us: self.frame_duration.micros(),
         framing: u8::from(self.sampling == SamplingFrequency::Hz44100),
         phy: PHY_2M,
         max_sdu: self.octets_per_frame,
         retransmissions,
         max_transport_latency_ms,
         presentation_delay_us: PRESENTATION_DELAY_US,
      }
   }
}

/// One published audio capability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacRecord {
   pub codec_id: u8,
   pub sampling_frequencies: u16,
   pub frame_durations: u8,
   pub min_octets: u16,
   pub max_octets: u16,
   pub preferred_contexts: Context,
}

impl PacRecord {
   pub fn supports(&self, config: &CodecConfig) -> bool {
      self.codec_id == config.codec_id
         && self.sampling_frequencies & config.sampling.pac_bit() != 0
         && self.frame_durations & config.frame_duration.pac_bit() != 0
         && (self.min_octets..=self.max_octets).contains(&config.octets_per_frame)
   }
}

/// Published capabilities of one remote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
   pub sink: SmallVec<[PacRecord; 2]>,
   pub source: SmallVec<[PacRecord; 2]>,
   pub available: AvailableContexts,
   pub supported: AvailableContexts,
}

impl Capabilities {
   pub fn records(&self, direction: Direction) -> &[PacRecord] {
      match direction {
         Direction::Sink => &self.sink,
         Direction::Source => &self.source,
      }
   }

   pub fn supports(&self, direction: Direction, config: &CodecConfig) -> bool {
      self.records(direction).iter().any(|pac| pac.supports(config))
   }
}

/// Builds the "streaming audio contexts" metadata entry followed by `extra`.
pub fn streaming_metadata(use_case: Context, extra: &[u8]) -> Metadata {
   let [lo, hi] = use_case.bits().to_le_bytes();
   let mut meta = Metadata::from_slice(&[0x03, 0x02, lo, hi]);
   meta.extend_from_slice(extra);
   meta
}

// === Volume / Microphone ===

/// Rendering state reported by a volume renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeState {
   pub volume: u8,
   pub mute: bool,
   pub change_counter: u8,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   FromRepr,
   Display,
   IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum MicState {
   Unmuted = 0x00,
   Muted = 0x01,
   Disabled = 0x02,
}

/// Coordinated-set membership of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetInfo {
   pub size: u8,
   pub rank: u8,
   pub locked: bool,
}

// === Broadcast Assistant ===

/// Advertiser address of a broadcast source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceAddress {
   pub addr: [u8; 6],
   pub random: bool,
}

impl fmt::Display for SourceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.addr;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

/// A periodic-advertising broadcast source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSource {
   pub address: SourceAddress,
   pub adv_sid: u8,
   pub broadcast_id: u32,
   pub pa_interval: u16,
}

/// BIS selection and metadata of one subgroup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Subgroup {
   pub bis_sync: u32,
   pub metadata: Metadata,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   FromRepr,
   Display,
   EnumString,
   IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum PaSync {
   #[default]
   NoSync = 0x00,
   SyncPast = 0x01,
   SyncNoPast = 0x02,
}

#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRepr, Display, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum PaSyncState {
   NotSynced = 0x00,
   SyncInfoRequest = 0x01,
   Synced = 0x02,
   FailedToSync = 0x03,
   NoPast = 0x04,
}

#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRepr, Display, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum BigEncryption {
   NotEncrypted = 0x00,
   CodeRequired = 0x01,
   Decrypting = 0x02,
   BadCode = 0x03,
}

/// Broadcast receive state reported by a scan delegator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveState {
   pub source_id: u8,
   pub source: BroadcastSource,
   pub pa_sync_state: PaSyncState,
   pub encryption: BigEncryption,
   pub subgroups: SmallVec<[Subgroup; 1]>,
}

/// Broadcast source seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
   pub source: BroadcastSource,
   pub name: Option<SmolStr>,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_context_directions() {
      assert_eq!(Context::MEDIA.cis_direction(), Some(CisDirection::Sink));
      assert_eq!(Context::LIVE.cis_direction(), Some(CisDirection::Source));
      assert_eq!(
         Context::CONVERSATIONAL.cis_direction(),
         Some(CisDirection::Bidirectional)
      );
      // A use case must be exactly one context
      assert_eq!(Context::MEDIA.union(Context::GAME).cis_direction(), None);
      assert_eq!(Context::PROHIBITED.cis_direction(), None);
   }

   #[test]
   fn test_context_names() {
      assert_eq!("media".parse::<Context>().unwrap(), Context::MEDIA);
      assert_eq!("Voice_Assistant".parse::<Context>().unwrap(), Context::VOICE_ASSISTANT);
      assert!("podcast".parse::<Context>().is_err());
      assert_eq!(Context::RINGTONE.to_string(), "ringtone");
      assert_eq!(Context::from_bits(0x1000).to_string(), "0x1000");
   }

   #[test]
   fn test_context_contains() {
      let available = Context::MEDIA.union(Context::CONVERSATIONAL);
      assert!(available.contains(Context::MEDIA));
      assert!(!available.contains(Context::LIVE));
      assert!(!available.contains(Context::PROHIBITED));
   }

   #[test]
   fn test_qos_from_codec() {
      let qos = CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 100).qos();
      assert_eq!(qos.sdu_interval_us, 10_000);
      assert_eq!(qos.max_sdu, 100);
      assert_eq!(qos.retransmissions, 5);
      assert_eq!(qos.max_transport_latency_ms, 20);
      assert_eq!(qos.framing, 0);

      let qos = CodecConfig::lc3(SamplingFrequency::Hz16000, FrameDuration::Ms7_5, 30)
         .with_latency(TargetLatency::HighReliability)
         .qos();
      assert_eq!(qos.sdu_interval_us, 7_500);
      assert_eq!(qos.retransmissions, 13);
      assert_eq!(qos.max_transport_latency_ms, 75);

      let qos = CodecConfig::lc3(SamplingFrequency::Hz44100, FrameDuration::Ms10, 97).qos();
      assert_eq!(qos.framing, 1);
   }

   #[test]
   fn test_pac_supports() {
      let pac = PacRecord {
         codec_id: CodecConfig::LC3,
         sampling_frequencies: SamplingFrequency::Hz16000.pac_bit()
            | SamplingFrequency::Hz48000.pac_bit(),
         frame_durations: FrameDuration::Ms10.pac_bit(),
         min_octets: 40,
         max_octets: 120,
         preferred_contexts: Context::MEDIA,
      };
      assert!(pac.supports(&CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 100)));
      assert!(!pac.supports(&CodecConfig::lc3(SamplingFrequency::Hz24000, FrameDuration::Ms10, 60)));
      assert!(!pac.supports(&CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms7_5, 100)));
      assert!(!pac.supports(&CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 155)));
   }

   #[test]
   fn test_streaming_metadata() {
      let meta = streaming_metadata(Context::MEDIA, &[0x02, 0x05, 0x01]);
      assert_eq!(meta.as_slice(), &[0x03, 0x02, 0x04, 0x00, 0x02, 0x05, 0x01]);
   }

   #[test]
   fn test_target_from_raw() {
      assert_eq!(Target::from_raw(0), Target::All);
      assert!(Target::from_raw(0).matches(Cid(7)));
      assert!(Target::from_raw(7).matches(Cid(7)));
      assert!(!Target::from_raw(7).matches(Cid(8)));
   }
}
