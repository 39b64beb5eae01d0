//! Characteristic payload encoding and parsing for the LE Audio services.
//!
//! Covers the stream endpoint control point and endpoint state (ASCS), the
//! published capability records and audio contexts (PACS), the volume
//! (VCS), microphone (MICS) and coordinated set (CSIS) characteristics, and
//! the broadcast audio scan service (BASS).

use log::debug;
use smallvec::SmallVec;
use thiserror::Error;

use crate::cap::{
   ase::AseState,
   subclient::{AddSource, AseConfig, AseQos, ModifySource},
   types::{
      AvailableContexts, BigEncryption, BroadcastCode, BroadcastSource, Context, MicState,
      PacRecord, Packet, PaSyncState, ReceiveState, SetInfo, SourceAddress, Subgroup, VolumeState,
   },
};

/// Error type for characteristic payload parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
   /// Payload is too short for the expected format
   #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
   TooShort { expected: usize, actual: usize },

   /// Endpoint reported a state outside the defined range
   #[error("Unknown ASE state: 0x{0:02x}")]
   UnknownState(u8),

   /// Control point answered an opcode we never send
   #[error("Unknown opcode: 0x{0:02x}")]
   UnknownOpcode(u8),

   /// A length-type-value entry runs past its container
   #[error("Malformed LTV structure at offset {0}")]
   MalformedLtv(usize),

   /// A field holds a value outside its defined range
   #[error("Invalid {field}: 0x{value:02x}")]
   InvalidValue { field: &'static str, value: u8 },
}

pub type Result<T> = std::result::Result<T, CodecError>;

// === ASCS ===

pub const ASE_OP_CONFIG_CODEC: u8 = 0x01;
pub const ASE_OP_CONFIG_QOS: u8 = 0x02;
pub const ASE_OP_ENABLE: u8 = 0x03;
pub const ASE_OP_RECEIVER_START_READY: u8 = 0x04;
pub const ASE_OP_DISABLE: u8 = 0x05;
pub const ASE_OP_RECEIVER_STOP_READY: u8 = 0x06;
pub const ASE_OP_UPDATE_METADATA: u8 = 0x07;
pub const ASE_OP_RELEASE: u8 = 0x08;

/// 2M PHY bit used as the target PHY of every configuration.
const TARGET_PHY_2M: u8 = 0x02;

const LTV_SAMPLING_FREQUENCY: u8 = 0x01;
const LTV_FRAME_DURATION: u8 = 0x02;
const LTV_OCTETS_PER_FRAME: u8 = 0x04;
const LTV_SUPPORTED_OCTETS: u8 = 0x04;
const LTV_PREFERRED_CONTEXTS: u8 = 0x01;

struct Reader<'a> {
   data: &'a [u8],
   pos: usize,
}

impl<'a> Reader<'a> {
   const fn new(data: &'a [u8]) -> Self {
      Self { data, pos: 0 }
   }

   fn take(&mut self, n: usize) -> Result<&'a [u8]> {
      let end = self.pos + n;
      let Some(bytes) = self.data.get(self.pos..end) else {
         return Err(CodecError::TooShort {
            expected: end,
            actual: self.data.len(),
         });
      };
      self.pos = end;
      Ok(bytes)
   }

   fn u8(&mut self) -> Result<u8> {
      Ok(self.take(1)?[0])
   }

   fn u16(&mut self) -> Result<u16> {
      let b = self.take(2)?;
      Ok(u16::from_le_bytes([b[0], b[1]]))
   }

   fn u24(&mut self) -> Result<u32> {
      let b = self.take(3)?;
      Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
   }

   fn u32(&mut self) -> Result<u32> {
      let b = self.take(4)?;
      Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
   }

   const fn is_empty(&self) -> bool {
      self.pos >= self.data.len()
   }
}

fn put_u24(out: &mut Packet, value: u32) {
   out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Walks the LTV entries of `data`, calling `f` with each type and value.
fn for_each_ltv(data: &[u8], mut f: impl FnMut(u8, &[u8])) -> Result<()> {
   let mut pos = 0;
   while pos < data.len() {
      let len = data[pos] as usize;
      if len == 0 {
         pos += 1;
         continue;
      }
      let Some(entry) = data.get(pos + 1..pos + 1 + len) else {
         return Err(CodecError::MalformedLtv(pos));
      };
      f(entry[0], &entry[1..]);
      pos += 1 + len;
   }
   Ok(())
}

/// Maps an on-air endpoint state; the transient enabling, disabling and
/// releasing states report as the state they lead to.
const fn ase_state_from_wire(raw: u8) -> Option<AseState> {
   Some(match raw {
      0x00 => AseState::Idle,
      0x01 => AseState::CodecConfigured,
      0x02 => AseState::QosConfigured,
      0x03 => AseState::Enabled,
      0x04 => AseState::Streaming,
      0x05 => AseState::Disabled,
      0x06 => AseState::Released,
      _ => return None,
   })
}

/// Parses an endpoint characteristic into its id and state.
pub fn parse_ase_state(data: &[u8]) -> Result<(u8, AseState)> {
   let mut r = Reader::new(data);
   let ase_id = r.u8()?;
   let raw = r.u8()?;
   let state = ase_state_from_wire(raw).ok_or(CodecError::UnknownState(raw))?;
   Ok((ase_id, state))
}

pub fn encode_config_codec(configs: &[AseConfig]) -> Packet {
   let mut out = Packet::from_slice(&[ASE_OP_CONFIG_CODEC, configs.len() as u8]);
   for config in configs {
      let codec = &config.codec;
      let [lo, hi] = codec.octets_per_frame.to_le_bytes();
      let ltv = [
         0x02,
         LTV_SAMPLING_FREQUENCY,
         codec.sampling as u8,
         0x02,
         LTV_FRAME_DURATION,
         codec.frame_duration as u8,
         0x03,
         LTV_OCTETS_PER_FRAME,
         lo,
         hi,
      ];
      out.extend_from_slice(&[
         config.ase_id,
         codec.target_latency as u8,
         TARGET_PHY_2M,
         codec.codec_id,
         0x00,
         0x00,
         0x00,
         0x00,
         ltv.len() as u8,
      ]);
      out.extend_from_slice(&ltv);
   }
   out
}

pub fn encode_config_qos(qos: &[AseQos]) -> Packet {
   let mut out = Packet::from_slice(&[ASE_OP_CONFIG_QOS, qos.len() as u8]);
   for entry in qos {
      let q = &entry.qos;
      out.extend_from_slice(&[entry.ase_id, entry.cig_id, entry.cis_id]);
      put_u24(&mut out, q.sdu_interval_us);
      out.extend_from_slice(&[q.framing, q.phy]);
      out.extend_from_slice(&q.max_sdu.to_le_bytes());
      out.push(q.retransmissions);
      out.extend_from_slice(&q.max_transport_latency_ms.to_le_bytes());
      put_u24(&mut out, q.presentation_delay_us);
   }
   out
}

/// Enable and update-metadata share one layout.
pub fn encode_with_metadata(opcode: u8, ases: &[u8], metadata: &[u8]) -> Packet {
   let mut out = Packet::from_slice(&[opcode, ases.len() as u8]);
   for ase_id in ases {
      out.extend_from_slice(&[*ase_id, metadata.len() as u8]);
      out.extend_from_slice(metadata);
   }
   out
}

/// Receiver start/stop ready, disable and release only list endpoints.
pub fn encode_ase_ids(opcode: u8, ases: &[u8]) -> Packet {
   let mut out = Packet::from_slice(&[opcode, ases.len() as u8]);
   out.extend_from_slice(ases);
   out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpEntry {
   pub ase_id: u8,
   pub code: u8,
   pub reason: u8,
}

/// Control point notification answering one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpResponse {
   pub opcode: u8,
   pub entries: SmallVec<[CpEntry; 4]>,
}

impl CpResponse {
   /// First non-success response code, if any.
   pub fn error_code(&self) -> Option<u8> {
      self.entries.iter().find(|e| e.code != 0).map(|e| e.code)
   }
}

pub fn parse_cp_response(data: &[u8]) -> Result<CpResponse> {
   debug!("ASE control point: {}", hex::encode(data));
   let mut r = Reader::new(data);
   let opcode = r.u8()?;
   if !(ASE_OP_CONFIG_CODEC..=ASE_OP_RELEASE).contains(&opcode) {
      return Err(CodecError::UnknownOpcode(opcode));
   }
   let count = r.u8()?;
   // 0xFF reports a malformed write as a single entry
   let count = if count == 0xFF { 1 } else { count };
   let mut entries = SmallVec::new();
   for _ in 0..count {
      entries.push(CpEntry {
         ase_id: r.u8()?,
         code: r.u8()?,
         reason: r.u8()?,
      });
   }
   Ok(CpResponse { opcode, entries })
}

// === PACS ===

/// Parses a sink or source PAC characteristic.
pub fn parse_pac_records(data: &[u8]) -> Result<SmallVec<[PacRecord; 2]>> {
   debug!("PAC records: {}", hex::encode(data));
   let mut r = Reader::new(data);
   let count = r.u8()?;
   let mut records = SmallVec::new();
   for _ in 0..count {
      let codec = r.take(5)?;
      let caps_len = r.u8()? as usize;
      let caps = r.take(caps_len)?;
      let meta_len = r.u8()? as usize;
      let meta = r.take(meta_len)?;

      let mut record = PacRecord {
         codec_id: codec[0],
         sampling_frequencies: 0,
         frame_durations: 0,
         min_octets: 0,
         max_octets: 0,
         preferred_contexts: Context::UNSPECIFIED,
      };
      for_each_ltv(caps, |ty, value| match (ty, value) {
         (LTV_SAMPLING_FREQUENCY, [lo, hi, ..]) => {
            record.sampling_frequencies = u16::from_le_bytes([*lo, *hi]);
         },
         (LTV_FRAME_DURATION, [bits, ..]) => record.frame_durations = *bits,
         (LTV_SUPPORTED_OCTETS, [a, b, c, d, ..]) => {
            record.min_octets = u16::from_le_bytes([*a, *b]);
            record.max_octets = u16::from_le_bytes([*c, *d]);
         },
         _ => {},
      })?;
      for_each_ltv(meta, |ty, value| {
         if let (LTV_PREFERRED_CONTEXTS, [lo, hi, ..]) = (ty, value) {
            record.preferred_contexts = Context::from_bits(u16::from_le_bytes([*lo, *hi]));
         }
      })?;
      records.push(record);
   }
   Ok(records)
}

/// Parses the available or supported audio contexts characteristic.
pub fn parse_contexts(data: &[u8]) -> Result<AvailableContexts> {
   let mut r = Reader::new(data);
   Ok(AvailableContexts {
      sink: Context::from_bits(r.u16()?),
      source: Context::from_bits(r.u16()?),
   })
}

// === VCS / MICS ===

pub const VCP_OP_UNMUTE: u8 = 0x05;
pub const VCP_OP_MUTE: u8 = 0x06;
pub const VCP_OP_SET_ABSOLUTE_VOLUME: u8 = 0x04;

pub fn parse_volume_state(data: &[u8]) -> Result<VolumeState> {
   let mut r = Reader::new(data);
   Ok(VolumeState {
      volume: r.u8()?,
      mute: r.u8()? != 0,
      change_counter: r.u8()?,
   })
}

pub fn encode_set_volume(change_counter: u8, volume: u8) -> Packet {
   Packet::from_slice(&[VCP_OP_SET_ABSOLUTE_VOLUME, change_counter, volume])
}

pub fn encode_set_mute(change_counter: u8, mute: bool) -> Packet {
   let opcode = if mute { VCP_OP_MUTE } else { VCP_OP_UNMUTE };
   Packet::from_slice(&[opcode, change_counter])
}

pub fn parse_mic_state(data: &[u8]) -> Result<MicState> {
   let raw = Reader::new(data).u8()?;
   MicState::from_repr(raw).ok_or(CodecError::InvalidValue {
      field: "mute state",
      value: raw,
   })
}

// === CSIS ===

const CSIS_UNLOCKED: u8 = 0x01;
const CSIS_LOCKED: u8 = 0x02;

pub const fn encode_lock(lock: bool) -> [u8; 1] {
   if lock { [CSIS_LOCKED] } else { [CSIS_UNLOCKED] }
}

pub fn parse_lock(data: &[u8]) -> Result<bool> {
   match Reader::new(data).u8()? {
      CSIS_UNLOCKED => Ok(false),
      CSIS_LOCKED => Ok(true),
      value => Err(CodecError::InvalidValue {
         field: "set lock",
         value,
      }),
   }
}

pub fn parse_set_info(size: &[u8], rank: &[u8], lock: &[u8]) -> Result<SetInfo> {
   Ok(SetInfo {
      size: Reader::new(size).u8()?,
      rank: Reader::new(rank).u8()?,
      locked: parse_lock(lock)?,
   })
}

// === BASS ===

pub const BASS_OP_SCAN_STOPPED: u8 = 0x00;
pub const BASS_OP_SCAN_STARTED: u8 = 0x01;
pub const BASS_OP_ADD_SOURCE: u8 = 0x02;
pub const BASS_OP_MODIFY_SOURCE: u8 = 0x03;
pub const BASS_OP_SET_BROADCAST_CODE: u8 = 0x04;
pub const BASS_OP_REMOVE_SOURCE: u8 = 0x05;

fn put_subgroups(out: &mut Packet, subgroups: &[Subgroup]) {
   out.push(subgroups.len() as u8);
   for subgroup in subgroups {
      out.extend_from_slice(&subgroup.bis_sync.to_le_bytes());
      out.push(subgroup.metadata.len() as u8);
      out.extend_from_slice(&subgroup.metadata);
   }
}

/// Wire addresses are little endian; `SourceAddress` keeps display order.
fn put_address(out: &mut Packet, address: &SourceAddress) {
   out.push(u8::from(address.random));
   out.extend(address.addr.iter().rev().copied());
}

pub fn encode_add_source(add: &AddSource) -> Packet {
   let source = &add.source;
   let mut out = Packet::from_slice(&[BASS_OP_ADD_SOURCE]);
   put_address(&mut out, &source.address);
   out.push(source.adv_sid);
   put_u24(&mut out, source.broadcast_id);
   out.push(add.pa_sync as u8);
   out.extend_from_slice(&source.pa_interval.to_le_bytes());
   put_subgroups(&mut out, &add.subgroups);
   out
}

pub fn encode_modify_source(source_id: u8, modify: &ModifySource) -> Packet {
   let mut out = Packet::from_slice(&[BASS_OP_MODIFY_SOURCE, source_id, modify.pa_sync as u8]);
   out.extend_from_slice(&modify.pa_interval.to_le_bytes());
   put_subgroups(&mut out, &modify.subgroups);
   out
}

pub fn encode_set_broadcast_code(source_id: u8, code: &BroadcastCode) -> Packet {
   let mut out = Packet::from_slice(&[BASS_OP_SET_BROADCAST_CODE, source_id]);
   out.extend_from_slice(code);
   out
}

pub fn encode_remove_source(source_id: u8) -> Packet {
   Packet::from_slice(&[BASS_OP_REMOVE_SOURCE, source_id])
}

pub fn encode_scan(started: bool) -> Packet {
   let opcode = if started { BASS_OP_SCAN_STARTED } else { BASS_OP_SCAN_STOPPED };
   Packet::from_slice(&[opcode])
}

/// Parses a receive state characteristic; an empty one holds no source.
pub fn parse_receive_state(data: &[u8]) -> Result<Option<ReceiveState>> {
   if data.is_empty() {
      return Ok(None);
   }
   debug!("Receive state: {}", hex::encode(data));
   let mut r = Reader::new(data);
   let source_id = r.u8()?;
   let random = match r.u8()? {
      0 => false,
      1 => true,
      value => {
         return Err(CodecError::InvalidValue {
            field: "address type",
            value,
         });
      },
   };
   let mut addr = [0u8; 6];
   for (dst, src) in addr.iter_mut().zip(r.take(6)?.iter().rev()) {
      *dst = *src;
   }
   let adv_sid = r.u8()?;
   let broadcast_id = r.u24()?;

   let raw = r.u8()?;
   let pa_sync_state = PaSyncState::from_repr(raw).ok_or(CodecError::InvalidValue {
      field: "PA sync state",
      value: raw,
   })?;
   let raw = r.u8()?;
   let encryption = BigEncryption::from_repr(raw).ok_or(CodecError::InvalidValue {
      field: "BIG encryption",
      value: raw,
   })?;
   if encryption == BigEncryption::BadCode {
      r.take(16)?;
   }

   let count = r.u8()?;
   let mut subgroups = SmallVec::new();
   for _ in 0..count {
      let bis_sync = r.u32()?;
      let len = r.u8()? as usize;
      subgroups.push(Subgroup {
         bis_sync,
         metadata: SmallVec::from_slice(r.take(len)?),
      });
   }
   if !r.is_empty() {
      debug!("Ignoring trailing receive state bytes");
   }

   Ok(Some(ReceiveState {
      source_id,
      source: BroadcastSource {
         address: SourceAddress { addr, random },
         adv_sid,
         broadcast_id,
         // Not carried by the receive state
         pa_interval: 0xFFFF,
      },
      pa_sync_state,
      encryption,
      subgroups,
   }))
}

#[cfg(test)]
mod tests {
   use smallvec::smallvec;

   use super::*;
   use crate::cap::types::{
      CodecConfig, Direction, FrameDuration, PaSync, SamplingFrequency, TargetLatency,
   };

   #[test]
   fn test_parse_ase_state() {
      assert_eq!(parse_ase_state(&[0x03, 0x04, 0xAA]), Ok((3, AseState::Streaming)));
      assert_eq!(parse_ase_state(&[0x01, 0x06]), Ok((1, AseState::Released)));
      assert_eq!(parse_ase_state(&[0x03, 0x07]), Err(CodecError::UnknownState(7)));
      assert_eq!(
         parse_ase_state(&[0x03]),
         Err(CodecError::TooShort {
            expected: 2,
            actual: 1
         })
      );
   }

   #[test]
   fn test_encode_config_codec() {
      let codec = CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 100)
         .with_latency(TargetLatency::Low);
      let packet = encode_config_codec(&[AseConfig {
         ase_id: 2,
         direction: Direction::Sink,
         codec,
      }]);
      assert_eq!(
         packet.as_slice(),
         &[
            0x01, 0x01, // opcode, one endpoint
            0x02, 0x01, 0x02, // ase, low latency, 2M
            0x06, 0x00, 0x00, 0x00, 0x00, // LC3
            0x0A, // config length
            0x02, 0x01, 0x08, // 48 kHz
            0x02, 0x02, 0x01, // 10 ms
            0x03, 0x04, 0x64, 0x00, // 100 octets
         ]
      );
   }

   #[test]
   fn test_encode_config_qos() {
      let qos = CodecConfig::lc3(SamplingFrequency::Hz16000, FrameDuration::Ms10, 40).qos();
      let packet = encode_config_qos(&[AseQos {
         ase_id: 1,
         cig_id: 0,
         cis_id: 3,
         qos,
      }]);
      assert_eq!(
         packet.as_slice(),
         &[
            0x02, 0x01, 0x01, 0x00, 0x03, // header, ase, cig, cis
            0x10, 0x27, 0x00, // 10000 us
            0x00, 0x02, // unframed, 2M
            0x28, 0x00, // max sdu
            0x02, // rtn
            0x0A, 0x00, // 10 ms latency
            0x40, 0x9C, 0x00, // 40000 us presentation delay
         ]
      );
   }

   #[test]
   fn test_encode_id_lists() {
      assert_eq!(
         encode_ase_ids(ASE_OP_RELEASE, &[1, 3]).as_slice(),
         &[0x08, 0x02, 0x01, 0x03]
      );
      assert_eq!(
         encode_with_metadata(ASE_OP_ENABLE, &[1, 2], &[0x03, 0x02, 0x04, 0x00]).as_slice(),
         &[0x03, 0x02, 0x01, 0x04, 0x03, 0x02, 0x04, 0x00, 0x02, 0x04, 0x03, 0x02, 0x04, 0x00]
      );
   }

   #[test]
   fn test_parse_cp_response() {
      let response = parse_cp_response(&[0x01, 0x02, 0x01, 0x00, 0x00, 0x02, 0x03, 0x01]).unwrap();
      assert_eq!(response.opcode, ASE_OP_CONFIG_CODEC);
      assert_eq!(response.entries.len(), 2);
      assert_eq!(response.error_code(), Some(0x03));

      let malformed = parse_cp_response(&[0x02, 0xFF, 0x00, 0x02, 0x00]).unwrap();
      assert_eq!(malformed.error_code(), Some(0x02));
      assert_eq!(parse_cp_response(&[0x42, 0x00]), Err(CodecError::UnknownOpcode(0x42)));
   }

   #[test]
   fn test_parse_pac_records() {
      let data = [
         0x01, // one record
         0x06, 0x00, 0x00, 0x00, 0x00, // LC3
         0x0D, // capabilities
         0x03, 0x01, 0x84, 0x00, // 16 + 48 kHz
         0x02, 0x02, 0x02, // 10 ms only
         0x05, 0x04, 0x1E, 0x00, 0x78, 0x00, // 30..=120 octets
         0x04, // metadata
         0x03, 0x01, 0x04, 0x00, // media preferred
      ];
      let records = parse_pac_records(&data).unwrap();
      assert_eq!(records.len(), 1);
      let pac = &records[0];
      assert_eq!(pac.codec_id, CodecConfig::LC3);
      assert!(pac.supports(&CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 100)));
      assert!(!pac.supports(&CodecConfig::lc3(SamplingFrequency::Hz32000, FrameDuration::Ms10, 100)));
      assert_eq!(pac.preferred_contexts, Context::MEDIA);

      // Capability entry claims more bytes than it has
      let truncated = [0x01, 0x06, 0x00, 0x00, 0x00, 0x00, 0x02, 0x05, 0x01, 0x00];
      assert_eq!(parse_pac_records(&truncated), Err(CodecError::MalformedLtv(0)));
   }

   #[test]
   fn test_parse_contexts() {
      let contexts = parse_contexts(&[0x06, 0x00, 0x02, 0x00]).unwrap();
      assert_eq!(contexts.sink, Context::MEDIA.union(Context::CONVERSATIONAL));
      assert_eq!(contexts.source, Context::CONVERSATIONAL);
   }

   #[test]
   fn test_volume_and_mic() {
      assert_eq!(
         parse_volume_state(&[0x80, 0x01, 0x07]),
         Ok(VolumeState {
            volume: 0x80,
            mute: true,
            change_counter: 7
         })
      );
      assert_eq!(encode_set_volume(7, 0x40).as_slice(), &[0x04, 0x07, 0x40]);
      assert_eq!(encode_set_mute(7, true).as_slice(), &[0x06, 0x07]);
      assert_eq!(encode_set_mute(8, false).as_slice(), &[0x05, 0x08]);
      assert_eq!(parse_mic_state(&[0x02]), Ok(MicState::Disabled));
      assert!(parse_mic_state(&[0x05]).is_err());
   }

   #[test]
   fn test_set_info() {
      assert_eq!(
         parse_set_info(&[0x02], &[0x01], &[0x02]),
         Ok(SetInfo {
            size: 2,
            rank: 1,
            locked: true
         })
      );
      assert_eq!(encode_lock(true), [0x02]);
      assert!(parse_lock(&[0x00]).is_err());
   }

   fn source() -> BroadcastSource {
      BroadcastSource {
         address: SourceAddress {
            addr: [0xC0, 0x11, 0x22, 0x33, 0x44, 0x55],
            random: true,
         },
         adv_sid: 0x01,
         broadcast_id: 0x123456,
         pa_interval: 0x0050,
      }
   }

   #[test]
   fn test_encode_add_source() {
      let add = AddSource {
         source: source(),
         pa_sync: PaSync::SyncNoPast,
         subgroups: smallvec![Subgroup {
            bis_sync: 0x0000_0003,
            metadata: SmallVec::new(),
         }],
      };
      assert_eq!(
         encode_add_source(&add).as_slice(),
         &[
            0x02, 0x01, // opcode, random address
            0x55, 0x44, 0x33, 0x22, 0x11, 0xC0, // address, little endian
            0x01, 0x56, 0x34, 0x12, // sid, broadcast id
            0x02, 0x50, 0x00, // pa sync, interval
            0x01, 0x03, 0x00, 0x00, 0x00, 0x00, // one subgroup
         ]
      );
   }

   #[test]
   fn test_encode_bass_short_ops() {
      assert_eq!(encode_scan(true).as_slice(), &[0x01]);
      assert_eq!(encode_remove_source(4).as_slice(), &[0x05, 0x04]);
      let code = [0xAB; 16];
      let packet = encode_set_broadcast_code(4, &code);
      assert_eq!(&packet[..2], &[0x04, 0x04]);
      assert_eq!(&packet[2..], &code);
      let modify = ModifySource {
         pa_sync: PaSync::NoSync,
         pa_interval: 0xFFFF,
         subgroups: SmallVec::new(),
      };
      assert_eq!(
         encode_modify_source(4, &modify).as_slice(),
         &[0x03, 0x04, 0x00, 0xFF, 0xFF, 0x00]
      );
   }

   #[test]
   fn test_parse_receive_state() {
      assert_eq!(parse_receive_state(&[]), Ok(None));

      let mut data = vec![
         0x04, 0x01, // source id, random
         0x55, 0x44, 0x33, 0x22, 0x11, 0xC0, // address
         0x01, 0x56, 0x34, 0x12, // sid, broadcast id
         0x02, 0x03, // synced, bad code
      ];
      data.extend_from_slice(&[0xEE; 16]);
      data.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x09]);

      let state = parse_receive_state(&data).unwrap().unwrap();
      assert_eq!(state.source_id, 4);
      assert_eq!(state.source.address, source().address);
      assert_eq!(state.source.broadcast_id, 0x123456);
      assert_eq!(state.pa_sync_state, PaSyncState::Synced);
      assert_eq!(state.encryption, BigEncryption::BadCode);
      assert_eq!(state.subgroups.len(), 1);
      assert_eq!(state.subgroups[0].bis_sync, 1);
      assert_eq!(state.subgroups[0].metadata.as_slice(), &[0x01, 0x09]);

      assert!(parse_receive_state(&data[..10]).is_err());
   }
}
