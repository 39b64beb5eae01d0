//! Recognition of LE Audio peers and broadcast sources.
//!
//! Connected devices are recognised by the audio services they expose;
//! broadcast sources by the broadcast audio announcement in their service
//! data.

use std::collections::{HashMap, HashSet};

use bluer::Address;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::cap::types::{BroadcastSource, SourceAddress, SourceReport};

/// Bluetooth base UUID; 16-bit aliases occupy bits 96..112.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const ALIAS_MASK: u128 = 0x0000_ffff_0000_0000_0000_0000_0000_0000;

/// Audio stream control service
const ASCS: u16 = 0x184E;
/// Published audio capabilities service
const PACS: u16 = 0x1850;
/// Common audio service
const CAS: u16 = 0x1853;
/// Broadcast audio announcement service data
const BROADCAST_AUDIO_ANNOUNCEMENT: u16 = 0x1852;

/// Periodic advertising interval is unknown until the assistant syncs
const PA_INTERVAL_UNKNOWN: u16 = 0xFFFF;

pub const fn uuid16(alias: u16) -> Uuid {
   Uuid::from_u128(BASE_UUID | (alias as u128) << 96)
}

/// Returns the 16-bit alias of `uuid`, if it is derived from the base UUID.
pub const fn short_uuid(uuid: Uuid) -> Option<u16> {
   let raw = uuid.as_u128();
   if raw & !ALIAS_MASK == BASE_UUID {
      Some((raw >> 96) as u16)
   } else {
      None
   }
}

/// Whether the advertised service list names an LE Audio unicast server.
pub fn is_le_audio(uuids: &HashSet<Uuid>) -> bool {
   [ASCS, PACS, CAS]
      .into_iter()
      .any(|alias| uuids.contains(&uuid16(alias)))
}

pub async fn is_le_audio_device(dev: &bluer::Device) -> bool {
   if let Ok(Some(uuids)) = dev.uuids().await
      && is_le_audio(&uuids)
   {
      log::debug!("LE Audio services found on {}", dev.address());
      return true;
   }
   false
}

/// Builds a source report from an advertiser carrying a broadcast audio
/// announcement.
pub fn broadcast_source(
   address: Address,
   random: bool,
   service_data: &HashMap<Uuid, Vec<u8>>,
   name: Option<String>,
) -> Option<SourceReport> {
   let announcement = service_data.get(&uuid16(BROADCAST_AUDIO_ANNOUNCEMENT))?;
   let [a, b, c, ..] = announcement.as_slice() else {
      return None;
   };
   Some(SourceReport {
      source: BroadcastSource {
         address: SourceAddress {
            addr: address.0,
            random,
         },
         // Not exposed by bluetoothd
         adv_sid: 0,
         broadcast_id: u32::from_le_bytes([*a, *b, *c, 0]),
         pa_interval: PA_INTERVAL_UNKNOWN,
      },
      name: name.map(SmolStr::from),
   })
}
