use std::{collections::HashMap, fmt::Display, str::FromStr};

use bluer::Address;
use log::info;
use serde::Serialize;
use smallvec::SmallVec;
use strum::IntoEnumIterator;
use zbus::{
   fdo, interface,
   object_server::SignalEmitter,
   zvariant::{self, Value},
};

use crate::{
   bluetooth::manager::CapManager,
   cap::{
      arena::GroupId,
      request::{AppTask, ReadItem, Request, SourceIds, UnicastConnect},
      subclient::{AddSource, ModifySource},
      types::{
         BroadcastCode, BroadcastSource, Cid, CodecConfig, Context, FrameDuration, Metadata,
         PaSync, SamplingFrequency, Service, SourceAddress, Subgroup, Target, TargetLatency,
      },
   },
};

type Params<'a> = HashMap<String, zvariant::Value<'a>>;

/// "No preference" BIS selection of a subgroup
const BIS_SYNC_NO_PREFERENCE: u32 = 0xFFFF_FFFF;
/// Periodic advertising interval left for the delegator to find out
const PA_INTERVAL_UNKNOWN: u16 = 0xFFFF;

pub struct CapService {
   manager: CapManager,
}

impl CapService {
   pub const fn new(manager: CapManager) -> Self {
      Self { manager }
   }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
   serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn parse_address(address: &str) -> fdo::Result<Address> {
   Address::from_str(address).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.capd.Client")]
impl CapService {
   async fn init_group(
      &self,
      task: String,
      addresses: Vec<String>,
      set_size: u8,
   ) -> fdo::Result<String> {
      let addresses = addresses
         .iter()
         .map(|a| parse_address(a))
         .collect::<fdo::Result<Vec<_>>>()?;
      let confirmation = self
         .manager
         .init_group(AppTask::new(task), addresses, set_size)
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      to_json(&confirmation)
   }

   async fn add_device(&self, group: u64, task: String, address: String) -> fdo::Result<String> {
      let addr = parse_address(&address)?;
      let confirmation = self
         .manager
         .add_device(GroupId::from_raw(group), AppTask::new(task), addr)
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      to_json(&confirmation)
   }

   async fn remove_device(&self, group: u64, address: String) -> fdo::Result<String> {
      let addr = parse_address(&address)?;
      let result = self
         .manager
         .remove_device(GroupId::from_raw(group), addr)
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      info!("Removed {address} from group {group}: {result:?}");
      to_json(&result)
   }

   async fn register_task(&self, group: u64, task: String) -> fdo::Result<String> {
      let result = self
         .manager
         .register_task(GroupId::from_raw(group), AppTask::new(task))
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      to_json(&result)
   }

   async fn deregister_task(&self, group: u64, task: String) -> fdo::Result<String> {
      let result = self
         .manager
         .deregister_task(GroupId::from_raw(group), AppTask::new(task))
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      to_json(&result)
   }

   async fn destroy_group(&self, group: u64) -> fdo::Result<String> {
      let result = self
         .manager
         .destroy_group(GroupId::from_raw(group))
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      to_json(&result)
   }

   async fn get_groups(&self) -> fdo::Result<String> {
      to_json(&self.manager.groups().await)
   }

   async fn send_request(
      &self,
      group: u64,
      task: String,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> fdo::Result<String> {
      let request = parse_request(&action, &params)?;
      info!("{action} for group {group} from {task}");
      let confirmation = self
         .manager
         .submit(GroupId::from_raw(group), AppTask::new(task), request)
         .await
         .map_err(|e| fdo::Error::Failed(e.to_string()))?;
      to_json(&confirmation)
   }

   // Signals
   #[zbus(signal)]
   pub async fn stream_state_changed(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      ase_id: u8,
      state: &str,
      use_case: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn volume_changed(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      volume: u8,
      mute: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn mic_state_changed(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn receive_state_changed(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn receive_state_cleared(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      source_id: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn broadcast_code_requested(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      source_id: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn source_found(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      report: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn lock_released(emitter: &SignalEmitter<'_>, group: u64, cid: u32)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(
      emitter: &SignalEmitter<'_>,
      group: u64,
      cid: u32,
      address: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn groups(&self) -> String {
      self.get_groups().await.unwrap_or_default()
   }
}

// === Request Parameters ===

fn invalid(message: impl Into<String>) -> fdo::Error {
   fdo::Error::InvalidArgs(message.into())
}

fn require<T>(value: Option<T>, key: &str) -> fdo::Result<T> {
   value.ok_or_else(|| invalid(format!("Missing '{key}' parameter")))
}

fn string<'p>(params: &'p Params<'_>, key: &str) -> fdo::Result<Option<&'p str>> {
   match params.get(key) {
      None => Ok(None),
      Some(Value::Str(s)) => Ok(Some(s.as_str())),
      Some(_) => Err(invalid(format!("Invalid '{key}' parameter: expected a string"))),
   }
}

fn boolean(params: &Params<'_>, key: &str) -> fdo::Result<Option<bool>> {
   params
      .get(key)
      .map(|value| {
         value
            .downcast_ref::<bool>()
            .map_err(|e| invalid(format!("Invalid '{key}' parameter: {e}")))
      })
      .transpose()
}

fn uint<T: TryFrom<u64>>(params: &Params<'_>, key: &str) -> fdo::Result<Option<T>> {
   let raw = match params.get(key) {
      None => return Ok(None),
      Some(Value::U8(n)) => u64::from(*n),
      Some(Value::U16(n)) => u64::from(*n),
      Some(Value::U32(n)) => u64::from(*n),
      Some(Value::U64(n)) => *n,
      Some(Value::I16(n)) => u64::try_from(*n).unwrap_or(u64::MAX),
      Some(Value::I32(n)) => u64::try_from(*n).unwrap_or(u64::MAX),
      Some(Value::I64(n)) => u64::try_from(*n).unwrap_or(u64::MAX),
      Some(_) => return Err(invalid(format!("Invalid '{key}' parameter: expected an integer"))),
   };
   T::try_from(raw)
      .map(Some)
      .map_err(|_| invalid(format!("Parameter '{key}' out of range: {raw}")))
}

fn parsed<T>(params: &Params<'_>, key: &str) -> fdo::Result<Option<T>>
where
   T: FromStr,
   T::Err: Display,
{
   string(params, key)?
      .map(|s| {
         s.parse::<T>()
            .map_err(|e| invalid(format!("Invalid '{key}' value {s:?}: {e}")))
      })
      .transpose()
}

fn bytes(params: &Params<'_>, key: &str) -> fdo::Result<Option<Vec<u8>>> {
   string(params, key)?
      .map(|s| hex::decode(s).map_err(|e| invalid(format!("Invalid '{key}' hex: {e}"))))
      .transpose()
}

fn metadata(params: &Params<'_>) -> fdo::Result<Metadata> {
   Ok(bytes(params, "metadata")?
      .map(Metadata::from_vec)
      .unwrap_or_default())
}

fn use_case(params: &Params<'_>) -> fdo::Result<Context> {
   require(parsed(params, "use_case")?, "use_case")
}

fn target(params: &Params<'_>) -> fdo::Result<Target> {
   Ok(Target::from_raw(uint(params, "target")?.unwrap_or(0)))
}

/// Codec settings of one direction, named by `prefix`; `None` when absent.
fn codec(params: &Params<'_>, prefix: &str) -> fdo::Result<Option<CodecConfig>> {
   let key = |field: &str| format!("{prefix}_{field}");
   let Some(sampling) = parsed::<SamplingFrequency>(params, &key("sampling"))? else {
      return Ok(None);
   };
   let frame_duration = parsed(params, &key("frame_duration"))?.unwrap_or(FrameDuration::Ms10);
   let octets_key = key("octets");
   let octets = require(uint(params, &octets_key)?, &octets_key)?;
   let latency = parsed(params, &key("latency"))?.unwrap_or(TargetLatency::Balanced);
   Ok(Some(
      CodecConfig::lc3(sampling, frame_duration, octets).with_latency(latency),
   ))
}

fn broadcast_source(params: &Params<'_>) -> fdo::Result<BroadcastSource> {
   let address = parse_address(require(string(params, "address")?, "address")?)?;
   Ok(BroadcastSource {
      address: SourceAddress {
         addr: address.0,
         random: boolean(params, "address_random")?.unwrap_or(false),
      },
      adv_sid: uint(params, "adv_sid")?.unwrap_or(0),
      broadcast_id: require(uint(params, "broadcast_id")?, "broadcast_id")?,
      pa_interval: uint(params, "pa_interval")?.unwrap_or(PA_INTERVAL_UNKNOWN),
   })
}

fn subgroups(params: &Params<'_>) -> fdo::Result<SmallVec<[Subgroup; 1]>> {
   Ok(SmallVec::from_buf([Subgroup {
      bis_sync: uint(params, "bis_sync")?.unwrap_or(BIS_SYNC_NO_PREFERENCE),
      metadata: metadata(params)?,
   }]))
}

/// Parses `"cid:source_id"` pairs separated by commas.
fn sources(params: &Params<'_>) -> fdo::Result<SourceIds> {
   let list = require(string(params, "sources")?, "sources")?;
   let mut ids = SourceIds::new();
   for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      let parsed = pair
         .split_once(':')
         .and_then(|(cid, id)| Some((cid.parse::<u32>().ok()?, id.parse::<u8>().ok()?)));
      let Some((cid, source_id)) = parsed.filter(|(cid, _)| *cid != 0) else {
         return Err(invalid(format!("Invalid source {pair:?}; expected cid:source_id")));
      };
      ids.push((Cid(cid), source_id));
   }
   if ids.is_empty() {
      return Err(invalid("No sources given"));
   }
   Ok(ids)
}

fn services(params: &Params<'_>) -> fdo::Result<SmallVec<[Service; 5]>> {
   let Some(list) = string(params, "services")? else {
      return Ok(Service::iter().collect());
   };
   list
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(|s| Service::from_str(s).map_err(|e| invalid(format!("Invalid service {s:?}: {e}"))))
      .collect()
}

fn parse_request(action: &str, params: &Params<'_>) -> fdo::Result<Request> {
   Ok(match action {
      "discover_capabilities" => Request::DiscoverCapabilities,
      "unicast_connect" => {
         let sink = codec(params, "sink")?;
         let source = codec(params, "source")?;
         if sink.is_none() && source.is_none() {
            return Err(invalid("Need sink or source codec settings"));
         }
         Request::UnicastConnect(UnicastConnect {
            use_case: use_case(params)?,
            sinks_per_device: uint(params, "sinks_per_device")?
               .unwrap_or(u8::from(sink.is_some())),
            sources_per_device: uint(params, "sources_per_device")?
               .unwrap_or(u8::from(source.is_some())),
            sink,
            source,
         })
      },
      "unicast_disconnect" => Request::UnicastDisconnect {
         use_case: use_case(params)?,
      },
      "start_stream" => Request::StartStream {
         use_case: use_case(params)?,
         metadata: metadata(params)?,
      },
      "update_audio" => Request::UpdateAudio {
         use_case: use_case(params)?,
         metadata: metadata(params)?,
      },
      "stop_stream" => Request::StopStream {
         use_case: use_case(params)?,
         release: boolean(params, "release")?.unwrap_or(false),
      },
      "mute" => Request::Mute(require(boolean(params, "value")?, "value")?),
      "set_volume" => Request::SetVolume(require(uint(params, "value")?, "value")?),
      "set_mic_mute" => Request::SetMicMute {
         target: target(params)?,
         mute: require(boolean(params, "value")?, "value")?,
      },
      "read_state" => Request::Read {
         target: target(params)?,
         item: require(parsed::<ReadItem>(params, "item")?, "item")?,
      },
      "register_notifications" => Request::RegisterNotifications {
         services: services(params)?,
         enable: boolean(params, "enable")?.unwrap_or(true),
      },
      "unlock_set" => Request::UnlockSet,
      "start_source_scan" => Request::StartSourceScan {
         target: target(params)?,
      },
      "stop_source_scan" => Request::StopSourceScan {
         target: target(params)?,
      },
      "sync_to_source" => Request::SyncToSource(broadcast_source(params)?),
      "cancel_sync_to_source" => Request::CancelSyncToSource,
      "terminate_sync_to_source" => Request::TerminateSyncToSource {
         sync_handle: require(uint(params, "sync_handle")?, "sync_handle")?,
      },
      "add_source" => Request::AddSource {
         target: target(params)?,
         add: AddSource {
            source: broadcast_source(params)?,
            pa_sync: parsed(params, "pa_sync")?.unwrap_or(PaSync::SyncNoPast),
            subgroups: subgroups(params)?,
         },
      },
      "modify_source" => Request::ModifySource {
         sources: sources(params)?,
         modify: ModifySource {
            pa_sync: parsed(params, "pa_sync")?.unwrap_or(PaSync::SyncNoPast),
            pa_interval: uint(params, "pa_interval")?.unwrap_or(PA_INTERVAL_UNKNOWN),
            subgroups: subgroups(params)?,
         },
      },
      "remove_source" => Request::RemoveSource {
         sources: sources(params)?,
      },
      "set_broadcast_code" => {
         let code = require(bytes(params, "code")?, "code")?;
         let code: BroadcastCode = code
            .try_into()
            .map_err(|_| invalid("Broadcast code must be 16 bytes"))?;
         Request::SetBroadcastCode {
            sources: sources(params)?,
            code,
         }
      },
      _ => return Err(invalid(format!("Unknown action: {action}"))),
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   fn params(entries: Vec<(&str, Value<'static>)>) -> Params<'static> {
      entries
         .into_iter()
         .map(|(k, v)| (k.to_string(), v))
         .collect()
   }

   #[test]
   fn test_unicast_connect() {
      let p = params(vec![
         ("use_case", Value::from("conversational")),
         ("sink_sampling", Value::from("48000")),
         ("sink_octets", Value::from(100u32)),
         ("source_sampling", Value::from("16000")),
         ("source_frame_duration", Value::from("7.5ms")),
         ("source_octets", Value::from(30u16)),
         ("source_latency", Value::from("low")),
      ]);
      let Request::UnicastConnect(connect) = parse_request("unicast_connect", &p).unwrap() else {
         panic!("expected unicast connect");
      };
      assert_eq!(connect.use_case, Context::CONVERSATIONAL);
      assert_eq!(
         connect.sink,
         Some(CodecConfig::lc3(SamplingFrequency::Hz48000, FrameDuration::Ms10, 100))
      );
      assert_eq!(
         connect.source,
         Some(
            CodecConfig::lc3(SamplingFrequency::Hz16000, FrameDuration::Ms7_5, 30)
               .with_latency(TargetLatency::Low)
         )
      );
      assert_eq!((connect.sinks_per_device, connect.sources_per_device), (1, 1));
   }

   #[test]
   fn test_missing_and_invalid_parameters() {
      let p = params(vec![("sink_sampling", Value::from("48000"))]);
      // Octets are required once a direction is named
      assert!(parse_request("unicast_connect", &p).is_err());

      let p = params(vec![("value", Value::from(300u32))]);
      assert!(parse_request("set_volume", &p).is_err());

      let p = params(vec![("value", Value::from("loud"))]);
      assert!(parse_request("mute", &p).is_err());

      assert!(parse_request("self_destruct", &Params::new()).is_err());
   }

   #[test]
   fn test_read_state_and_target() {
      let p = params(vec![
         ("item", Value::from("receive_states")),
         ("target", Value::from(7u32)),
      ]);
      assert_eq!(
         parse_request("read_state", &p).unwrap(),
         Request::Read {
            target: Target::Device(Cid(7)),
            item: ReadItem::ReceiveStates,
         }
      );
   }

   #[test]
   fn test_register_notifications_defaults_to_all() {
      let Request::RegisterNotifications { services, enable } =
         parse_request("register_notifications", &Params::new()).unwrap()
      else {
         panic!("expected register notifications");
      };
      assert_eq!(services.len(), 5);
      assert!(enable);

      let p = params(vec![
         ("services", Value::from("vcp, MICP")),
         ("enable", Value::from(false)),
      ]);
      let Request::RegisterNotifications { services, enable } =
         parse_request("register_notifications", &p).unwrap()
      else {
         panic!("expected register notifications");
      };
      assert_eq!(services.as_slice(), &[Service::Vcp, Service::Micp]);
      assert!(!enable);
   }

   #[test]
   fn test_broadcast_code_for_sources() {
      let p = params(vec![
         ("sources", Value::from("3:1, 4:2")),
         ("code", Value::from("00112233445566778899aabbccddeeff")),
      ]);
      let Request::SetBroadcastCode { sources, code } =
         parse_request("set_broadcast_code", &p).unwrap()
      else {
         panic!("expected set broadcast code");
      };
      assert_eq!(sources.as_slice(), &[(Cid(3), 1), (Cid(4), 2)]);
      assert_eq!(code[15], 0xFF);

      let p = params(vec![("sources", Value::from("3")), ("code", Value::from("00"))]);
      assert!(parse_request("set_broadcast_code", &p).is_err());
   }

   #[test]
   fn test_sync_to_source_cancel_and_terminate() {
      assert_eq!(
         parse_request("cancel_sync_to_source", &Params::new()).unwrap(),
         Request::CancelSyncToSource
      );
      let p = params(vec![("sync_handle", Value::from(0x0040u32))]);
      assert_eq!(
         parse_request("terminate_sync_to_source", &p).unwrap(),
         Request::TerminateSyncToSource { sync_handle: 0x0040 }
      );
      assert!(parse_request("terminate_sync_to_source", &Params::new()).is_err());
      let p = params(vec![("sync_handle", Value::from(0x1_0000u32))]);
      assert!(parse_request("terminate_sync_to_source", &p).is_err());
   }

   #[test]
   fn test_add_source() {
      let p = params(vec![
         ("address", Value::from("C0:11:22:33:44:55")),
         ("address_random", Value::from(true)),
         ("broadcast_id", Value::from(0x123456u32)),
         ("metadata", Value::from("03020400")),
      ]);
      let Request::AddSource { target, add } = parse_request("add_source", &p).unwrap() else {
         panic!("expected add source");
      };
      assert_eq!(target, Target::All);
      assert_eq!(add.source.address.to_string(), "C0:11:22:33:44:55");
      assert!(add.source.address.random);
      assert_eq!(add.source.broadcast_id, 0x123456);
      assert_eq!(add.source.pa_interval, PA_INTERVAL_UNKNOWN);
      assert_eq!(add.pa_sync, PaSync::SyncNoPast);
      assert_eq!(add.subgroups[0].bis_sync, BIS_SYNC_NO_PREFERENCE);
      assert_eq!(add.subgroups[0].metadata.as_slice(), &[0x03, 0x02, 0x04, 0x00]);
   }
}
