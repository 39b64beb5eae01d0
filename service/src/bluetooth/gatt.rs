//! GATT procedures of one LE Audio connection.
//!
//! A [`Link`] wraps the BlueZ device of one connection together with the
//! handles known for it. Every sub-request is carried out as one async
//! procedure bounded by the request timeout; stream endpoint procedures are
//! confirmed by the control point response and by re-reading the endpoint
//! characteristics until they reach the requested state.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::{
   Address, Device,
   gatt::remote::{Characteristic, Service as RemoteService},
};
use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      codec::{self, CodecError},
      recognition::short_uuid,
   },
   cap::{
      ase::AseState,
      status::Failure,
      subclient::{
         AseHandle, BapHandles, BapRequest, BassHandles, BassRequest, CsipHandles,
         CsipRequest, DeviceHandles, HandleSet, MicpHandles, MicpRequest, SubNotification,
         SubOutcome, SubRequest, SubResponse, Ticket, VcpHandles, VcpRequest,
      },
      types::{Capabilities, Cid, Direction, Service, SourceReport},
   },
   config::Config,
};

/// "Unlikely error"; reported when the remote fails without an ATT code.
const ATT_UNLIKELY_ERROR: u8 = 0x0E;
/// Volume control point "invalid change counter"
const VCP_INVALID_CHANGE_COUNTER: u8 = 0x80;

const PACS: u16 = 0x1850;

const SINK_ASE: u16 = 0x2BC4;
const SOURCE_ASE: u16 = 0x2BC5;
const ASE_CONTROL_POINT: u16 = 0x2BC6;
const SINK_PAC: u16 = 0x2BC9;
const SOURCE_PAC: u16 = 0x2BCB;
const AVAILABLE_CONTEXTS: u16 = 0x2BCD;
const SUPPORTED_CONTEXTS: u16 = 0x2BCE;
const SET_SIZE: u16 = 0x2B85;
const SET_LOCK: u16 = 0x2B86;
const SET_RANK: u16 = 0x2B87;
const VOLUME_STATE: u16 = 0x2B7D;
const VOLUME_CONTROL_POINT: u16 = 0x2B7E;
const VOLUME_FLAGS: u16 = 0x2B7F;
const MUTE: u16 = 0x2BC3;
const BASS_CONTROL_POINT: u16 = 0x2BC7;
const RECEIVE_STATE: u16 = 0x2BC8;

/// Traffic from the adapters back to the owning event loop.
#[derive(Debug)]
pub enum GattEvent {
   Completed(Ticket, SubOutcome),
   Notified(Cid, SubNotification),
   SourceFound(SourceReport),
}

/// Timing of GATT procedures.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
   pub request_timeout: Duration,
   pub poll_attempts: u32,
   pub poll_interval: Duration,
}

impl Timing {
   pub const fn from_config(config: &Config) -> Self {
      Self {
         request_timeout: config.request_timeout(),
         poll_attempts: config.state_poll_attempts,
         poll_interval: config.state_poll_interval(),
      }
   }
}

// === Errors ===

/// Extracts the ATT error code from a bluetoothd error message.
fn att_code(message: &str) -> Option<u8> {
   let (_, rest) = message.split_once("ATT error: 0x")?;
   u8::from_str_radix(rest.get(..2)?, 16).ok()
}

fn gatt_failure(service: Service, err: &bluer::Error) -> Failure {
   if err.kind == bluer::ErrorKind::NotSupported {
      return Failure::NotSupported;
   }
   if err.message.contains("Not connected") {
      return Failure::Disconnected;
   }
   let code = att_code(&err.message).unwrap_or(ATT_UNLIKELY_ERROR);
   Failure::Protocol { service, code }
}

fn codec_failure(service: Service, err: &CodecError) -> Failure {
   warn!("Malformed {service} payload: {err}");
   Failure::Protocol {
      service,
      code: ATT_UNLIKELY_ERROR,
   }
}

// === Notifications ===

/// What a subscribed characteristic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
   Ase,
   Contexts,
   Lock,
   Volume,
   Mic,
   ReceiveState,
}

/// Turns one notification payload into what the orchestrator understands.
///
/// `last_source` remembers the source id a receive state characteristic held,
/// so that an emptied characteristic can be reported.
fn translate(
   watch: Watch,
   value: &[u8],
   last_source: &mut Option<u8>,
) -> Result<Option<SubNotification>, CodecError> {
   Ok(match watch {
      Watch::Ase => {
         let (ase_id, state) = codec::parse_ase_state(value)?;
         Some(SubNotification::AseState { ase_id, state })
      },
      Watch::Contexts => Some(SubNotification::Contexts(codec::parse_contexts(value)?)),
      Watch::Lock => (!codec::parse_lock(value)?).then_some(SubNotification::LockReleased),
      Watch::Volume => Some(SubNotification::Volume(codec::parse_volume_state(value)?)),
      Watch::Mic => Some(SubNotification::Mic(codec::parse_mic_state(value)?)),
      Watch::ReceiveState => match codec::parse_receive_state(value)? {
         Some(state) => {
            *last_source = Some(state.source_id);
            Some(SubNotification::ReceiveState(state))
         },
         None => last_source
            .take()
            .map(|source_id| SubNotification::ReceiveStateCleared { source_id }),
      },
   })
}

// === Link ===

/// One connection's GATT client.
pub struct Link {
   cid: Cid,
   device: Device,
   adapter: bluer::Adapter,
   handles: Mutex<DeviceHandles>,
   listeners: Mutex<HashMap<Service, Vec<JoinHandle<()>>>>,
   timing: Timing,
}

impl Link {
   pub fn new(cid: Cid, device: Device, adapter: bluer::Adapter, timing: Timing) -> Self {
      Self {
         cid,
         device,
         adapter,
         handles: Mutex::new(DeviceHandles::default()),
         listeners: Mutex::new(HashMap::new()),
         timing,
      }
   }

   pub fn address(&self) -> Address {
      self.device.address()
   }

   pub const fn device(&self) -> &Device {
      &self.device
   }

   pub const fn adapter(&self) -> &bluer::Adapter {
      &self.adapter
   }

   pub fn restore(&self, handles: &DeviceHandles) {
      *self.handles.lock() = handles.clone();
   }

   /// Stops every notification listener of this connection.
   pub fn close(&self) {
      for (_, handles) in self.listeners.lock().drain() {
         for handle in handles {
            handle.abort();
         }
      }
   }

   /// Carries out `request`, giving up after the request timeout.
   pub async fn perform(
      self: Arc<Self>,
      request: SubRequest,
      events: mpsc::Sender<GattEvent>,
   ) -> SubOutcome {
      let service = request.service();
      match time::timeout(self.timing.request_timeout, self.run(request, events)).await {
         Ok(outcome) => outcome,
         Err(_) => {
            warn!("{}: {service} request timed out", self.cid);
            Err(Failure::Timeout)
         },
      }
   }

   async fn run(&self, request: SubRequest, events: mpsc::Sender<GattEvent>) -> SubOutcome {
      match request {
         SubRequest::Discover(service) => {
            let set = self.discover(service).await?;
            self.handles.lock().apply(set.clone());
            Ok(SubResponse::Discovered(set))
         },
         SubRequest::SetNotify { service, enable } => {
            if enable {
               self.subscribe(service, events).await?;
            } else if let Some(handles) = self.listeners.lock().remove(&service) {
               handles.into_iter().for_each(|h| h.abort());
            }
            Ok(SubResponse::Done)
         },
         SubRequest::Bap(request) => self.bap(request).await,
         SubRequest::Csip(request) => self.csip(request).await,
         SubRequest::Vcp(request) => self.vcp(request).await,
         SubRequest::Micp(request) => self.micp(request).await,
         SubRequest::Bass(request) => self.bass(request).await,
      }
   }

   // === Attribute Access ===

   async fn characteristic(
      &self,
      service: Service,
      service_handle: u16,
      handle: u16,
   ) -> Result<Characteristic, Failure> {
      let remote = self
         .device
         .service(service_handle)
         .await
         .map_err(|e| gatt_failure(service, &e))?;
      remote
         .characteristic(handle)
         .await
         .map_err(|e| gatt_failure(service, &e))
   }

   async fn read(&self, service: Service, service_handle: u16, handle: u16) -> Result<Vec<u8>, Failure> {
      let value = self
         .characteristic(service, service_handle, handle)
         .await?
         .read()
         .await
         .map_err(|e| gatt_failure(service, &e))?;
      debug!("{} read {handle:#06x}: {}", self.cid, hex::encode(&value));
      Ok(value)
   }

   async fn write(
      &self,
      service: Service,
      service_handle: u16,
      handle: u16,
      value: &[u8],
   ) -> Result<(), Failure> {
      debug!("{} write {handle:#06x}: {}", self.cid, hex::encode(value));
      self
         .characteristic(service, service_handle, handle)
         .await?
         .write(value)
         .await
         .map_err(|e| gatt_failure(service, &e))
   }

   fn bap_handles(&self) -> Result<BapHandles, Failure> {
      self.handles.lock().bap.clone().ok_or(Failure::NotSupported)
   }

   fn csip_handles(&self) -> Result<CsipHandles, Failure> {
      self.handles.lock().csip.ok_or(Failure::NotSupported)
   }

   fn vcp_handles(&self) -> Result<VcpHandles, Failure> {
      self.handles.lock().vcp.ok_or(Failure::NotSupported)
   }

   fn micp_handles(&self) -> Result<MicpHandles, Failure> {
      self.handles.lock().micp.ok_or(Failure::NotSupported)
   }

   fn bass_handles(&self) -> Result<BassHandles, Failure> {
      self.handles.lock().bass.clone().ok_or(Failure::NotSupported)
   }

   // === Discovery ===

   async fn find_service(&self, service: Service, alias: u16) -> Result<RemoteService, Failure> {
      let services = self
         .device
         .services()
         .await
         .map_err(|e| gatt_failure(service, &e))?;
      for remote in services {
         if remote.uuid().await.ok().and_then(short_uuid) == Some(alias) {
            return Ok(remote);
         }
      }
      Err(Failure::NotSupported)
   }

   /// Characteristics of `remote` by their 16-bit alias, in handle order.
   async fn characteristics(
      &self,
      service: Service,
      remote: &RemoteService,
   ) -> Result<Vec<(u16, Characteristic)>, Failure> {
      let mut found = Vec::new();
      for ch in remote
         .characteristics()
         .await
         .map_err(|e| gatt_failure(service, &e))?
      {
         if let Some(alias) = ch.uuid().await.ok().and_then(short_uuid) {
            found.push((alias, ch));
         }
      }
      found.sort_by_key(|(_, ch)| ch.id());
      Ok(found)
   }

   async fn discover(&self, service: Service) -> Result<HandleSet, Failure> {
      let remote = self.find_service(service, service.uuid16()).await?;
      let chars = self.characteristics(service, &remote).await?;
      let find = |alias: u16| chars.iter().find(|(a, _)| *a == alias).map(|(_, ch)| ch.id());
      let require = |alias: u16| find(alias).ok_or(Failure::NotSupported);

      let set = match service {
         Service::Bap => {
            let pacs = self.find_service(service, PACS).await?;
            let pac_chars = self.characteristics(service, &pacs).await?;
            let pac = |alias: u16| pac_chars.iter().find(|(a, _)| *a == alias).map(|(_, ch)| ch.id());

            let mut handles = BapHandles {
               service: remote.id(),
               control_point: require(ASE_CONTROL_POINT)?,
               pacs_service: pacs.id(),
               sink_pac: pac(SINK_PAC),
               source_pac: pac(SOURCE_PAC),
               available_contexts: pac(AVAILABLE_CONTEXTS).ok_or(Failure::NotSupported)?,
               supported_contexts: pac(SUPPORTED_CONTEXTS).ok_or(Failure::NotSupported)?,
               ..Default::default()
            };
            for (alias, ch) in &chars {
               if !matches!(*alias, SINK_ASE | SOURCE_ASE) {
                  continue;
               }
               let value = ch.read().await.map_err(|e| gatt_failure(service, &e))?;
               let (ase_id, _) =
                  codec::parse_ase_state(&value).map_err(|e| codec_failure(service, &e))?;
               let entry = AseHandle {
                  ase_id,
                  handle: ch.id(),
               };
               if *alias == SINK_ASE {
                  handles.sink_ases.push(entry);
               } else {
                  handles.source_ases.push(entry);
               }
            }
            HandleSet::Bap(handles)
         },
         Service::Csip => HandleSet::Csip(CsipHandles {
            service: remote.id(),
            size: require(SET_SIZE)?,
            lock: require(SET_LOCK)?,
            rank: require(SET_RANK)?,
         }),
         Service::Vcp => HandleSet::Vcp(VcpHandles {
            service: remote.id(),
            state: require(VOLUME_STATE)?,
            control_point: require(VOLUME_CONTROL_POINT)?,
            flags: find(VOLUME_FLAGS).unwrap_or_default(),
         }),
         Service::Micp => HandleSet::Micp(MicpHandles {
            service: remote.id(),
            mute: require(MUTE)?,
         }),
         Service::Bass => HandleSet::Bass(BassHandles {
            service: remote.id(),
            control_point: require(BASS_CONTROL_POINT)?,
            receive_states: chars
               .iter()
               .filter(|(alias, _)| *alias == RECEIVE_STATE)
               .map(|(_, ch)| ch.id())
               .collect(),
         }),
      };
      debug!("{}: discovered {service}: {set:?}", self.cid);
      Ok(set)
   }

   // === Notifications ===

   /// Characteristics of `service` worth listening to.
   fn watched(&self, service: Service) -> Result<Vec<(u16, u16, Watch)>, Failure> {
      Ok(match service {
         Service::Bap => {
            let bap = self.bap_handles()?;
            let mut watched: Vec<_> = bap
               .sink_ases
               .iter()
               .chain(bap.source_ases.iter())
               .map(|ase| (bap.service, ase.handle, Watch::Ase))
               .collect();
            watched.push((bap.pacs_service, bap.available_contexts, Watch::Contexts));
            watched
         },
         Service::Csip => {
            let csip = self.csip_handles()?;
            vec![(csip.service, csip.lock, Watch::Lock)]
         },
         Service::Vcp => {
            let vcp = self.vcp_handles()?;
            vec![(vcp.service, vcp.state, Watch::Volume)]
         },
         Service::Micp => {
            let micp = self.micp_handles()?;
            vec![(micp.service, micp.mute, Watch::Mic)]
         },
         Service::Bass => {
            let bass = self.bass_handles()?;
            bass
               .receive_states
               .iter()
               .map(|handle| (bass.service, *handle, Watch::ReceiveState))
               .collect()
         },
      })
   }

   async fn subscribe(&self, service: Service, events: mpsc::Sender<GattEvent>) -> Result<(), Failure> {
      if self.listeners.lock().contains_key(&service) {
         return Ok(());
      }
      let mut spawned = Vec::new();
      let mut result = Ok(());
      for (service_handle, handle, watch) in self.watched(service)? {
         let ch = match self.characteristic(service, service_handle, handle).await {
            Ok(ch) => ch,
            Err(failure) => {
               result = Err(failure);
               break;
            },
         };
         let (ready_tx, ready_rx) = oneshot::channel();
         spawned.push(Self::listen(self.cid, service, ch, watch, ready_tx, events.clone()));
         match ready_rx.await {
            Ok(Ok(())) => {},
            Ok(Err(failure)) => {
               result = Err(failure);
               break;
            },
            Err(_) => {
               result = Err(Failure::Disconnected);
               break;
            },
         }
      }
      match result {
         Ok(()) => {
            self.listeners.lock().insert(service, spawned);
         },
         Err(_) => spawned.into_iter().for_each(|h| h.abort()),
      }
      result
   }

   fn listen(
      cid: Cid,
      service: Service,
      ch: Characteristic,
      watch: Watch,
      ready: oneshot::Sender<Result<(), Failure>>,
      events: mpsc::Sender<GattEvent>,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let stream = match ch.notify().await {
            Ok(stream) => stream,
            Err(e) => {
               let _ = ready.send(Err(gatt_failure(service, &e)));
               return;
            },
         };
         let _ = ready.send(Ok(()));
         let mut stream = Box::pin(stream);
         let mut last_source = None;

         while let Some(value) = stream.next().await {
            debug!("{cid} notify {:#06x}: {}", ch.id(), hex::encode(&value));
            match translate(watch, &value, &mut last_source) {
               Ok(Some(notification)) => {
                  if events
                     .send(GattEvent::Notified(cid, notification))
                     .await
                     .is_err()
                  {
                     return;
                  }
               },
               Ok(None) => {},
               Err(e) => warn!("{cid}: malformed {service} notification: {e}"),
            }
         }
         debug!("{cid}: {service} notifications ended");
      })
   }

   // === Stream Endpoints ===

   async fn bap(&self, request: BapRequest) -> SubOutcome {
      let service = Service::Bap;
      let bap = self.bap_handles()?;
      match request {
         BapRequest::ReadCapabilities => {
            let mut caps = Capabilities::default();
            if let Some(handle) = bap.sink_pac {
               let value = self.read(service, bap.pacs_service, handle).await?;
               caps.sink = codec::parse_pac_records(&value).map_err(|e| codec_failure(service, &e))?;
            }
            if let Some(handle) = bap.source_pac {
               let value = self.read(service, bap.pacs_service, handle).await?;
               caps.source =
                  codec::parse_pac_records(&value).map_err(|e| codec_failure(service, &e))?;
            }
            let value = self.read(service, bap.pacs_service, bap.available_contexts).await?;
            caps.available = codec::parse_contexts(&value).map_err(|e| codec_failure(service, &e))?;
            let value = self.read(service, bap.pacs_service, bap.supported_contexts).await?;
            caps.supported = codec::parse_contexts(&value).map_err(|e| codec_failure(service, &e))?;
            Ok(SubResponse::Capabilities(caps))
         },
         BapRequest::ReadAvailableContexts => {
            let value = self.read(service, bap.pacs_service, bap.available_contexts).await?;
            let available = codec::parse_contexts(&value).map_err(|e| codec_failure(service, &e))?;
            Ok(SubResponse::Contexts(available))
         },
         // CIS establishment needs an ISO socket, which bluer does not expose
         BapRequest::ConnectCis { .. } => Err(Failure::NotSupported),
         BapRequest::ConfigureCodec(configs) => {
            let ases: SmallVec<[u8; 4]> = configs.iter().map(|c| c.ase_id).collect();
            let packet = codec::encode_config_codec(&configs);
            self.ascs(&bap, &packet, &ases, |_, s| s == AseState::CodecConfigured).await
         },
         BapRequest::ConfigureQos(qos) => {
            let ases: SmallVec<[u8; 4]> = qos.iter().map(|q| q.ase_id).collect();
            let packet = codec::encode_config_qos(&qos);
            self.ascs(&bap, &packet, &ases, |_, s| s == AseState::QosConfigured).await
         },
         BapRequest::Enable { ases, metadata } => {
            let packet = codec::encode_with_metadata(codec::ASE_OP_ENABLE, &ases, &metadata);
            self.ascs(&bap, &packet, &ases, |_, s| s.is_active()).await
         },
         BapRequest::ReceiverStartReady(ases) => {
            // Only source endpoints take the handshake; sinks start streaming on their own
            let sources: SmallVec<[u8; 4]> = ases
               .iter()
               .copied()
               .filter(|id| matches!(bap.ase(*id), Some((Direction::Source, _))))
               .collect();
            if !sources.is_empty() {
               let packet = codec::encode_ase_ids(codec::ASE_OP_RECEIVER_START_READY, &sources);
               self.write_control_point(&bap, &packet).await?;
            }
            self.await_states(&bap, &ases, |_, s| s == AseState::Streaming).await
         },
         BapRequest::Disable(ases) => {
            let packet = codec::encode_ase_ids(codec::ASE_OP_DISABLE, &ases);
            self
               .ascs(&bap, &packet, &ases, |direction, s| match direction {
                  Direction::Sink => s == AseState::QosConfigured,
                  Direction::Source => matches!(s, AseState::Disabled | AseState::QosConfigured),
               })
               .await
         },
         BapRequest::ReceiverStopReady(ases) => {
            let packet = codec::encode_ase_ids(codec::ASE_OP_RECEIVER_STOP_READY, &ases);
            self.ascs(&bap, &packet, &ases, |_, s| s == AseState::QosConfigured).await
         },
         BapRequest::UpdateMetadata { ases, metadata } => {
            let packet = codec::encode_with_metadata(codec::ASE_OP_UPDATE_METADATA, &ases, &metadata);
            self.ascs(&bap, &packet, &ases, |_, s| s.is_active()).await
         },
         BapRequest::Release(ases) => {
            let packet = codec::encode_ase_ids(codec::ASE_OP_RELEASE, &ases);
            let released = |_: Direction, s: AseState| {
               matches!(s, AseState::Released | AseState::Idle | AseState::CodecConfigured)
            };
            match self.ascs(&bap, &packet, &ases, released).await? {
               // Endpoints that finished releasing are reported as released
               SubResponse::AseStates(states) => Ok(SubResponse::AseStates(
                  states
                     .into_iter()
                     .map(|(id, _)| (id, AseState::Released))
                     .collect(),
               )),
               other => Ok(other),
            }
         },
      }
   }

   /// Writes the control point and checks the response the remote notifies.
   async fn write_control_point(&self, bap: &BapHandles, packet: &[u8]) -> Result<(), Failure> {
      let service = Service::Bap;
      let cp = self.characteristic(service, bap.service, bap.control_point).await?;
      let mut responses = Box::pin(cp.notify().await.map_err(|e| gatt_failure(service, &e))?);
      debug!("{} ASE control point <- {}", self.cid, hex::encode(packet));
      cp.write(packet).await.map_err(|e| gatt_failure(service, &e))?;

      let Some(value) = responses.next().await else {
         return Err(Failure::Disconnected);
      };
      let response = codec::parse_cp_response(&value).map_err(|e| codec_failure(service, &e))?;
      match response.error_code() {
         Some(code) => {
            warn!("{}: ASE control point rejected opcode {:#04x}: {code:#04x}", self.cid, response.opcode);
            Err(Failure::Protocol { service, code })
         },
         None => Ok(()),
      }
   }

   async fn ascs(
      &self,
      bap: &BapHandles,
      packet: &[u8],
      ases: &[u8],
      reached: impl Fn(Direction, AseState) -> bool,
   ) -> SubOutcome {
      self.write_control_point(bap, packet).await?;
      self.await_states(bap, ases, reached).await
   }

   /// Re-reads the endpoints until each satisfies `reached`.
   async fn await_states(
      &self,
      bap: &BapHandles,
      ases: &[u8],
      reached: impl Fn(Direction, AseState) -> bool,
   ) -> SubOutcome {
      let service = Service::Bap;
      for attempt in 0..self.timing.poll_attempts.max(1) {
         if attempt > 0 {
            time::sleep(self.timing.poll_interval).await;
         }
         let mut states = SmallVec::new();
         let mut done = true;
         for ase_id in ases {
            let (direction, handle) = bap.ase(*ase_id).ok_or(Failure::InvalidParameter)?;
            let value = self.read(service, bap.service, handle).await?;
            let (_, state) = codec::parse_ase_state(&value).map_err(|e| codec_failure(service, &e))?;
            done &= reached(direction, state);
            states.push((*ase_id, state));
         }
         if done {
            return Ok(SubResponse::AseStates(states));
         }
      }
      warn!("{}: endpoints {ases:?} did not reach the requested state", self.cid);
      Err(Failure::Timeout)
   }

   // === Set / Rendering / Capture ===

   async fn csip(&self, request: CsipRequest) -> SubOutcome {
      let service = Service::Csip;
      let csip = self.csip_handles()?;
      match request {
         CsipRequest::SetLock(lock) => {
            self
               .write(service, csip.service, csip.lock, &codec::encode_lock(lock))
               .await?;
            Ok(SubResponse::Done)
         },
         CsipRequest::ReadSetInfo => {
            let size = self.read(service, csip.service, csip.size).await?;
            let rank = self.read(service, csip.service, csip.rank).await?;
            let lock = self.read(service, csip.service, csip.lock).await?;
            let info =
               codec::parse_set_info(&size, &rank, &lock).map_err(|e| codec_failure(service, &e))?;
            Ok(SubResponse::SetInfo(info))
         },
      }
   }

   async fn vcp(&self, request: VcpRequest) -> SubOutcome {
      let service = Service::Vcp;
      let vcp = self.vcp_handles()?;

      // A concurrent change bumps the counter; retry once with a fresh one
      let mut retried = false;
      loop {
         let value = self.read(service, vcp.service, vcp.state).await?;
         let state = codec::parse_volume_state(&value).map_err(|e| codec_failure(service, &e))?;
         let packet = match request {
            VcpRequest::ReadState => return Ok(SubResponse::Volume(state)),
            VcpRequest::SetAbsoluteVolume(volume) => {
               codec::encode_set_volume(state.change_counter, volume)
            },
            VcpRequest::SetMute(mute) => codec::encode_set_mute(state.change_counter, mute),
         };
         match self
            .write(service, vcp.service, vcp.control_point, &packet)
            .await
         {
            Err(Failure::Protocol { code, .. }) if code == VCP_INVALID_CHANGE_COUNTER && !retried => {
               retried = true;
            },
            result => return result.map(|()| SubResponse::Done),
         }
      }
   }

   async fn micp(&self, request: MicpRequest) -> SubOutcome {
      let service = Service::Micp;
      let micp = self.micp_handles()?;
      match request {
         MicpRequest::SetMute(mute) => {
            self
               .write(service, micp.service, micp.mute, &[u8::from(mute)])
               .await?;
            Ok(SubResponse::Done)
         },
         MicpRequest::ReadState => {
            let value = self.read(service, micp.service, micp.mute).await?;
            let state = codec::parse_mic_state(&value).map_err(|e| codec_failure(service, &e))?;
            Ok(SubResponse::Mic(state))
         },
      }
   }

   // === Broadcast Assistant ===

   async fn bass(&self, request: BassRequest) -> SubOutcome {
      let service = Service::Bass;
      let bass = self.bass_handles()?;
      let packet = match request {
         BassRequest::RemoteScanStarted => codec::encode_scan(true),
         BassRequest::RemoteScanStopped => codec::encode_scan(false),
         BassRequest::AddSource(add) => codec::encode_add_source(&add),
         BassRequest::ModifySource { source_id, modify } => {
            codec::encode_modify_source(source_id, &modify)
         },
         BassRequest::RemoveSource { source_id } => codec::encode_remove_source(source_id),
         BassRequest::SetBroadcastCode { source_id, code } => {
            codec::encode_set_broadcast_code(source_id, &code)
         },
         // Needs periodic advertising sync on the local controller
         BassRequest::SyncToSource(_)
         | BassRequest::CancelSyncToSource
         | BassRequest::TerminateSyncToSource { .. } => return Err(Failure::NotSupported),
         BassRequest::ReadReceiveStates => {
            let mut states = Vec::new();
            for handle in &bass.receive_states {
               let value = self.read(service, bass.service, *handle).await?;
               if let Some(state) =
                  codec::parse_receive_state(&value).map_err(|e| codec_failure(service, &e))?
               {
                  states.push(state);
               }
            }
            return Ok(SubResponse::ReceiveStates(states));
         },
      };
      self
         .write(service, bass.service, bass.control_point, &packet)
         .await?;
      Ok(SubResponse::Done)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::cap::types::MicState;

   #[test]
   fn test_att_code() {
      assert_eq!(att_code("Operation failed with ATT error: 0x80"), Some(0x80));
      assert_eq!(att_code("Operation failed with ATT error: 0x0e (Unlikely)"), Some(0x0E));
      assert_eq!(att_code("Not connected"), None);
      assert_eq!(att_code("ATT error: 0x"), None);
   }

   #[test]
   fn test_translate_simple_watches() {
      let mut last = None;
      assert_eq!(
         translate(Watch::Ase, &[0x02, 0x04], &mut last),
         Ok(Some(SubNotification::AseState {
            ase_id: 2,
            state: AseState::Streaming
         }))
      );
      assert_eq!(
         translate(Watch::Mic, &[0x01], &mut last),
         Ok(Some(SubNotification::Mic(MicState::Muted)))
      );
      // Only a release is worth reporting
      assert_eq!(translate(Watch::Lock, &[0x02], &mut last), Ok(None));
      assert_eq!(
         translate(Watch::Lock, &[0x01], &mut last),
         Ok(Some(SubNotification::LockReleased))
      );
      assert!(translate(Watch::Volume, &[0x10], &mut last).is_err());
   }

   #[test]
   fn test_translate_receive_state_clear() {
      let mut last = None;
      // Nothing to clear before any source was reported
      assert_eq!(translate(Watch::ReceiveState, &[], &mut last), Ok(None));

      let data = [
         0x07, 0x00, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
      ];
      let Ok(Some(SubNotification::ReceiveState(state))) =
         translate(Watch::ReceiveState, &data, &mut last)
      else {
         panic!("expected a receive state");
      };
      assert_eq!(state.source_id, 7);
      assert_eq!(
         translate(Watch::ReceiveState, &[], &mut last),
         Ok(Some(SubNotification::ReceiveStateCleared { source_id: 7 }))
      );
      assert_eq!(last, None);
   }
}
