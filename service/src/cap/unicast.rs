//! Unicast stream rounds: endpoint selection, CIS allocation and the
//! per-device stream-endpoint requests of connect, start, update, stop and
//! disconnect.

use log::debug;
use smallvec::SmallVec;

use crate::{
   cap::{
      ase::{AseIds, AseState, StreamEndpoint},
      fanout::Requests,
      group::{DeviceRecord, GroupInstance},
      request::{Phase, PendingOp, Request, UnicastConnect},
      status::{Failure, OpResult},
      subclient::{AseConfig, AseQos, BapRequest, Lane, SubRequest, SubResponse},
      types::{Cid, CodecConfig, Context, Direction, streaming_metadata},
   },
   event::{CapEvent, EventSender},
};

fn single(request: BapRequest) -> Requests {
   SmallVec::from_elem(SubRequest::Bap(request), 1)
}

/// Like [`single`], but nothing to do for an empty id list.
fn unless_empty(ases: AseIds, request: impl FnOnce(AseIds) -> BapRequest) -> Requests {
   if ases.is_empty() { Requests::new() } else { single(request(ases)) }
}

fn required(ases: AseIds) -> Result<AseIds, Failure> {
   if ases.is_empty() { Err(Failure::NotConfigured) } else { Ok(ases) }
}

const fn codec_for(params: &UnicastConnect, direction: Direction) -> (Option<CodecConfig>, u8) {
   match direction {
      Direction::Sink => (params.sink, params.sinks_per_device),
      Direction::Source => (params.source, params.sources_per_device),
   }
}

/// Group-wide checks and reservations made before a unicast request fans out.
pub fn prepare(group: &mut GroupInstance, request: &Request) -> OpResult {
   match request {
      Request::UnicastConnect(params) => {
         let directions = params
            .use_case
            .cis_direction()
            .ok_or(Failure::InvalidParameter)?;
         for direction in [Direction::Sink, Direction::Source] {
            if directions.has(direction) && codec_for(params, direction).0.is_none() {
               return Err(Failure::InvalidParameter);
            }
         }
         group.allocate_cig(params.use_case, directions)?;
         if let Some(cig) = group.cig_mut(params.use_case) {
            cig.restart();
         }
         Ok(())
      },
      Request::StartStream { use_case, .. }
      | Request::UpdateAudio { use_case, .. }
      | Request::StopStream { use_case, .. }
      | Request::UnicastDisconnect { use_case } => {
         if group.cig(*use_case).is_none() {
            return Err(Failure::NotConfigured);
         }
         Ok(())
      },
      _ => Ok(()),
   }
}

/// Stream-endpoint requests of `phase` for one device.
pub fn build(group: &mut GroupInstance, cid: Cid, phase: Phase, request: &Request) -> Result<Requests, Failure> {
   if phase == Phase::ReadCapabilities {
      return Ok(single(BapRequest::ReadCapabilities));
   }
   if phase == Phase::QosConfig {
      let use_case = request.use_case().ok_or(Failure::NullInstance)?;
      return configure_qos(group, cid, use_case);
   }
   if phase == Phase::ConnectCis {
      let use_case = request.use_case().ok_or(Failure::NullInstance)?;
      let cig_id = group.cig(use_case).ok_or(Failure::NotConfigured)?.id;
      let device = group.device(cid).ok_or(Failure::InvalidDevice)?;
      let mut cis_ids: SmallVec<[u8; 2]> = SmallVec::new();
      for ase in device.endpoints.iter() {
         if ase.serves(use_case) && ase.state.is_active() && !cis_ids.contains(&ase.cis_id) {
            cis_ids.push(ase.cis_id);
         }
      }
      if cis_ids.is_empty() {
         return Err(Failure::NotConfigured);
      }
      return Ok(single(BapRequest::ConnectCis { cig_id, cis_ids }));
   }

   let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
   if let (Phase::CodecConfig, Request::UnicastConnect(params)) = (phase, request) {
      return configure_codec(device, params);
   }
   let endpoints = &device.endpoints;
   match (phase, request) {
      (Phase::Enable, Request::StartStream { use_case, metadata }) => {
         let ases = required(endpoints.ids_where(*use_case, |a| a.state == AseState::QosConfigured))?;
         Ok(single(BapRequest::Enable {
            ases,
            metadata: streaming_metadata(*use_case, metadata),
         }))
      },
      (Phase::StartReady, Request::StartStream { use_case, .. }) => {
         let ases = required(endpoints.ids_where(*use_case, |a| a.state.is_active()))?;
         Ok(single(BapRequest::ReceiverStartReady(ases)))
      },
      (Phase::UpdateMetadata, Request::UpdateAudio { use_case, metadata }) => {
         let ases = required(endpoints.ids_where(*use_case, |a| a.state.is_active()))?;
         Ok(single(BapRequest::UpdateMetadata {
            ases,
            metadata: streaming_metadata(*use_case, metadata),
         }))
      },
      (Phase::Disable, Request::StopStream { use_case, .. }) => Ok(unless_empty(
         endpoints.ids_where(*use_case, |a| a.state.is_active()),
         BapRequest::Disable,
      )),
      (Phase::StopReady, Request::StopStream { use_case, .. }) => Ok(unless_empty(
         endpoints.ids_where(*use_case, |a| {
            a.direction == Direction::Source && a.state == AseState::Disabled
         }),
         BapRequest::ReceiverStopReady,
      )),
      (Phase::Release, Request::StopStream { use_case, .. } | Request::UnicastDisconnect { use_case }) => {
         Ok(unless_empty(
            endpoints.ids_where(*use_case, |a| {
               !matches!(a.state, AseState::Idle | AseState::Released)
            }),
            BapRequest::Release,
         ))
      },
      _ => Err(Failure::NullInstance),
   }
}

fn configure_codec(device: &mut DeviceRecord, params: &UnicastConnect) -> Result<Requests, Failure> {
   let caps = device
      .capabilities
      .as_ref()
      .ok_or(Failure::CapabilitiesNotDiscovered)?;
   let directions = params
      .use_case
      .cis_direction()
      .ok_or(Failure::InvalidParameter)?;

   let mut configs: SmallVec<[AseConfig; 2]> = SmallVec::new();
   for direction in [Direction::Sink, Direction::Source] {
      if !directions.has(direction) {
         continue;
      }
      let (codec, count) = codec_for(params, direction);
      let codec = codec.ok_or(Failure::InvalidParameter)?;
      let available = device.available.get(direction);
      if !available.contains(params.use_case) && !available.contains(Context::UNSPECIFIED) {
         return Err(Failure::ContextUnavailable);
      }
      if !caps.supports(direction, &codec) {
         return Err(Failure::NotSupported);
      }
      let ases = device
         .endpoints
         .select_configurable(direction, params.use_case, usize::from(count.max(1)))
         .ok_or(Failure::InsufficientEndpoints)?;
      configs.extend(ases.into_iter().map(|ase_id| AseConfig {
         ase_id,
         direction,
         codec,
      }));
   }

   for config in &configs {
      if let Some(ase) = device.endpoints.get_mut(config.ase_id) {
         ase.reserve(params.use_case, config.codec);
      }
   }
   Ok(single(BapRequest::ConfigureCodec(configs)))
}

/// Assigns CIS ids for one device and builds its QoS write. The n-th sink and
/// the n-th source endpoint of a device share a CIS.
fn configure_qos(group: &mut GroupInstance, cid: Cid, use_case: Context) -> Result<Requests, Failure> {
   let configured = |ase: &StreamEndpoint| {
      matches!(ase.state, AseState::CodecConfigured | AseState::QosConfigured)
   };
   let device = group.device(cid).ok_or(Failure::InvalidDevice)?;
   let sinks = device
      .endpoints
      .ids_where(use_case, |a| a.direction == Direction::Sink && configured(a));
   let sources = device
      .endpoints
      .ids_where(use_case, |a| a.direction == Direction::Source && configured(a));
   if sinks.is_empty() && sources.is_empty() {
      return Err(Failure::NotConfigured);
   }

   let cig = group.cig_mut(use_case).ok_or(Failure::NotConfigured)?;
   let cig_id = cig.id;
   let cis_ids: SmallVec<[u8; 2]> = (0..sinks.len().max(sources.len()))
      .map(|_| cig.next_cis_id())
      .collect();

   let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
   let mut qos: SmallVec<[AseQos; 2]> = SmallVec::new();
   for list in [&sinks, &sources] {
      for (ase_id, cis_id) in list.iter().zip(&cis_ids) {
         let ase = device.endpoints.get_mut(*ase_id).ok_or(Failure::NullInstance)?;
         let codec = ase.codec.ok_or(Failure::NullInstance)?;
         ase.cig_id = Some(cig_id);
         ase.cis_id = *cis_id;
         qos.push(AseQos {
            ase_id: *ase_id,
            cig_id,
            cis_id: *cis_id,
            qos: codec.qos(),
         });
      }
   }
   Ok(single(BapRequest::ConfigureQos(qos)))
}

/// Applies endpoint states confirmed by the remote, reporting each change once.
pub fn apply_ase_states(
   group: &mut GroupInstance,
   cid: Cid,
   states: &[(u8, AseState)],
   events: &EventSender,
) -> OpResult {
   let group_id = group.id;
   let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
   for (ase_id, state) in states {
      let Some(ase) = device.endpoints.get_mut(*ase_id) else {
         debug!("{cid}: state for unknown ASE {ase_id}");
         continue;
      };
      let use_case = ase.use_case;
      if ase.apply_state(*state)?.is_changed() {
         events.emit(
            group_id,
            CapEvent::StreamStateChanged {
               cid,
               ase_id: *ase_id,
               state: *state,
               use_case,
            },
         );
      }
   }
   Ok(())
}

/// Folds one stream-endpoint completion into the device record.
pub fn apply(
   group: &mut GroupInstance,
   cid: Cid,
   request: &Request,
   response: SubResponse,
   events: &EventSender,
) -> OpResult {
   match response {
      SubResponse::AseStates(states) => apply_ase_states(group, cid, &states, events),
      SubResponse::CisBound(bindings) => {
         let use_case = request.use_case().ok_or(Failure::NullInstance)?;
         let cig_id = group.cig(use_case).ok_or(Failure::NotConfigured)?.id;
         group.bind_cis(cid, cig_id, &bindings)
      },
      SubResponse::Capabilities(caps) => {
         let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
         device.available = caps.available;
         device.capabilities = Some(caps);
         device.endpoints.mark_discovered();
         Ok(())
      },
      SubResponse::Contexts(available) => {
         let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
         device.available = available;
         if let Some(caps) = device.capabilities.as_mut() {
            caps.available = available;
         }
         Ok(())
      },
      _ => Ok(()),
   }
}

/// Group bookkeeping once a unicast operation has been confirmed.
pub fn complete(group: &mut GroupInstance, op: &PendingOp) {
   let Some(use_case) = op.request.use_case() else {
      return;
   };
   if matches!(op.request, Request::UnicastConnect(_)) {
      // Reservations the remote never acted on
      for cid in &op.touched {
         let Some(device) = group.device_mut(*cid) else {
            continue;
         };
         if !device.slot(Lane::General).status.is_failed() {
            continue;
         }
         for ase in device.endpoints.iter_mut() {
            if ase.serves(use_case)
               && matches!(
                  ase.state,
                  AseState::Idle | AseState::DiscoverComplete | AseState::Released
               )
            {
               ase.release();
            }
         }
      }
   }
   let in_use = group
      .devices
      .iter()
      .any(|d| d.endpoints.iter().any(|a| a.serves(use_case)));
   if !in_use {
      group.drop_cig(use_case);
   }
}
