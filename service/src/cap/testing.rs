//! Test doubles for the orchestrator: a recording sub-client set, a
//! collecting event bus and a well-behaved fake remote.

use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};

use crate::{
   cap::{
      arena::GroupId,
      ase::AseState,
      group::GroupInstance,
      subclient::{
         AseHandle, BapHandles, BapRequest, BassHandles, BassRequest, CisBinding, CsipHandles,
         CsipRequest, DeviceHandles, HandleSet, MicpHandles, MicpRequest, SubClients, SubOutcome,
         SubRequest, SubResponse, Ticket, VcpHandles, VcpRequest,
      },
      types::{
         AvailableContexts, Capabilities, Cid, CodecConfig, Context, Direction, FrameDuration,
         MicState, PacRecord, SamplingFrequency, Service, SetInfo, VolumeState,
      },
   },
   event::{CapEvent, EventBus},
};

#[derive(Debug, Default)]
pub struct MockSubClients {
   pub issued: Vec<(Ticket, SubRequest)>,
   pub restored: Vec<Cid>,
   pub released: Vec<Cid>,
}

impl MockSubClients {
   /// Hands out everything issued so far.
   pub fn take(&mut self) -> Vec<(Ticket, SubRequest)> {
      std::mem::take(&mut self.issued)
   }
}

impl SubClients for MockSubClients {
   fn issue(&mut self, ticket: Ticket, request: SubRequest) {
      self.issued.push((ticket, request));
   }

   fn restore(&mut self, cid: Cid, _handles: &DeviceHandles) {
      self.restored.push(cid);
   }

   fn release(&mut self, cid: Cid) {
      self.released.push(cid);
   }
}

#[derive(Debug, Default)]
pub struct CollectingBus {
   events: Mutex<Vec<(GroupId, CapEvent)>>,
}

impl CollectingBus {
   pub fn take(&self) -> Vec<(GroupId, CapEvent)> {
      std::mem::take(&mut *self.events.lock())
   }
}

impl EventBus for CollectingBus {
   fn emit(&self, group: GroupId, event: CapEvent) {
      self.events.lock().push((group, event));
   }
}

// === Fixtures ===

/// Two sink endpoints (1, 2) and one source endpoint (3).
pub fn bap_handles() -> BapHandles {
   BapHandles {
      service: 0x10,
      control_point: 0x2A,
      sink_ases: smallvec![
         AseHandle { ase_id: 1, handle: 0x20 },
         AseHandle { ase_id: 2, handle: 0x23 },
      ],
      source_ases: smallvec![AseHandle { ase_id: 3, handle: 0x26 }],
      pacs_service: 0x30,
      sink_pac: Some(0x32),
      source_pac: Some(0x35),
      available_contexts: 0x38,
      supported_contexts: 0x3B,
   }
}

pub fn handle_set(service: Service) -> HandleSet {
   match service {
      Service::Bap => HandleSet::Bap(bap_handles()),
      Service::Csip => HandleSet::Csip(CsipHandles {
         service: 0x40,
         size: 0x42,
         lock: 0x44,
         rank: 0x46,
      }),
      Service::Vcp => HandleSet::Vcp(VcpHandles {
         service: 0x50,
         state: 0x52,
         control_point: 0x55,
         flags: 0x57,
      }),
      Service::Micp => HandleSet::Micp(MicpHandles {
         service: 0x60,
         mute: 0x62,
      }),
      Service::Bass => HandleSet::Bass(BassHandles {
         service: 0x70,
         control_point: 0x72,
         receive_states: smallvec![0x74, 0x77],
      }),
   }
}

/// Handles for every service, as if restored from the cache.
pub fn all_handles() -> DeviceHandles {
   let mut handles = DeviceHandles::default();
   for service in [Service::Bap, Service::Csip, Service::Vcp, Service::Micp, Service::Bass] {
      handles.apply(handle_set(service));
   }
   handles
}

pub fn capabilities() -> Capabilities {
   let pac = PacRecord {
      codec_id: CodecConfig::LC3,
      sampling_frequencies: SamplingFrequency::Hz16000.pac_bit()
         | SamplingFrequency::Hz48000.pac_bit(),
      frame_durations: FrameDuration::Ms10.pac_bit(),
      min_octets: 30,
      max_octets: 120,
      preferred_contexts: Context::MEDIA,
   };
   let available = AvailableContexts {
      sink: Context::MEDIA.union(Context::CONVERSATIONAL),
      source: Context::CONVERSATIONAL,
   };
   Capabilities {
      sink: smallvec![pac.clone()],
      source: smallvec![pac],
      available,
      supported: available,
   }
}

// === Fake Remote ===

fn states(ases: &[u8], state: AseState) -> SubOutcome {
   Ok(SubResponse::AseStates(ases.iter().map(|id| (*id, state)).collect()))
}

/// What a cooperative remote answers to `request`, given the group as it
/// stands when the answer arrives.
pub fn respond(group: &GroupInstance, ticket: &Ticket, request: &SubRequest) -> SubOutcome {
   let device = group.device(ticket.cid);
   let rank = device
      .and_then(|d| group.devices.iter().position(|o| o.cid == d.cid))
      .map_or(1, |i| i as u8 + 1);
   match request {
      SubRequest::Discover(service) => Ok(SubResponse::Discovered(handle_set(*service))),
      SubRequest::SetNotify { .. } => Ok(SubResponse::Done),
      SubRequest::Csip(CsipRequest::SetLock(_)) => Ok(SubResponse::Done),
      SubRequest::Csip(CsipRequest::ReadSetInfo) => Ok(SubResponse::SetInfo(SetInfo {
         size: group.devices.len() as u8,
         rank,
         locked: false,
      })),
      SubRequest::Vcp(VcpRequest::ReadState) => Ok(SubResponse::Volume(VolumeState::default())),
      SubRequest::Vcp(_) => Ok(SubResponse::Done),
      SubRequest::Micp(MicpRequest::ReadState) => Ok(SubResponse::Mic(MicState::Unmuted)),
      SubRequest::Micp(_) => Ok(SubResponse::Done),
      SubRequest::Bass(BassRequest::ReadReceiveStates) => Ok(SubResponse::ReceiveStates(Vec::new())),
      SubRequest::Bass(_) => Ok(SubResponse::Done),
      SubRequest::Bap(request) => match request {
         BapRequest::ReadCapabilities => Ok(SubResponse::Capabilities(capabilities())),
         BapRequest::ReadAvailableContexts => Ok(SubResponse::Contexts(capabilities().available)),
         BapRequest::ConfigureCodec(configs) => {
            let ids: SmallVec<[u8; 4]> = configs.iter().map(|c| c.ase_id).collect();
            states(&ids, AseState::CodecConfigured)
         },
         BapRequest::ConfigureQos(qos) => {
            let ids: SmallVec<[u8; 4]> = qos.iter().map(|q| q.ase_id).collect();
            states(&ids, AseState::QosConfigured)
         },
         BapRequest::Enable { ases, .. } => states(ases, AseState::Enabled),
         BapRequest::ConnectCis { cig_id, cis_ids } => Ok(SubResponse::CisBound(
            cis_ids
               .iter()
               .map(|cis_id| CisBinding {
                  cis_id: *cis_id,
                  cis_handle: 0x60 + u16::from(*cig_id) * 0x10 + u16::from(*cis_id),
               })
               .collect(),
         )),
         BapRequest::ReceiverStartReady(ases) => states(ases, AseState::Streaming),
         BapRequest::Disable(ases) => Ok(SubResponse::AseStates(
            ases
               .iter()
               .map(|id| {
                  let source = device
                     .and_then(|d| d.endpoints.get(*id))
                     .is_some_and(|a| a.direction == Direction::Source);
                  let state = if source { AseState::Disabled } else { AseState::QosConfigured };
                  (*id, state)
               })
               .collect(),
         )),
         BapRequest::ReceiverStopReady(ases) => states(ases, AseState::QosConfigured),
         BapRequest::UpdateMetadata { ases, .. } => Ok(SubResponse::AseStates(
            ases
               .iter()
               .filter_map(|id| device.and_then(|d| d.endpoints.get(*id)))
               .map(|a| (a.id, a.state))
               .collect(),
         )),
         BapRequest::Release(ases) => states(ases, AseState::Released),
      },
   }
}
