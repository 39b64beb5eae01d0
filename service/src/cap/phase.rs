//! What each round asks of one device, and how the answers are folded back
//! into the device record.

use log::debug;
use smallvec::SmallVec;
use strum::IntoEnumIterator;

use crate::{
   cap::{
      UpdateOp,
      aggregate::DeviceValue,
      bass,
      fanout::Requests,
      group::GroupInstance,
      lock,
      request::{Phase, ReadItem, Request},
      status::{Failure, OpResult},
      subclient::{
         BapRequest, BassRequest, CsipRequest, Lane, MicpRequest, SubOutcome, SubRequest,
         SubResponse, VcpRequest,
      },
      types::{Cid, Service},
      unicast,
   },
   event::{CapEvent, EventSender},
};

fn single(request: SubRequest) -> Requests {
   SmallVec::from_elem(request, 1)
}

/// Group-wide checks made when an operation starts, before any fan-out.
pub fn prepare(group: &mut GroupInstance, request: &Request) -> OpResult {
   unicast::prepare(group, request)
}

/// Sub-requests of `phase` for device `cid`.
pub fn build(
   group: &mut GroupInstance,
   cid: Cid,
   phase: Phase,
   request: &Request,
) -> Result<Requests, Failure> {
   let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
   Ok(match (phase, request) {
      (Phase::Discover, _) => Service::iter()
         .filter(|service| !device.supports(*service))
         .map(SubRequest::Discover)
         .collect(),
      (Phase::ReadSetInfo, _) => match device.supports(Service::Csip) {
         true => single(SubRequest::Csip(CsipRequest::ReadSetInfo)),
         false => Requests::new(),
      },
      (Phase::Lock, _) => lock::lock_request(device).into_iter().collect(),
      (Phase::Unlock, _) => lock::unlock_request(device).into_iter().collect(),
      (Phase::Volume, Request::SetVolume(volume)) => {
         single(SubRequest::Vcp(VcpRequest::SetAbsoluteVolume(*volume)))
      },
      (Phase::Mute, Request::Mute(mute)) => single(SubRequest::Vcp(VcpRequest::SetMute(*mute))),
      (Phase::MicMute, Request::SetMicMute { mute, .. }) => {
         single(SubRequest::Micp(MicpRequest::SetMute(*mute)))
      },
      (Phase::Read, Request::Read { item, .. }) => single(match item {
         ReadItem::Volume => SubRequest::Vcp(VcpRequest::ReadState),
         ReadItem::Mic => SubRequest::Micp(MicpRequest::ReadState),
         ReadItem::ReceiveStates => SubRequest::Bass(BassRequest::ReadReceiveStates),
         ReadItem::SetInfo => SubRequest::Csip(CsipRequest::ReadSetInfo),
         ReadItem::AvailableContexts => SubRequest::Bap(BapRequest::ReadAvailableContexts),
      }),
      (Phase::Notify, Request::RegisterNotifications { services, enable }) => services
         .iter()
         .filter(|service| device.supports(**service))
         .map(|service| SubRequest::SetNotify {
            service: *service,
            enable: *enable,
         })
         .collect(),
      (Phase::Assistant, _) => bass::build(device, request)?,
      _ => return unicast::build(group, cid, phase, request),
   })
}

/// Folds the outcome of one sub-request into the device record and returns
/// what it means for the device.
#[allow(clippy::too_many_arguments)]
pub fn apply(
   group: &mut GroupInstance,
   cid: Cid,
   lane: Lane,
   phase: Phase,
   request: &Request,
   service: Service,
   outcome: SubOutcome,
   events: &EventSender,
) -> OpResult {
   match (phase, outcome) {
      (Phase::Discover, Err(Failure::NotSupported)) if !service.is_mandatory() => {
         debug!("{cid}: no {service} service");
         Ok(())
      },
      (Phase::Discover, Err(_)) if service.is_mandatory() => Err(Failure::DiscoveryError),
      (Phase::Lock | Phase::Unlock, outcome) => {
         let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
         lock::apply_lock(device, phase == Phase::Lock, outcome.is_ok());
         outcome.map(drop)
      },
      (_, Err(failure)) => Err(failure),
      (_, Ok(response)) => apply_response(group, cid, lane, request, response, events),
   }
}

fn apply_response(
   group: &mut GroupInstance,
   cid: Cid,
   lane: Lane,
   request: &Request,
   response: SubResponse,
   events: &EventSender,
) -> OpResult {
   let group_id = group.id;
   let reading = matches!(request, Request::Read { .. });
   let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
   let value = match response {
      SubResponse::Done => None,
      SubResponse::Discovered(set) => {
         device.apply_handles(set);
         None
      },
      SubResponse::SetInfo(info) => {
         device.set_info = Some(info);
         if info.size > group.set_size {
            group.set_size = info.size;
         }
         Some(DeviceValue::SetInfo(info))
      },
      SubResponse::Volume(state) => {
         if UpdateOp::replace(&mut device.volume, Some(state)).is_changed() {
            events.emit(group_id, CapEvent::VolumeChanged { cid, state });
         }
         Some(DeviceValue::Volume(state))
      },
      SubResponse::Mic(state) => {
         if UpdateOp::replace(&mut device.mic, Some(state)).is_changed() {
            events.emit(group_id, CapEvent::MicStateChanged { cid, state });
         }
         Some(DeviceValue::Mic(state))
      },
      SubResponse::ReceiveStates(states) => {
         for state in &states {
            bass::upsert_receive_state(&mut device.receive_states, state.clone());
         }
         Some(DeviceValue::ReceiveStates(states))
      },
      SubResponse::Contexts(available) => {
         unicast::apply(group, cid, request, SubResponse::Contexts(available), events)?;
         Some(DeviceValue::Contexts(available))
      },
      other => {
         unicast::apply(group, cid, request, other, events)?;
         None
      },
   };
   if reading && let Some(value) = value {
      let device = group.device_mut(cid).ok_or(Failure::InvalidDevice)?;
      device.slot_mut(lane).value = Some(value);
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use smallvec::smallvec;

   use super::*;
   use crate::cap::{
      arena::Arena,
      group::{DeviceRecord, LockState},
      request::{AppTask, ConnectionSpec},
      subclient::{CsipHandles, DeviceHandles, HandleSet, VcpHandles},
      testing::CollectingBus,
      types::{SetInfo, Target, VolumeState},
   };

   fn group() -> GroupInstance {
      let mut arena = Arena::new();
      let id = arena.insert_with(|id| id);
      let mut group = GroupInstance::new(id, 1, AppTask::new("test"));
      group.devices.push(DeviceRecord::new(&ConnectionSpec {
         cid: Cid(1),
         address: "00:00:00:00:00:01".into(),
         cached: Some(DeviceHandles {
            vcp: Some(VcpHandles::default()),
            ..Default::default()
         }),
      }));
      group
   }

   #[test]
   fn test_discover_skips_cached() {
      let mut group = group();
      let built = build(&mut group, Cid(1), Phase::Discover, &Request::Init).unwrap();
      let services: Vec<Service> = built.iter().map(SubRequest::service).collect();
      assert_eq!(
         services,
         [Service::Bap, Service::Csip, Service::Micp, Service::Bass]
      );
   }

   #[test]
   fn test_discover_outcomes() {
      let mut group = group();
      let bus = Arc::new(CollectingBus::default());
      let events: EventSender = bus.clone();
      let apply_discover = |group: &mut GroupInstance, service, outcome| {
         apply(group, Cid(1), Lane::General, Phase::Discover, &Request::Init, service, outcome, &events)
      };

      assert_eq!(
         apply_discover(&mut group, Service::Micp, Err(Failure::NotSupported)),
         Ok(())
      );
      assert_eq!(
         apply_discover(&mut group, Service::Bap, Err(Failure::NotSupported)),
         Err(Failure::DiscoveryError)
      );
      assert_eq!(
         apply_discover(&mut group, Service::Csip, Err(Failure::Timeout)),
         Err(Failure::Timeout)
      );
      let set = HandleSet::Csip(CsipHandles {
         service: 0x40,
         size: 0x42,
         lock: 0x44,
         rank: 0x46,
      });
      assert_eq!(
         apply_discover(&mut group, Service::Csip, Ok(SubResponse::Discovered(set))),
         Ok(())
      );
      assert!(group.devices[0].supports(Service::Csip));
   }

   #[test]
   fn test_lock_outcome_updates_state() {
      let mut group = group();
      let bus = Arc::new(CollectingBus::default());
      let events: EventSender = bus.clone();
      group.devices[0].lock = LockState::Pending;
      let result = apply(
         &mut group,
         Cid(1),
         Lane::General,
         Phase::Lock,
         &Request::Mute(true),
         Service::Csip,
         Err(Failure::Protocol {
            service: Service::Csip,
            code: 0x80,
         }),
         &events,
      );
      assert!(result.is_err());
      assert_eq!(group.devices[0].lock, LockState::Unlocked);
   }

   #[test]
   fn test_read_attaches_value_and_reports_change_once() {
      let mut group = group();
      let bus = Arc::new(CollectingBus::default());
      let events: EventSender = bus.clone();
      let read = Request::Read {
         target: Target::All,
         item: ReadItem::Volume,
      };
      let state = VolumeState {
         volume: 80,
         mute: false,
         change_counter: 3,
      };
      for _ in 0..2 {
         apply(
            &mut group,
            Cid(1),
            Lane::General,
            Phase::Read,
            &read,
            Service::Vcp,
            Ok(SubResponse::Volume(state)),
            &events,
         )
         .unwrap();
      }
      assert_eq!(
         group.devices[0].slot(Lane::General).value,
         Some(DeviceValue::Volume(state))
      );
      assert_eq!(bus.take().len(), 1);
   }

   #[test]
   fn test_set_info_grows_set() {
      let mut group = group();
      let bus = Arc::new(CollectingBus::default());
      let events: EventSender = bus.clone();
      let info = SetInfo {
         size: 2,
         rank: 1,
         locked: false,
      };
      apply(
         &mut group,
         Cid(1),
         Lane::General,
         Phase::ReadSetInfo,
         &Request::Init,
         Service::Csip,
         Ok(SubResponse::SetInfo(info)),
         &events,
      )
      .unwrap();
      assert_eq!(group.set_size, 2);
      assert_eq!(group.devices[0].rank(), 1);
      // Not a read, nothing attached
      assert_eq!(group.devices[0].slot(Lane::General).value, None);
   }

   #[test]
   fn test_notify_only_present_services() {
      let mut group = group();
      let request = Request::RegisterNotifications {
         services: smallvec![Service::Vcp, Service::Micp],
         enable: true,
      };
      let built = build(&mut group, Cid(1), Phase::Notify, &request).unwrap();
      assert_eq!(
         built.as_slice(),
         &[SubRequest::SetNotify {
            service: Service::Vcp,
            enable: true
         }]
      );
   }
}
