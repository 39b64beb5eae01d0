//! The orchestrator: registry of live groups and the entry points the owning
//! event loop drives.
//!
//! Everything here runs on one task. Application requests enter through
//! [`Orchestrator::submit`] (and the membership calls), sub-client outcomes
//! through [`Orchestrator::on_completion`], remote changes through
//! [`Orchestrator::on_notification`] and link supervision through
//! [`Orchestrator::on_link_lost`]. Each entry point runs to completion,
//! including any follow-up work it queued, before returning.

use std::collections::{HashMap, VecDeque};

use log::{debug, error, info, warn};
use serde::Serialize;
use smallvec::SmallVec;
use smol_str::SmolStr;
use strum::IntoEnumIterator;

use crate::{
   cap::{
      UpdateOp,
      aggregate::{Confirmation, aggregate},
      arena::{Arena, GroupId},
      ase::StreamEndpoint,
      bass::{self, AssistantState},
      fanout,
      group::{CapState, Cig, DeviceRecord, GroupInstance, LockState},
      lock,
      phase,
      request::{
         AppTask, ConnectionSpec, GroupSpec, OpKind, PendingOp, Phase, QueuedRequest, Request,
         Responder,
      },
      status::{Failure, OpResult},
      subclient::{Lane, SubClients, SubNotification, SubOutcome, Ticket},
      types::{BigEncryption, Cid, MicState, Service, VolumeState},
      unicast,
   },
   event::{CapEvent, EventSender},
};

const LANES: [Lane; 2] = [Lane::General, Lane::Assistant];

/// Work an entry point leaves for after its own event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
   /// Confirm the lane's operation without fanning out, if it is still `seq`.
   Complete { group: GroupId, lane: Lane, seq: u32 },
   /// Start the next queued request once the general lane is idle.
   Dispatch(GroupId),
   /// Re-check fan-in after a device left.
   Proceed(GroupId, Lane),
}

pub struct Orchestrator<S: SubClients> {
   groups: Arena<GroupInstance>,
   subclients: S,
   events: EventSender,
   deferred: VecDeque<Deferred>,
   /// Owning group of every attached connection.
   cids: HashMap<Cid, GroupId>,
}

impl<S: SubClients> Orchestrator<S> {
   pub fn new(subclients: S, events: EventSender) -> Self {
      Self {
         groups: Arena::new(),
         subclients,
         events,
         deferred: VecDeque::new(),
         cids: HashMap::new(),
      }
   }

   pub const fn subclients(&self) -> &S {
      &self.subclients
   }

   pub const fn subclients_mut(&mut self) -> &mut S {
      &mut self.subclients
   }

   pub fn group(&self, id: GroupId) -> Option<&GroupInstance> {
      self.groups.get(id)
   }

   pub fn group_of(&self, cid: Cid) -> Option<GroupId> {
      self.cids.get(&cid).copied()
   }

   pub fn summaries(&self) -> Vec<GroupSummary> {
      self.groups.iter().map(|(_, group)| GroupSummary::of(group)).collect()
   }

   // === Membership ===

   /// Creates a group for `spec` and runs discovery on its devices.
   ///
   /// The confirmation carries the group handle, or none when no device made
   /// it through discovery.
   pub fn init(&mut self, task: AppTask, spec: GroupSpec, reply: Responder) -> Option<GroupId> {
      if let Err(failure) = self.check_new(&spec.devices) {
         warn!("Refusing group init: {failure}");
         let _ = reply.send(Confirmation::bare(OpKind::Init, None, Err(failure)));
         return None;
      }
      let set_size = spec.set_size.max(1);
      let id = self
         .groups
         .insert_with(|id| GroupInstance::new(id, set_size, task.clone()));
      info!("{id}: created for {} device(s), set size {set_size}", spec.devices.len());
      for connection in &spec.devices {
         self.attach(id, connection);
      }
      self.submit(id, task, Request::Init, reply);
      Some(id)
   }

   pub fn add_device(&mut self, id: GroupId, task: AppTask, spec: ConnectionSpec, reply: Responder) {
      let checked = match self.groups.get(id) {
         None => Err(Failure::InvalidGroup),
         Some(group) if !group.is_registered(&task) => Err(Failure::TaskNotRegistered),
         Some(_) => self.check_new(std::slice::from_ref(&spec)),
      };
      if let Err(failure) = checked {
         let group = (failure != Failure::InvalidGroup).then_some(id);
         let _ = reply.send(Confirmation::bare(OpKind::AddDevice, group, Err(failure)));
         return;
      }
      self.attach(id, &spec);
      self.submit(id, task, Request::AddDevice(spec), reply);
   }

   /// Drops a connection from its group. Whatever it owed an in-flight
   /// operation fails with [`Failure::Disconnected`].
   pub fn remove_device(&mut self, id: GroupId, cid: Cid) -> OpResult {
      let group = self.groups.get(id).ok_or(Failure::InvalidGroup)?;
      if group.device(cid).is_none() {
         return Err(Failure::InvalidDevice);
      }
      info!("{id}: removing {cid}");
      self.detach(id, cid);
      self.pump();
      Ok(())
   }

   pub fn register_task(&mut self, id: GroupId, task: AppTask) -> OpResult {
      self
         .groups
         .get_mut(id)
         .ok_or(Failure::InvalidGroup)?
         .register_task(task)
   }

   pub fn deregister_task(&mut self, id: GroupId, task: &AppTask) -> OpResult {
      self
         .groups
         .get_mut(id)
         .ok_or(Failure::InvalidGroup)?
         .deregister_task(task)
   }

   /// Tears a group down. In-flight and queued requests are confirmed with
   /// [`Failure::Cancelled`]; completions still on their way are discarded.
   pub fn destroy(&mut self, id: GroupId) -> OpResult {
      self.teardown(id).ok_or(Failure::InvalidGroup)?;
      self.pump();
      Ok(())
   }

   fn check_new(&self, specs: &[ConnectionSpec]) -> OpResult {
      if specs.is_empty() {
         return Err(Failure::InvalidParameter);
      }
      for (i, spec) in specs.iter().enumerate() {
         if self.cids.contains_key(&spec.cid) || specs[..i].iter().any(|s| s.cid == spec.cid) {
            return Err(Failure::InvalidDevice);
         }
      }
      Ok(())
   }

   fn attach(&mut self, id: GroupId, spec: &ConnectionSpec) {
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      if let Some(cached) = spec.cached.as_ref().filter(|h| !h.is_empty()) {
         debug!("{id}: {} restored from cache", spec.cid);
         self.subclients.restore(spec.cid, cached);
      }
      group.devices.push(DeviceRecord::new(spec));
      self.cids.insert(spec.cid, id);
   }

   fn detach(&mut self, id: GroupId, cid: Cid) {
      if let Some(group) = self.groups.get_mut(id) {
         for lane in LANES {
            fanout::fail_device(group, lane, cid, Failure::Disconnected);
         }
         group.devices.retain(|d| d.cid != cid);
         group.assistant.forget(cid);
         for lane in LANES {
            self.deferred.push_back(Deferred::Proceed(id, lane));
         }
      }
      self.subclients.release(cid);
      self.cids.remove(&cid);
   }

   fn teardown(&mut self, id: GroupId) -> Option<()> {
      let mut group = self.groups.remove(id)?;
      let cancelled = |kind: OpKind| Confirmation::bare(kind, Some(id), Err(Failure::Cancelled));
      for lane in LANES {
         if let Some(mut op) = group.lane(lane).finish() {
            debug!("{id}: cancelling in-flight {}", op.request.kind());
            op.respond(cancelled(op.request.kind()));
         }
      }
      for entry in group.general.queue.drain() {
         let _ = entry.reply.send(cancelled(entry.request.kind()));
      }
      for device in &group.devices {
         self.subclients.release(device.cid);
         self.cids.remove(&device.cid);
      }
      info!("{id}: destroyed");
      Some(())
   }

   // === Requests ===

   /// Submits one logical operation. General requests queue behind the one in
   /// flight; broadcast-assistant requests are refused with
   /// [`Failure::Busy`] instead.
   pub fn submit(&mut self, id: GroupId, task: AppTask, request: Request, reply: Responder) {
      let kind = request.kind();
      let Some(group) = self.groups.get_mut(id) else {
         debug!("{kind} for unknown {id}");
         let _ = reply.send(Confirmation::bare(kind, None, Err(Failure::InvalidGroup)));
         return;
      };
      if !group.is_registered(&task) {
         let _ = reply.send(Confirmation::bare(kind, Some(id), Err(Failure::TaskNotRegistered)));
         return;
      }

      let entry = QueuedRequest {
         task,
         request,
         reply,
      };
      match entry.request.lane() {
         Lane::General => match group.general.admit(entry) {
            Some(entry) => self.start(id, entry),
            None => debug!("{id}: {kind} queued ({} waiting)", group.general.queue.len()),
         },
         Lane::Assistant => match group.assistant.admit(&entry.request) {
            Ok(state) => {
               debug!("{id}: assistant {state}");
               self.start(id, entry);
            },
            Err(failure) => {
               debug!("{id}: {kind} refused: {failure}");
               let _ = entry.reply.send(Confirmation::bare(kind, Some(id), Err(failure)));
            },
         },
      }
      self.pump();
   }

   fn start(&mut self, id: GroupId, entry: QueuedRequest) {
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      let lane = entry.request.lane();
      let seq = group.next_seq();
      let mut op = PendingOp::new(seq, entry);
      let kind = op.request.kind();

      let gate = match lane {
         Lane::General => group.cap_state.validate(kind),
         Lane::Assistant => Ok(()),
      }
      .and_then(|()| phase::prepare(group, &op.request));
      match gate {
         Err(failure) => op.verdict = Some(failure),
         Ok(()) => {
            op.touched = fanout::resolve_touched(group, &op.request);
            if op.touched.is_empty() {
               op.verdict = Some(Failure::NoDevice);
            }
         },
      }

      let deferred = op.verdict.is_some();
      if !deferred {
         if lane == Lane::General && lock::needs_lock(group, &op) {
            debug!("{id}: {kind} locks the set first");
            op.lock_first();
         }
         fanout::begin(group, lane, &op.touched);
      }
      debug!("{id}: starting {kind} #{seq} on {} device(s)", op.touched.len());
      if let Err(mut op) = group.lane(lane).begin(op) {
         error!("{id}: {kind} started on a busy lane");
         op.respond(Confirmation::bare(kind, Some(id), Err(Failure::NullInstance)));
         return;
      }

      if deferred {
         self.deferred.push_back(Deferred::Complete {
            group: id,
            lane,
            seq,
         });
      } else {
         self.issue(id, lane);
      }
   }

   fn issue(&mut self, id: GroupId, lane: Lane) {
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      match fanout::issue(group, lane, &mut self.subclients) {
         Ok(count) => {
            if let Some(op) = group.pending(lane) {
               debug!("{id}: {} round of {}: {count} request(s)", op.phase, op.request.kind());
            }
            self.proceed(id, lane);
         },
         Err(failure) => {
            error!("{id}: fan-out failed: {failure}");
            self.abort(id, lane, failure);
         },
      }
   }

   /// Moves the lane's operation on once the current round has been fully
   /// answered.
   fn proceed(&mut self, id: GroupId, lane: Lane) {
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      if !fanout::is_complete(group, lane) {
         return;
      }
      let Some(op) = group.pending(lane) else {
         return;
      };

      let finished = op.phase;
      if finished == Phase::Discover {
         for device in op.touched.iter().filter_map(|cid| group.device(*cid)) {
            if !device.slot(lane).status.is_failed() {
               self.events.emit(
                  id,
                  CapEvent::HandlesDiscovered {
                     cid: device.cid,
                     address: device.address.clone(),
                     handles: device.handles.clone(),
                  },
               );
            }
         }
      }
      let lock_failed = finished == Phase::Lock && lock::lock_failed(group, op);
      if lock_failed {
         warn!("{id}: set lock unavailable, releasing partial locks");
      }

      let more = group
         .lane(lane)
         .pending_mut()
         .is_some_and(|op| op.advance(lock_failed));
      if more {
         self.issue(id, lane);
      } else {
         self.finish(id, lane);
      }
   }

   /// Forces the lane back to idle after an internal consistency failure.
   fn abort(&mut self, id: GroupId, lane: Lane, failure: Failure) {
      if let Some(group) = self.groups.get_mut(id) {
         let touched = match group.lane(lane).pending_mut() {
            Some(op) => {
               op.verdict = Some(failure);
               op.touched.clone()
            },
            None => SmallVec::new(),
         };
         for cid in touched {
            fanout::fail_device(group, lane, cid, failure);
         }
      }
      self.finish(id, lane);
   }

   fn finish(&mut self, id: GroupId, lane: Lane) {
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      let Some(mut op) = group.lane(lane).finish() else {
         return;
      };
      fanout::settle(group, lane, &op.touched);
      let mut confirmation = aggregate(group, lane, &op);
      let any_success = confirmation.any_success();

      match lane {
         Lane::General => {
            if op.verdict.is_none() && any_success {
               let next = group.cap_state.after(&op.request);
               if next != group.cap_state {
                  debug!("{id}: {} -> {next}", group.cap_state);
                  group.cap_state = next;
               }
            }
            unicast::complete(group, &op);
         },
         Lane::Assistant => {
            let results = confirmation.devices.iter().map(|d| (d.cid, d.result.is_ok()));
            group.assistant.settle(results);
         },
      }

      // Devices that never made it through discovery do not join
      if matches!(op.request, Request::Init | Request::AddDevice(_)) {
         let failed: SmallVec<[Cid; 2]> = confirmation
            .devices
            .iter()
            .filter(|d| d.result.is_err())
            .map(|d| d.cid)
            .collect();
         for cid in failed {
            warn!("{id}: dropping {cid}, discovery failed");
            self.detach(id, cid);
         }
      }
      let empty = self.groups.get(id).is_none_or(|g| g.devices.is_empty());
      let dissolve = matches!(op.request, Request::Init) && empty;
      if dissolve {
         confirmation.group = None;
      }

      match &confirmation.result {
         Ok(()) => info!("{id}: {} done", confirmation.op),
         Err(failure) => info!("{id}: {} failed: {failure}", confirmation.op),
      }
      op.respond(confirmation);

      if dissolve {
         self.teardown(id);
      } else {
         self.deferred.push_back(Deferred::Dispatch(id));
      }
   }

   /// Runs deferred work until none is left.
   fn pump(&mut self) {
      while let Some(work) = self.deferred.pop_front() {
         match work {
            Deferred::Complete { group, lane, seq } => {
               let current = self
                  .groups
                  .get_mut(group)
                  .is_some_and(|g| g.lane(lane).current(seq).is_some());
               if current {
                  self.finish(group, lane);
               }
            },
            Deferred::Dispatch(id) => {
               let next = self.groups.get_mut(id).and_then(|g| g.general.next_ready());
               if let Some(entry) = next {
                  self.start(id, entry);
               }
            },
            Deferred::Proceed(id, lane) => self.proceed(id, lane),
         }
      }
   }

   // === Sub-client Events ===

   /// Counts one sub-request outcome. Outcomes for destroyed groups, finished
   /// operations or departed devices are dropped.
   pub fn on_completion(&mut self, ticket: Ticket, outcome: SubOutcome) {
      let Ticket {
         group: id,
         cid,
         lane,
         seq,
         service,
      } = ticket;
      let Some(group) = self.groups.get_mut(id) else {
         debug!("Discarding {service} completion for {cid}: {id} is gone");
         return;
      };
      let Some(op) = group.lane(lane).current(seq) else {
         debug!("Discarding stale {service} completion #{seq} for {cid}");
         return;
      };
      if !op.touched.contains(&cid) {
         debug!("Discarding {service} completion for untouched {cid}");
         return;
      }
      let round = op.phase;
      let request = op.request.clone();
      if !group.device(cid).is_some_and(|d| d.connected) {
         debug!("Discarding {service} completion for departed {cid}");
         return;
      }

      let result = phase::apply(group, cid, lane, round, &request, service, outcome, &self.events);
      if let Err(failure) = &result {
         warn!("{id} {cid}: {round} round failed: {failure}");
      }
      if let Err(failure) = fanout::record(group, lane, cid, result) {
         error!("{id} {cid}: unexpected {service} completion: {failure}");
         self.abort(id, lane, failure);
      } else {
         self.proceed(id, lane);
      }
      self.pump();
   }

   /// Applies an unsolicited remote change and forwards it as an indication.
   pub fn on_notification(&mut self, cid: Cid, notification: SubNotification) {
      let Some(id) = self.group_of(cid) else {
         debug!("Notification from unattached {cid}");
         return;
      };
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      if let SubNotification::AseState { ase_id, state } = notification {
         if let Err(failure) = unicast::apply_ase_states(group, cid, &[(ase_id, state)], &self.events)
         {
            warn!("{id} {cid}: {failure}");
         }
         return;
      }
      let Some(device) = group.device_mut(cid) else {
         return;
      };

      let event = match notification {
         SubNotification::AseState { .. } => None,
         SubNotification::Contexts(available) => {
            device.available = available;
            if let Some(caps) = device.capabilities.as_mut() {
               caps.available = available;
            }
            None
         },
         SubNotification::Volume(state) => UpdateOp::replace(&mut device.volume, Some(state))
            .is_changed()
            .then_some(CapEvent::VolumeChanged { cid, state }),
         SubNotification::Mic(state) => UpdateOp::replace(&mut device.mic, Some(state))
            .is_changed()
            .then_some(CapEvent::MicStateChanged { cid, state }),
         SubNotification::LockReleased => {
            device.lock = LockState::Unlocked;
            Some(CapEvent::LockReleased { cid })
         },
         SubNotification::ReceiveState(state) => {
            let source_id = state.source_id;
            let wants_code = state.encryption == BigEncryption::CodeRequired;
            match bass::upsert_receive_state(&mut device.receive_states, state.clone()) {
               UpdateOp::Noop => None,
               update => {
                  let asked_before = matches!(
                     &update,
                     UpdateOp::Updated(prev) if prev.encryption == BigEncryption::CodeRequired
                  );
                  self.events.emit(id, CapEvent::ReceiveStateChanged { cid, state });
                  (wants_code && !asked_before)
                     .then_some(CapEvent::BroadcastCodeRequested { cid, source_id })
               },
            }
         },
         SubNotification::ReceiveStateCleared { source_id } => {
            bass::remove_receive_state(&mut device.receive_states, source_id)
               .is_changed()
               .then_some(CapEvent::ReceiveStateCleared { cid, source_id })
         },
         SubNotification::SourceFound(report) => Some(CapEvent::SourceFound { cid, report }),
      };
      if let Some(event) = event {
         self.events.emit(id, event);
      }
   }

   /// Marks a connection as gone. Its outstanding sub-requests fail with
   /// [`Failure::Disconnected`]; the record stays until removed.
   pub fn on_link_lost(&mut self, cid: Cid) {
      let Some(id) = self.group_of(cid) else {
         return;
      };
      let Some(group) = self.groups.get_mut(id) else {
         return;
      };
      let Some(device) = group.device_mut(cid).filter(|d| d.connected) else {
         return;
      };
      device.connected = false;
      device.lock = LockState::Unlocked;
      let address = device.address.clone();
      info!("{id}: {cid} ({address}) disconnected");
      group.assistant.forget(cid);

      for lane in LANES {
         if fanout::fail_device(group, lane, cid, Failure::Disconnected) {
            debug!("{id}: failed outstanding requests of {cid}");
         }
      }
      self.subclients.release(cid);
      self.events.emit(id, CapEvent::DeviceDisconnected { cid, address });
      for lane in LANES {
         self.proceed(id, lane);
      }
      self.pump();
   }
}

// === Summaries ===

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
   pub cid: Cid,
   pub address: SmolStr,
   pub connected: bool,
   pub services: Vec<Service>,
   pub lock: LockState,
   /// Remote scanning running on this device.
   pub scanning: bool,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub rank: Option<u8>,
   pub endpoints: Vec<StreamEndpoint>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub volume: Option<VolumeState>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub mic: Option<MicState>,
}

/// Snapshot of a group for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
   pub id: u64,
   pub set_size: u8,
   pub connected: usize,
   pub cap_state: CapState,
   pub assistant: AssistantState,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub pending: Option<OpKind>,
   pub queued: usize,
   pub tasks: Vec<AppTask>,
   pub cigs: Vec<Cig>,
   pub devices: Vec<DeviceSummary>,
}

impl GroupSummary {
   fn of(group: &GroupInstance) -> Self {
      let devices = group
         .devices
         .iter()
         .map(|d| DeviceSummary {
            cid: d.cid,
            address: d.address.clone(),
            connected: d.connected,
            services: Service::iter().filter(|s| d.supports(*s)).collect(),
            lock: d.lock,
            scanning: group.assistant.is_scanning(d.cid),
            rank: d.set_info.map(|info| info.rank),
            endpoints: d.endpoints.iter().cloned().collect(),
            volume: d.volume,
            mic: d.mic,
         })
         .collect();
      Self {
         id: group.id.to_raw(),
         set_size: group.set_size,
         connected: group.current_device_count(),
         cap_state: group.cap_state,
         assistant: group.assistant.state,
         pending: group.pending(Lane::General).map(|op| op.request.kind()),
         queued: group.general.queue.len(),
         tasks: group.tasks.to_vec(),
         cigs: group.cigs.to_vec(),
         devices,
      }
   }
}
