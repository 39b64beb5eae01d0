//! Bluetooth manager driving the CAP orchestrator.
//!
//! This module handles Bluetooth adapter management and connection
//! supervision, and owns the [`Orchestrator`]: application commands, GATT
//! completions, notifications and link losses are all fed to it from one
//! actor task.

use std::{
   collections::HashMap,
   time::{Duration, Instant},
};

use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::{
      gatt::{GattEvent, Timing},
      recognition,
      subclients::GattClients,
   },
   cap::{
      aggregate::Confirmation,
      arena::GroupId,
      orchestrator::{GroupSummary, Orchestrator},
      request::{AppTask, ConnectionSpec, GroupSpec, OpKind, Request},
      status::{Failure, OpResult},
      subclient::{SubClients, SubNotification},
      types::Cid,
   },
   config::{Config, KnownSet},
   error::{CapdError, Result},
   event::EventSender,
   handle_cache::HandleCache,
};
use rand::Rng;

/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum retry delay for adapters and known sets
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Task owning the groups formed from known sets
const AUTO_TASK: &str = "capd";

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   retry_count: u32,
}

// === Known Sets ===

/// Group formed automatically for a configured set.
struct AutoGroup {
   id: Option<GroupId>,
   retry_count: u32,
   retry_at: Option<Instant>,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String), // adapter_name, error
   DeviceLost(Address),

   // Known sets
   AutoGroupSettled { name: SmolStr, ok: bool },

   // Application commands
   InitGroup {
      task: AppTask,
      addresses: Vec<Address>,
      set_size: u8,
      reply: oneshot::Sender<Confirmation>,
   },
   AddDevice {
      group: GroupId,
      task: AppTask,
      address: Address,
      reply: oneshot::Sender<Confirmation>,
   },
   RemoveDevice {
      group: GroupId,
      address: Address,
      reply: oneshot::Sender<OpResult>,
   },
   RegisterTask {
      group: GroupId,
      task: AppTask,
      reply: oneshot::Sender<OpResult>,
   },
   DeregisterTask {
      group: GroupId,
      task: AppTask,
      reply: oneshot::Sender<OpResult>,
   },
   DestroyGroup {
      group: GroupId,
      reply: oneshot::Sender<OpResult>,
   },
   Submit {
      group: GroupId,
      task: AppTask,
      request: Request,
      reply: oneshot::Sender<Confirmation>,
   },
   GetGroups(oneshot::Sender<Vec<GroupSummary>>),
}

// === Main Manager ===

/// Handle to the manager actor.
///
/// Every call is answered once the orchestrator has settled the request;
/// group operations resolve with their [`Confirmation`].
pub struct CapManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl CapManager {
   pub async fn new(
      event_tx: EventSender,
      config: Config,
      cache: Option<HandleCache>,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(config, event_tx, command_rx, session, cache).run());
      Ok(Self { inbox: command_tx })
   }

   async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| CapdError::ManagerShutdown)?;
      rx.await.map_err(|_| CapdError::ManagerShutdown)
   }

   pub async fn init_group(
      &self,
      task: AppTask,
      addresses: Vec<Address>,
      set_size: u8,
   ) -> Result<Confirmation> {
      self
         .call(|reply| ManagerCommand::InitGroup {
            task,
            addresses,
            set_size,
            reply,
         })
         .await
   }

   pub async fn add_device(
      &self,
      group: GroupId,
      task: AppTask,
      address: Address,
   ) -> Result<Confirmation> {
      self
         .call(|reply| ManagerCommand::AddDevice {
            group,
            task,
            address,
            reply,
         })
         .await
   }

   pub async fn remove_device(&self, group: GroupId, address: Address) -> Result<OpResult> {
      self
         .call(|reply| ManagerCommand::RemoveDevice {
            group,
            address,
            reply,
         })
         .await
   }

   pub async fn register_task(&self, group: GroupId, task: AppTask) -> Result<OpResult> {
      self
         .call(|reply| ManagerCommand::RegisterTask { group, task, reply })
         .await
   }

   pub async fn deregister_task(&self, group: GroupId, task: AppTask) -> Result<OpResult> {
      self
         .call(|reply| ManagerCommand::DeregisterTask { group, task, reply })
         .await
   }

   pub async fn destroy_group(&self, group: GroupId) -> Result<OpResult> {
      self
         .call(|reply| ManagerCommand::DestroyGroup { group, reply })
         .await
   }

   pub async fn submit(&self, group: GroupId, task: AppTask, request: Request) -> Result<Confirmation> {
      self
         .call(|reply| ManagerCommand::Submit {
            group,
            task,
            request,
            reply,
         })
         .await
   }

   pub async fn groups(&self) -> Vec<GroupSummary> {
      self
         .call(ManagerCommand::GetGroups)
         .await
         .unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   gatt_rx: mpsc::Receiver<GattEvent>,
   session: Session,
   cache: Option<HandleCache>,

   // State
   orchestrator: Orchestrator<GattClients>,
   adapters: HashMap<SmolStr, AdapterInfo>,
   /// Connection id of every attached device.
   addresses: HashMap<Address, Cid>,
   next_cid: u32,
   auto_groups: HashMap<SmolStr, AutoGroup>,
}

impl ManagerActor {
   fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      session: Session,
      cache: Option<HandleCache>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (gatt_tx, gatt_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let clients = GattClients::new(gatt_tx, Timing::from_config(&config));
      Self {
         config,
         command_rx,
         loopback_rx,
         loopback_tx,
         gatt_rx,
         session,
         cache,
         orchestrator: Orchestrator::new(clients, event_tx),
         adapters: HashMap::new(),
         addresses: HashMap::new(),
         next_cid: 1,
         auto_groups: HashMap::new(),
      }
   }

   async fn run(mut self) {
      info!("CAP manager starting up");

      // Initialize adapters
      self.initialize_adapters().await;

      // Start periodic checks
      let period = self.config.health_check_interval().max(Duration::from_secs(1));
      let mut health_check_interval = time::interval(period);
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Main event loop
      loop {
         select! {
             _ = health_check_interval.tick() => {
                 // Supervise links and group known sets
                 self.check_connection_health().await;
                 self.form_known_sets().await;
             }
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             Some(event) = self.gatt_rx.recv() => {
                 self.handle_gatt_event(event);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("CAP manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      // Cleanup
      self.cleanup().await;
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      // If no adapters found, try default
      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => {
            info!("Initializing adapter: {name}");

            // Ensure adapter is powered on
            if let Ok(powered) = adapter.is_powered().await
               && !powered
            {
               if let Err(e) = adapter.set_powered(true).await {
                  warn!("Failed to power on adapter {name}: {e}");
                  let loopback = self.loopback_tx.clone();
                  tokio::spawn(async move {
                     time::sleep(ADAPTER_RECOVERY_DELAY).await;
                     let _ = loopback
                        .send(ManagerCommand::AdapterAvailable(name, adapter))
                        .await;
                  });
                  return;
               }
               info!("Powered on adapter: {name}");
            }

            self.adapters.insert(
               name.clone(),
               AdapterInfo {
                  state: AdapterState::Active,
                  monitor_handle: Some(Self::start_adapter_monitor(
                     self.loopback_tx.clone(),
                     name,
                     adapter.clone(),
                  )),
                  adapter,
                  retry_count: 0,
               },
            );
         },
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
         },
      }
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            if let Err(e) = loopback
               .send(ManagerCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await
            {
               warn!("Channel overflow sending adapter error: {e}");
            }
            return;
         };

         while let Some(event) = events.next().await {
            // Connection changes are picked up by the health check
            if let AdapterEvent::DeviceRemoved(addr) = event {
               debug!("Device removed on {name}: {addr}");
               let _ = loopback.send(ManagerCommand::DeviceLost(addr)).await;
            }
         }

         // If we exit the event loop, adapter is probably gone
         if let Err(e) = loopback.send(ManagerCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   // === Command Handling ===

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         ManagerCommand::DeviceLost(addr) => {
            if let Some(cid) = self.addresses.get(&addr).copied() {
               self.handle_link_lost(cid);
            }
            // Handles of a removed device are not trusted on its return
            if let Some(cache) = &self.cache
               && let Err(e) = cache.remove(addr)
            {
               warn!("Failed to drop cached handles of {addr}: {e}");
            }
         },
         ManagerCommand::AutoGroupSettled { name, ok } => {
            self.handle_auto_group_settled(&name, ok);
         },
         ManagerCommand::InitGroup {
            task,
            addresses,
            set_size,
            reply,
         } => {
            self.init_group(task, &addresses, set_size, reply).await;
         },
         ManagerCommand::AddDevice {
            group,
            task,
            address,
            reply,
         } => {
            self.add_device(group, task, address, reply).await;
         },
         ManagerCommand::RemoveDevice {
            group,
            address,
            reply,
         } => {
            let result = match self.addresses.get(&address) {
               Some(cid) => self.orchestrator.remove_device(group, *cid),
               None => Err(Failure::InvalidDevice),
            };
            self.prune_addresses();
            let _ = reply.send(result);
         },
         ManagerCommand::RegisterTask { group, task, reply } => {
            let _ = reply.send(self.orchestrator.register_task(group, task));
         },
         ManagerCommand::DeregisterTask { group, task, reply } => {
            let _ = reply.send(self.orchestrator.deregister_task(group, &task));
         },
         ManagerCommand::DestroyGroup { group, reply } => {
            let result = self.orchestrator.destroy(group);
            self.prune_addresses();
            let _ = reply.send(result);
         },
         ManagerCommand::Submit {
            group,
            task,
            request,
            reply,
         } => {
            self.orchestrator.submit(group, task, request, reply);
         },
         ManagerCommand::GetGroups(reply) => {
            let _ = reply.send(self.orchestrator.summaries());
         },
      }
   }

   fn handle_gatt_event(&mut self, event: GattEvent) {
      match event {
         GattEvent::Completed(ticket, outcome) => {
            self.orchestrator.on_completion(ticket, outcome);
         },
         GattEvent::Notified(cid, notification) => {
            self.orchestrator.on_notification(cid, notification);
         },
         GattEvent::SourceFound(report) => {
            // One report per scanning group
            let mut seen = Vec::new();
            let scanners: Vec<Cid> = self.orchestrator.subclients().scanners().collect();
            for cid in scanners {
               let Some(group) = self.orchestrator.group_of(cid) else {
                  continue;
               };
               if seen.contains(&group) {
                  continue;
               }
               seen.push(group);
               self
                  .orchestrator
                  .on_notification(cid, SubNotification::SourceFound(report.clone()));
            }
         },
      }
   }

   // === Connections ===

   /// Finds the connected device at `address` on an active adapter.
   async fn find_connected(&self, address: Address) -> Option<(Device, Adapter)> {
      for info in self.adapters.values() {
         if info.state != AdapterState::Active {
            continue;
         }
         if let Ok(device) = info.adapter.device(address)
            && device.is_connected().await.unwrap_or(false)
         {
            return Some((device, info.adapter.clone()));
         }
      }
      None
   }

   /// Attaches `address` to the GATT clients and describes it for the
   /// orchestrator, including any cached handles.
   async fn connection(&mut self, address: Address) -> Option<ConnectionSpec> {
      let cid = match self.addresses.get(&address).copied() {
         Some(cid) if self.orchestrator.subclients().contains(cid) => cid,
         _ => {
            let (device, adapter) = self.find_connected(address).await?;
            let cid = self.allocate_cid();
            self.orchestrator.subclients_mut().attach(cid, device, adapter);
            self.addresses.insert(address, cid);
            debug!("Attached {address} as {cid}");
            cid
         },
      };

      let cached = self.cache.as_ref().and_then(|cache| match cache.get(address) {
         Ok(handles) => handles,
         Err(e) => {
            warn!("Failed to read cached handles for {address}: {e}");
            None
         },
      });
      Some(ConnectionSpec {
         cid,
         address: SmolStr::from(address.to_string()),
         cached,
      })
   }

   fn allocate_cid(&mut self) -> Cid {
      loop {
         let cid = Cid(self.next_cid);
         self.next_cid = self.next_cid.wrapping_add(1).max(1);
         if !self.addresses.values().any(|c| *c == cid) {
            return cid;
         }
      }
   }

   /// Releases connections no group took and forgets released addresses.
   fn release_unowned(&mut self, cids: &[Cid]) {
      for cid in cids {
         if self.orchestrator.group_of(*cid).is_none() {
            self.orchestrator.subclients_mut().release(*cid);
         }
      }
      self.prune_addresses();
   }

   fn prune_addresses(&mut self) {
      let clients = self.orchestrator.subclients();
      self.addresses.retain(|_, cid| clients.contains(*cid));
   }

   async fn init_group(
      &mut self,
      task: AppTask,
      addresses: &[Address],
      set_size: u8,
      reply: oneshot::Sender<Confirmation>,
   ) -> Option<GroupId> {
      let mut devices = Vec::with_capacity(addresses.len());
      for address in addresses {
         let Some(spec) = self.connection(*address).await else {
            warn!("Cannot group {address}: not connected");
            let cids: Vec<Cid> = devices.iter().map(|d: &ConnectionSpec| d.cid).collect();
            self.release_unowned(&cids);
            let _ = reply.send(Confirmation::bare(OpKind::Init, None, Err(Failure::InvalidDevice)));
            return None;
         };
         devices.push(spec);
      }

      let cids: Vec<Cid> = devices.iter().map(|d| d.cid).collect();
      let id = self
         .orchestrator
         .init(task, GroupSpec { devices, set_size }, reply);
      self.release_unowned(&cids);
      id
   }

   async fn add_device(
      &mut self,
      group: GroupId,
      task: AppTask,
      address: Address,
      reply: oneshot::Sender<Confirmation>,
   ) {
      let Some(spec) = self.connection(address).await else {
         warn!("Cannot add {address} to {group}: not connected");
         let _ = reply.send(Confirmation::bare(
            OpKind::AddDevice,
            Some(group),
            Err(Failure::InvalidDevice),
         ));
         return;
      };
      let cid = spec.cid;
      self.orchestrator.add_device(group, task, spec, reply);
      self.release_unowned(&[cid]);
   }

   fn handle_link_lost(&mut self, cid: Cid) {
      match self.orchestrator.group_of(cid) {
         Some(group) => {
            self.orchestrator.on_link_lost(cid);
            // Members of known sets rejoin on reconnect under a fresh id
            let rejoins = self
               .addresses
               .iter()
               .find(|(_, c)| **c == cid)
               .and_then(|(address, _)| self.config.known_set_of(&address.to_string()))
               .and_then(|set| self.auto_groups.get(set.name.as_str()))
               .is_some_and(|auto| auto.id == Some(group));
            if rejoins {
               let _ = self.orchestrator.remove_device(group, cid);
            }
         },
         None => self.orchestrator.subclients_mut().release(cid),
      }
      self.prune_addresses();
   }

   // === Known Sets ===

   async fn form_known_sets(&mut self) {
      let sets = self.config.known_sets.clone();
      for set in &sets {
         self.form_known_set(set).await;
      }
   }

   async fn form_known_set(&mut self, set: &KnownSet) {
      let name = SmolStr::from(set.name.as_str());
      let auto = self.auto_groups.entry(name.clone()).or_insert(AutoGroup {
         id: None,
         retry_count: 0,
         retry_at: None,
      });
      if auto.retry_at.is_some_and(|at| Instant::now() < at) {
         return;
      }
      let live = auto.id.filter(|id| self.orchestrator.group(*id).is_some());

      let mut members = Vec::with_capacity(set.members.len());
      for member in &set.members {
         let Ok(address) = member.parse::<Address>() else {
            warn!("Known set {name}: invalid member address {member}");
            return;
         };
         members.push(address);
      }

      match live {
         Some(id) => {
            // Bring reconnected members back into the group
            for address in members {
               if self.addresses.contains_key(&address) {
                  continue;
               }
               if self.find_connected(address).await.is_none() {
                  continue;
               }
               info!("Known set {name}: re-adding {address}");
               let (tx, rx) = oneshot::channel();
               self.add_device(id, AppTask::new(AUTO_TASK), address, tx).await;
               self.watch_auto_group(name.clone(), rx);
            }
         },
         None => {
            for address in &members {
               let Some((device, _)) = self.find_connected(*address).await else {
                  return;
               };
               if !recognition::is_le_audio_device(&device).await {
                  return;
               }
            }
            info!("Known set {name}: all {} members connected, grouping", members.len());
            let (tx, rx) = oneshot::channel();
            let set_size = u8::try_from(members.len()).unwrap_or(u8::MAX);
            let id = self
               .init_group(AppTask::new(AUTO_TASK), &members, set_size, tx)
               .await;
            if let Some(auto) = self.auto_groups.get_mut(&name) {
               auto.id = id;
            }
            self.watch_auto_group(name, rx);
         },
      }
   }

   fn watch_auto_group(&self, name: SmolStr, rx: oneshot::Receiver<Confirmation>) {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let ok = match rx.await {
            Ok(confirmation) => {
               match confirmation.result {
                  Ok(()) => info!("Known set {name}: {} done", confirmation.op),
                  Err(failure) => warn!("Known set {name}: {} failed: {failure}", confirmation.op),
               }
               confirmation.is_success()
            },
            Err(_) => false,
         };
         let _ = loopback
            .send(ManagerCommand::AutoGroupSettled { name, ok })
            .await;
      });
   }

   fn handle_auto_group_settled(&mut self, name: &SmolStr, ok: bool) {
      let Some(auto) = self.auto_groups.get_mut(name) else {
         return;
      };
      if ok {
         auto.retry_count = 0;
         auto.retry_at = None;
      } else {
         auto.retry_count += 1;
         let delay = calc_retry_delay(auto.retry_count);
         info!("Known set {name}: retrying in {delay:?}");
         auto.retry_at = Some(Instant::now() + delay);
      }
   }

   // === Adapter Events ===

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.adapter = adapter;
         info.state = AdapterState::Active;
         info.retry_count = 0; // Reset retry count on success

         // Restart monitor if needed
         if info.monitor_handle.is_none() {
            info.monitor_handle = Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name,
               info.adapter.clone(),
            ));
         }
      } else {
         self.initialize_adapter(name).await;
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;

      // Abort the monitor handle
      if let Some(handle) = info.monitor_handle.take() {
         handle.abort();
      }

      // Schedule adapter recovery with exponential backoff
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(info.retry_count);
      let adapter_name = name.clone();

      tokio::spawn(async move {
         time::sleep(delay).await;

         match session.adapter(&adapter_name) {
            Ok(adapter) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterAvailable(adapter_name, adapter))
                  .await;
            },
            Err(e) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterError(
                     adapter_name,
                     format!("Recovery failed: {e}"),
                  ))
                  .await;
            },
         }
      });

      // Every connection on this adapter is gone
      let lost: Vec<Cid> = self
         .orchestrator
         .subclients()
         .links()
         .filter(|(_, link)| link.adapter().name() == name.as_str())
         .map(|(cid, _)| cid)
         .collect();
      for cid in lost {
         self.handle_link_lost(cid);
      }
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.state = AdapterState::Failed(error);
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   async fn check_connection_health(&mut self) {
      let links: Vec<_> = self
         .orchestrator
         .subclients()
         .links()
         .map(|(cid, link)| (cid, link.clone()))
         .collect();

      for (cid, link) in links {
         if !link.device().is_connected().await.unwrap_or(false) {
            info!("{cid} ({}) is no longer connected", link.address());
            self.handle_link_lost(cid);
         }
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up CAP manager");

      // Abort adapter monitors with timeout
      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            // Give it a moment to finish
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      // Tear down every group; pending requests are confirmed as cancelled
      let groups: Vec<GroupId> = self
         .orchestrator
         .summaries()
         .iter()
         .map(|summary| GroupId::from_raw(summary.id))
         .collect();
      for group in groups {
         let _ = self.orchestrator.destroy(group);
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_retry_delay_grows_and_caps() {
      let first = calc_retry_delay(0);
      assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(3));
      let fourth = calc_retry_delay(3);
      assert!(fourth >= Duration::from_secs(16) && fourth < Duration::from_secs(17));
      // Exponent stops growing after four retries
      let capped = calc_retry_delay(30);
      assert!(capped >= Duration::from_secs(32) && capped < Duration::from_secs(33));
   }
}
