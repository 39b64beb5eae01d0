//! LE Audio Common Audio Profile client daemon
//!
//! This service exposes coordinated LE Audio groups over D-Bus: it forms
//! groups of connected devices, runs unicast and broadcast-assistant
//! procedures across every member, and reports remote changes as signals.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::CapManager;
use dbus::CapService;
use event::{CapEvent, EventBus};

mod bluetooth;
mod cap;
mod config;
mod dbus;
mod error;
mod event;
mod handle_cache;

use crate::{
   cap::arena::GroupId, dbus::CapServiceSignals, error::Result, handle_cache::HandleCache,
};

const OBJECT_PATH: &str = "/org/capd/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting capd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known sets",
      config.known_sets.len()
   );

   let cache = if config.cache_handles {
      match HandleCache::open() {
         Ok(cache) => Some(cache),
         Err(e) => {
            warn!("Handle cache unavailable, discovering every time: {e}");
            None
         },
      }
   } else {
      None
   };

   // Create event channel
   let event_bus = EventProcessor::new(cache.clone());

   // Create CAP manager with event sender and config
   let manager = CapManager::new(event_bus.clone(), config, cache).await?;

   // Create D-Bus service
   let service = CapService::new(manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.capd")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("capd D-Bus service started at org.capd");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down capd...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(GroupId, CapEvent)>,
   notifier: Notify,
   cache: Option<HandleCache>,
}

impl EventProcessor {
   fn new(cache: Option<HandleCache>) -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         cache,
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(GroupId, CapEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<CapService>,
      (group, event): (GroupId, CapEvent),
   ) -> Result<()> {
      let group = group.to_raw();
      match event {
         CapEvent::StreamStateChanged {
            cid,
            ase_id,
            state,
            use_case,
         } => {
            iface
               .stream_state_changed(group, cid.0, ase_id, <&str>::from(state), &use_case.to_string())
               .await?;
         },
         CapEvent::VolumeChanged { cid, state } => {
            iface
               .volume_changed(group, cid.0, state.volume, state.mute)
               .await?;
         },
         CapEvent::MicStateChanged { cid, state } => {
            iface.mic_state_changed(group, cid.0, <&str>::from(state)).await?;
         },
         CapEvent::ReceiveStateChanged { cid, state } => {
            let state = serde_json::to_string(&state).unwrap_or_default();
            iface.receive_state_changed(group, cid.0, &state).await?;
         },
         CapEvent::ReceiveStateCleared { cid, source_id } => {
            iface.receive_state_cleared(group, cid.0, source_id).await?;
         },
         CapEvent::BroadcastCodeRequested { cid, source_id } => {
            iface
               .broadcast_code_requested(group, cid.0, source_id)
               .await?;
         },
         CapEvent::SourceFound { cid, report } => {
            let report = serde_json::to_string(&report).unwrap_or_default();
            iface.source_found(group, cid.0, &report).await?;
         },
         CapEvent::LockReleased { cid } => {
            iface.lock_released(group, cid.0).await?;
         },
         CapEvent::DeviceDisconnected { cid, address } => {
            iface.device_disconnected(group, cid.0, &address).await?;
         },
         CapEvent::HandlesDiscovered {
            cid,
            address,
            handles,
         } => {
            let Some(cache) = &self.cache else {
               return Ok(());
            };
            let Ok(addr) = address.parse::<Address>() else {
               warn!("Not caching handles of {cid}: bad address {address}");
               return Ok(());
            };
            cache.put(addr, &handles)?;
            debug!("Cached handles of {cid} ({address})");
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, CapService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, group: GroupId, event: CapEvent) {
      self.queue.push((group, event));
      self.notifier.notify_waiters();
   }
}
