//! GATT-backed sub-client adapters.
//!
//! [`GattClients`] owns one [`Link`] per attached connection and runs every
//! sub-request as its own task; outcomes come back to the manager through the
//! [`GattEvent`] channel. While any connection has a remote scan running, a
//! local discovery session looks for broadcast sources on its behalf.

use std::{
   collections::{BTreeSet, HashMap, HashSet},
   sync::Arc,
};

use bluer::{Adapter, AdapterEvent, AddressType, Device};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   bluetooth::{
      gatt::{GattEvent, Link, Timing},
      recognition,
   },
   cap::{
      status::Failure,
      subclient::{BassRequest, DeviceHandles, SubClients, SubRequest, Ticket},
      types::Cid,
   },
};

pub struct GattClients {
   links: HashMap<Cid, Arc<Link>>,
   events: mpsc::Sender<GattEvent>,
   timing: Timing,
   /// Connections whose remote scan is running.
   scanning: BTreeSet<Cid>,
   scanner: Option<JoinHandle<()>>,
}

impl GattClients {
   pub fn new(events: mpsc::Sender<GattEvent>, timing: Timing) -> Self {
      Self {
         links: HashMap::new(),
         events,
         timing,
         scanning: BTreeSet::new(),
         scanner: None,
      }
   }

   /// Makes `device` reachable under `cid`.
   pub fn attach(&mut self, cid: Cid, device: Device, adapter: Adapter) -> Arc<Link> {
      let link = Arc::new(Link::new(cid, device, adapter, self.timing));
      if let Some(old) = self.links.insert(cid, link.clone()) {
         old.close();
      }
      link
   }

   pub fn contains(&self, cid: Cid) -> bool {
      self.links.contains_key(&cid)
   }

   pub fn links(&self) -> impl Iterator<Item = (Cid, &Arc<Link>)> {
      self.links.iter().map(|(cid, link)| (*cid, link))
   }

   /// Connections a found broadcast source is reported to.
   pub fn scanners(&self) -> impl Iterator<Item = Cid> + '_ {
      self.scanning.iter().copied()
   }

   fn start_scan(&mut self, cid: Cid) {
      self.scanning.insert(cid);
      if self.scanner.as_ref().is_some_and(|h| !h.is_finished()) {
         return;
      }
      let Some(link) = self.links.get(&cid) else {
         return;
      };
      info!("Scanning for broadcast sources on behalf of {cid}");
      self.scanner = Some(Self::spawn_scanner(
         link.adapter().clone(),
         self.events.clone(),
      ));
   }

   fn stop_scan(&mut self, cid: Cid) {
      if !self.scanning.remove(&cid) || !self.scanning.is_empty() {
         return;
      }
      if let Some(scanner) = self.scanner.take() {
         info!("Broadcast source scan stopped");
         scanner.abort();
      }
   }

   fn spawn_scanner(adapter: Adapter, events: mpsc::Sender<GattEvent>) -> JoinHandle<()> {
      tokio::spawn(async move {
         let discovery = match adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(e) => {
               warn!("Failed to start discovery on {}: {e}", adapter.name());
               return;
            },
         };
         let mut discovery = Box::pin(discovery);
         let mut reported = HashSet::new();

         while let Some(event) = discovery.next().await {
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            if reported.contains(&addr) {
               continue;
            }
            let Ok(device) = adapter.device(addr) else {
               continue;
            };
            let Ok(Some(service_data)) = device.service_data().await else {
               continue;
            };
            let random = matches!(device.address_type().await, Ok(AddressType::LeRandom));
            let name = device.name().await.ok().flatten();
            let Some(report) = recognition::broadcast_source(addr, random, &service_data, name)
            else {
               continue;
            };
            debug!("Broadcast source {addr}: id {:#08x}", report.source.broadcast_id);
            reported.insert(addr);
            if events.send(GattEvent::SourceFound(report)).await.is_err() {
               return;
            }
         }
      })
   }
}

impl SubClients for GattClients {
   fn issue(&mut self, ticket: Ticket, request: SubRequest) {
      let events = self.events.clone();
      let Some(link) = self.links.get(&ticket.cid).cloned() else {
         debug!("No link for {}; failing {} request", ticket.cid, ticket.service);
         tokio::spawn(async move {
            let _ = events
               .send(GattEvent::Completed(ticket, Err(Failure::Disconnected)))
               .await;
         });
         return;
      };
      match &request {
         SubRequest::Bass(BassRequest::RemoteScanStarted) => self.start_scan(ticket.cid),
         SubRequest::Bass(BassRequest::RemoteScanStopped) => self.stop_scan(ticket.cid),
         _ => {},
      }
      tokio::spawn(async move {
         let outcome = link.perform(request, events.clone()).await;
         let _ = events.send(GattEvent::Completed(ticket, outcome)).await;
      });
   }

   fn restore(&mut self, cid: Cid, handles: &DeviceHandles) {
      if let Some(link) = self.links.get(&cid) {
         link.restore(handles);
      }
   }

   fn release(&mut self, cid: Cid) {
      self.stop_scan(cid);
      if let Some(link) = self.links.remove(&cid) {
         debug!("Released {cid} ({})", link.address());
         link.close();
      }
   }
}

impl Drop for GattClients {
   fn drop(&mut self) {
      if let Some(scanner) = self.scanner.take() {
         scanner.abort();
      }
      for link in self.links.values() {
         link.close();
      }
   }
}
