//! Discovery agents.
//!
//! Each agent runs at most one scan at a time, either an inquiry scan
//! filtered by service interest or an advertised-key scan matched against
//! manufacturer data in the extended inquiry response. All agents of a
//! session share one transport inquiry whose filter is the union of the
//! open scan windows.

pub mod eir;

use std::{
   collections::BTreeSet,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
   time::Instant,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use self::eir::KeyHash;
use crate::{
   address::Address,
   error::{ErrorKind, Result},
   event::Sink,
   registry::{DeviceHandle, DeviceInfo, Registry, copy_into},
   services::{DeviceAttributes, ServiceMask},
   session::Shared,
   transport::InquiryResult,
};

/// Most keys one advertised-key scan matches against.
pub const MAX_KEYS: usize = 16;

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
   /// One window, then the scan stops.
   OneShot,
   /// Back-to-back windows until stopped.
   Continuous,
   /// A window every periodic interval.
   Periodic,
   /// Like `Periodic`, but windows only open while the network is associated.
   PeriodicWhileNetworkAssociated,
   /// One window reporting paired devices only.
   InRangeCheck,
}

/// Why a scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
   Requested,
   Exhausted,
   Failed,
   Terminated,
}

/// Error type for discovery operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
   #[error("Discovery in progress")]
   InProgress,

   #[error("Discovery not in progress")]
   NotInProgress,

   #[error("Discovery failed")]
   Failed,

   #[error("Discovery cancelled")]
   Cancelled,

   #[error("Device query in progress")]
   QueryInProgress,

   #[error("Device query cancelled")]
   QueryCancelled,

   #[error("Device query timed out")]
   QueryTimeout,

   #[error("Key table full ({MAX_KEYS} keys)")]
   QueueFull,

   #[error("Operation requires an advertised-key scan")]
   UnknownScan,
}

impl DiscoveryError {
   pub const fn kind(&self) -> ErrorKind {
      match self {
         Self::InProgress
         | Self::NotInProgress
         | Self::Cancelled
         | Self::QueryInProgress
         | Self::QueryCancelled => ErrorKind::State,
         Self::QueryTimeout => ErrorKind::Timeout,
         Self::Failed | Self::QueueFull => ErrorKind::Resource,
         Self::UnknownScan => ErrorKind::Argument,
      }
   }

   pub const fn code(&self) -> i32 {
      match self {
         Self::InProgress => 400,
         Self::NotInProgress => 401,
         Self::Failed => 402,
         Self::Cancelled => 403,
         Self::QueryInProgress => 405,
         Self::QueryCancelled => 406,
         Self::QueryTimeout => 407,
         Self::QueueFull => 411,
         Self::UnknownScan => 412,
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
   ScanStarted {
      mode: DiscoveryMode,
   },
   ScanStopped {
      reason: StopReason,
   },
   QueryStarted(DeviceHandle),
   QueryStopped {
      device: DeviceHandle,
      result: std::result::Result<DeviceAttributes, DiscoveryError>,
   },
   DeviceFound {
      device: DeviceHandle,
      attributes: DeviceAttributes,
   },
   DeviceLost(DeviceHandle),
   DeviceChanged {
      device: DeviceHandle,
      changed: DeviceAttributes,
   },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
   Inquiry(ServiceMask),
   Keys,
}

impl Strategy {
   /// Inquiry filter this strategy needs; empty means every device.
   const fn filter(self) -> ServiceMask {
      match self {
         Self::Inquiry(filter) => filter,
         Self::Keys => ServiceMask::empty(),
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
   Open(Instant),
   /// Waiting for the deadline, or for network association when `None`.
   Idle(Option<Instant>),
}

struct Scan {
   mode: DiscoveryMode,
   strategy: Strategy,
   window: Window,
   seen: BTreeSet<DeviceHandle>,
}

impl Scan {
   const fn is_open(&self) -> bool {
      matches!(self.window, Window::Open(_))
   }
}

struct Query {
   device: DeviceHandle,
   address: Address,
   deadline: Instant,
}

#[derive(Default)]
struct AgentState {
   scan: Option<Scan>,
   found: BTreeSet<DeviceHandle>,
   query: Option<Query>,
   keys: heapless::Vec<KeyHash, MAX_KEYS>,
}

struct AgentCore {
   sink: Sink<DiscoveryEvent>,
   state: Mutex<AgentState>,
}

/// Attributes known for a device reported found for the first time.
fn known_attributes(info: &DeviceInfo) -> DeviceAttributes {
   let mut attrs = DeviceAttributes::DEVICE_TYPE | DeviceAttributes::DEFAULT_NAME;
   if info.name.is_some() || info.user_name.is_some() {
      attrs |= DeviceAttributes::NAME;
   }
   if !info.supported.is_empty() {
      attrs |= DeviceAttributes::CAPABILITIES | DeviceAttributes::ROLES;
   }
   attrs
}

/// Session-wide state shared by all discovery agents.
pub(crate) struct DiscoveryHub {
   shared: Arc<Shared>,
   registry: Arc<Registry>,
   agents: Mutex<Vec<Weak<AgentCore>>>,
   /// Filter of the running transport inquiry.
   inquiry: Mutex<Option<ServiceMask>>,
   network: AtomicBool,
}

impl DiscoveryHub {
   pub(crate) fn new(shared: Arc<Shared>, registry: Arc<Registry>) -> Self {
      Self {
         shared,
         registry,
         agents: Mutex::new(Vec::new()),
         inquiry: Mutex::new(None),
         network: AtomicBool::new(false),
      }
   }

   fn agents(&self) -> Vec<Arc<AgentCore>> {
      let mut agents = self.agents.lock();
      agents.retain(|a| a.strong_count() > 0);
      agents.iter().filter_map(Weak::upgrade).collect()
   }

   fn post(&self, core: &AgentCore, event: DiscoveryEvent) {
      self.shared.queue.post(&core.sink, event);
   }

   fn network_associated(&self) -> bool {
      self.network.load(Ordering::Relaxed)
   }

   fn open_window(&self, mode: DiscoveryMode, now: Instant) -> Window {
      if mode == DiscoveryMode::PeriodicWhileNetworkAssociated && !self.network_associated() {
         Window::Idle(None)
      } else {
         Window::Open(now + self.shared.config.scan_window())
      }
   }

   /// Brings the transport inquiry in line with the open windows.
   fn refresh(&self) -> Result<()> {
      let mut wanted: Option<ServiceMask> = None;
      for core in self.agents() {
         let state = core.state.lock();
         let Some(scan) = state.scan.as_ref().filter(|s| s.is_open()) else {
            continue;
         };
         let filter = scan.strategy.filter();
         wanted = Some(match wanted {
            None => filter,
            Some(w) if w.is_empty() || filter.is_empty() => ServiceMask::empty(),
            Some(w) => w | filter,
         });
      }

      let mut current = self.inquiry.lock();
      if *current == wanted {
         return Ok(());
      }
      match wanted {
         Some(filter) => {
            debug!("Inquiry filter: {filter}");
            self.shared.transport.start_inquiry(filter)?;
         },
         None => {
            debug!("Inquiry stopped");
            self.shared.transport.stop_inquiry()?;
         },
      }
      *current = wanted;
      Ok(())
   }

   fn refresh_logged(&self) {
      if let Err(e) = self.refresh() {
         warn!("Failed to update inquiry: {e}");
      }
   }

   /// Ends the open window of `state`'s scan.
   fn close_window(&self, core: &AgentCore, state: &mut AgentState, now: Instant) {
      let AgentState { scan: slot, found, .. } = state;
      let Some(mode) = slot.as_ref().map(|s| s.mode) else {
         return;
      };
      match mode {
         DiscoveryMode::OneShot | DiscoveryMode::InRangeCheck => {
            info!("{mode} scan exhausted");
            *slot = None;
            self.post(core, DiscoveryEvent::ScanStopped {
               reason: StopReason::Exhausted,
            });
         },
         mode => {
            let Some(scan) = slot.as_mut() else {
               return;
            };
            let lost: Vec<_> = found.difference(&scan.seen).copied().collect();
            for device in lost {
               found.remove(&device);
               self.post(core, DiscoveryEvent::DeviceLost(device));
            }
            scan.seen.clear();
            scan.window = match mode {
               DiscoveryMode::Continuous => Window::Open(now + self.shared.config.scan_window()),
               _ => Window::Idle(Some(now + self.shared.config.periodic_scan_interval())),
            };
         },
      }
   }

   pub(crate) fn on_inquiry_result(&self, result: &InquiryResult) {
      let (device, changed) = self.registry.observe_inquiry(result);
      let Some(info) = self.registry.snapshot(device) else {
         return;
      };
      let hashes: Vec<&[u8]> = eir::advertised_hashes(&result.eir).collect();

      for core in self.agents() {
         let mut state = core.state.lock();
         let AgentState {
            scan, found, keys, ..
         } = &mut *state;
         let Some(scan) = scan.as_mut().filter(|s| s.is_open()) else {
            continue;
         };
         let matched = match scan.strategy {
            Strategy::Inquiry(filter) => {
               info.supported.matches_filter(filter)
                  && (scan.mode != DiscoveryMode::InRangeCheck || info.paired)
            },
            Strategy::Keys => hashes.iter().any(|h| keys.iter().any(|k| k[..] == **h)),
         };
         if !matched {
            continue;
         }
         scan.seen.insert(device);
         if found.insert(device) {
            debug!("{}: found {device}", info.address);
            self.post(&core, DiscoveryEvent::DeviceFound {
               device,
               attributes: known_attributes(&info),
            });
         } else if !changed.is_empty() {
            self.post(&core, DiscoveryEvent::DeviceChanged { device, changed });
         }
      }
   }

   pub(crate) fn on_inquiry_lost(&self, address: Address) {
      let Some(device) = self.registry.lookup_address(address) else {
         return;
      };
      for core in self.agents() {
         let mut state = core.state.lock();
         // A stopped scan keeps its results and reports nothing further.
         let Some(scan) = state.scan.as_mut() else {
            continue;
         };
         scan.seen.remove(&device);
         if state.found.remove(&device) {
            debug!("{address}: lost {device}");
            self.post(&core, DiscoveryEvent::DeviceLost(device));
         }
      }
   }

   pub(crate) fn on_window_complete(&self, now: Instant) {
      for core in self.agents() {
         let mut state = core.state.lock();
         if state.scan.as_ref().is_some_and(Scan::is_open) {
            self.close_window(&core, &mut state, now);
         }
      }
      self.refresh_logged();
   }

   pub(crate) fn on_network_association(&self, associated: bool, now: Instant) {
      info!("Network association: {associated}");
      self.network.store(associated, Ordering::Relaxed);
      if !associated {
         return;
      }
      for core in self.agents() {
         let mut state = core.state.lock();
         if let Some(scan) = state.scan.as_mut()
            && scan.window == Window::Idle(None)
         {
            scan.window = Window::Open(now + self.shared.config.scan_window());
         }
      }
      self.refresh_logged();
   }

   pub(crate) fn on_query_complete(
      &self,
      address: Address,
      name: Option<&SmolStr>,
      services: ServiceMask,
      success: bool,
   ) {
      let Some(device) = self.registry.lookup_address(address) else {
         return;
      };
      let changed = if success {
         Ok(self.registry.apply_query(device, name, services))
      } else {
         Err(DiscoveryError::Failed)
      };
      for core in self.agents() {
         let mut state = core.state.lock();
         if state.query.as_ref().is_none_or(|q| q.address != address) {
            continue;
         }
         state.query = None;
         self.post(&core, DiscoveryEvent::QueryStopped {
            device,
            result: changed.clone(),
         });
         if let Ok(changed) = changed
            && !changed.is_empty()
            && state.scan.is_some()
            && state.found.contains(&device)
         {
            self.post(&core, DiscoveryEvent::DeviceChanged { device, changed });
         }
      }
   }

   pub(crate) fn tick(&self, now: Instant) {
      let mut windows_moved = false;
      for core in self.agents() {
         let mut state = core.state.lock();
         if let Some(query) = state.query.take_if(|q| q.deadline <= now) {
            warn!("{}: device query timed out", query.address);
            self.post(&core, DiscoveryEvent::QueryStopped {
               device: query.device,
               result: Err(DiscoveryError::QueryTimeout),
            });
         }
         let Some((mode, window)) = state.scan.as_ref().map(|s| (s.mode, s.window)) else {
            continue;
         };
         match window {
            Window::Open(until) if until <= now => {
               self.close_window(&core, &mut state, now);
               windows_moved = true;
            },
            Window::Idle(Some(until)) if until <= now => {
               let next = self.open_window(mode, now);
               if let Some(scan) = state.scan.as_mut() {
                  scan.window = next;
               }
               windows_moved = true;
            },
            _ => {},
         }
      }
      if windows_moved {
         self.refresh_logged();
      }
   }

   /// Ends every scan and query after the transport went away.
   pub(crate) fn shutdown(&self) {
      for core in self.agents() {
         let mut state = core.state.lock();
         if state.scan.take().is_some() {
            self.post(&core, DiscoveryEvent::ScanStopped {
               reason: StopReason::Terminated,
            });
         }
         if let Some(query) = state.query.take() {
            self.post(&core, DiscoveryEvent::QueryStopped {
               device: query.device,
               result: Err(DiscoveryError::QueryCancelled),
            });
         }
      }
      *self.inquiry.lock() = None;
   }
}

/// Discovery agent. Dropping it ends its scan.
pub struct DiscoveryAgent {
   hub: Arc<DiscoveryHub>,
   core: Arc<AgentCore>,
}

impl DiscoveryAgent {
   pub(crate) fn new(hub: Arc<DiscoveryHub>, sink: Sink<DiscoveryEvent>) -> Self {
      let core = Arc::new(AgentCore {
         sink,
         state: Mutex::new(AgentState::default()),
      });
      hub.agents.lock().push(Arc::downgrade(&core));
      Self { hub, core }
   }

   /// Starts an inquiry scan reporting devices that support any service in `filter`.
   pub fn start_scan(&self, mode: DiscoveryMode, filter: ServiceMask) -> Result<()> {
      self.start(mode, Strategy::Inquiry(filter))
   }

   /// Starts a continuous scan matching advertised key digests.
   ///
   /// Only peers that send extended inquiry response data can match.
   pub fn start_advertised_scan(&self) -> Result<()> {
      self.start(DiscoveryMode::Continuous, Strategy::Keys)
   }

   fn start(&self, mode: DiscoveryMode, strategy: Strategy) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      {
         let mut state = self.core.state.lock();
         if state.scan.is_some() {
            return Err(DiscoveryError::InProgress.into());
         }
         state.scan = Some(Scan {
            mode,
            strategy,
            window: self.hub.open_window(mode, Instant::now()),
            seen: BTreeSet::new(),
         });
         state.found.clear();
         info!("{mode} scan started ({})", strategy.filter());
         self.hub.post(&self.core, DiscoveryEvent::ScanStarted { mode });
      }
      if let Err(e) = self.hub.refresh() {
         let mut state = self.core.state.lock();
         state.scan = None;
         self.hub.post(&self.core, DiscoveryEvent::ScanStopped {
            reason: StopReason::Failed,
         });
         return Err(e);
      }
      Ok(())
   }

   pub fn stop_scan(&self) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      {
         let mut state = self.core.state.lock();
         if state.scan.take().is_none() {
            return Err(DiscoveryError::NotInProgress.into());
         }
         state.keys.clear();
         info!("Scan stopped");
         self.hub.post(&self.core, DiscoveryEvent::ScanStopped {
            reason: StopReason::Requested,
         });
      }
      self.hub.refresh()
   }

   pub fn is_scanning(&self) -> bool {
      self.core.state.lock().scan.is_some()
   }

   pub fn mode(&self) -> Option<DiscoveryMode> {
      self.core.state.lock().scan.as_ref().map(|s| s.mode)
   }

   fn with_keys<T>(&self, f: impl FnOnce(&mut heapless::Vec<KeyHash, MAX_KEYS>) -> Result<T>) -> Result<T> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      if !state.scan.as_ref().is_some_and(|s| s.strategy == Strategy::Keys) {
         return Err(DiscoveryError::UnknownScan.into());
      }
      f(&mut state.keys)
   }

   /// Adds a key blob to match. Valid only during an advertised-key scan.
   pub fn add_key(&self, key: &[u8]) -> Result<()> {
      let hash = eir::key_hash(key);
      self.with_keys(|keys| {
         if keys.contains(&hash) {
            return Ok(());
         }
         keys
            .push(hash)
            .map_err(|_| DiscoveryError::QueueFull.into())
      })
   }

   /// Returns whether the key was present.
   pub fn remove_key(&self, key: &[u8]) -> Result<bool> {
      let hash = eir::key_hash(key);
      self.with_keys(|keys| {
         let Some(pos) = keys.iter().position(|k| *k == hash) else {
            return Ok(false);
         };
         keys.swap_remove(pos);
         Ok(true)
      })
   }

   /// Queries name and services of `device`, independent of any scan.
   pub fn query_device(&self, device: DeviceHandle) -> Result<()> {
      let address = self.hub.registry.address(device)?;
      let mut state = self.core.state.lock();
      if state.query.is_some() {
         return Err(DiscoveryError::QueryInProgress.into());
      }
      self.hub.shared.transport.query(address)?;
      state.query = Some(Query {
         device,
         address,
         deadline: Instant::now() + self.hub.shared.config.query_timeout(),
      });
      self.hub.post(&self.core, DiscoveryEvent::QueryStarted(device));
      Ok(())
   }

   pub fn cancel_query(&self) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      let query = state.query.take().ok_or(DiscoveryError::NotInProgress)?;
      self.hub.post(&self.core, DiscoveryEvent::QueryStopped {
         device: query.device,
         result: Err(DiscoveryError::QueryCancelled),
      });
      Ok(())
   }

   /// Devices found by the most recent scan and not lost since.
   pub fn devices(&self) -> Result<Vec<DeviceHandle>> {
      self.hub.shared.ensure_attached()?;
      Ok(self.core.state.lock().found.iter().copied().collect())
   }

   pub fn devices_into(&self, out: &mut [DeviceHandle]) -> Result<usize> {
      copy_into(&self.devices()?, out)
   }
}

impl Drop for DiscoveryAgent {
   fn drop(&mut self) {
      let was_scanning = self.core.state.lock().scan.take().is_some();
      self
         .hub
         .agents
         .lock()
         .retain(|a| !std::ptr::eq(a.as_ptr(), Arc::as_ptr(&self.core)));
      if was_scanning && self.hub.shared.ensure_attached().is_ok() {
         self.hub.refresh_logged();
      }
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc::UnboundedReceiver;

   use super::*;
   use crate::{
      error::Error,
      testing,
      transport::{Request, TransportEvent},
   };

   const SPEAKER: Address = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const MOUSE: Address = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);

   fn inquiry(address: Address, services: ServiceMask) -> TransportEvent {
      TransportEvent::InquiryResult(InquiryResult {
         address,
         services,
         ..Default::default()
      })
   }

   async fn next_device_event(rx: &mut UnboundedReceiver<DiscoveryEvent>) -> DiscoveryEvent {
      loop {
         match testing::recv(rx).await {
            DiscoveryEvent::ScanStarted { .. } | DiscoveryEvent::QueryStarted(_) => continue,
            event => return event,
         }
      }
   }

   #[tokio::test]
   async fn test_continuous_scan_found_then_lost() {
      let (session, transport, _events) = testing::attach_memory("disc-found").await;
      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      agent
         .start_scan(DiscoveryMode::Continuous, ServiceMask::A2DP)
         .unwrap();
      assert!(
         transport
            .requests()
            .contains(&Request::StartInquiry(ServiceMask::A2DP))
      );

      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP | ServiceMask::HANDSFREE));
      let DiscoveryEvent::DeviceFound { device, attributes } = next_device_event(&mut rx).await else {
         panic!("expected found");
      };
      assert!(attributes.contains(DeviceAttributes::ROLES));
      assert_eq!(agent.devices().unwrap(), vec![device]);

      transport.inject(TransportEvent::InquiryLost(SPEAKER));
      assert_eq!(next_device_event(&mut rx).await, DiscoveryEvent::DeviceLost(device));
      assert!(agent.devices().unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_second_start_rejected() {
      let (session, transport, _events) = testing::attach_memory("disc-busy").await;
      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      agent.start_scan(DiscoveryMode::Continuous, ServiceMask::empty()).unwrap();
      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP));
      let DiscoveryEvent::DeviceFound { device, .. } = next_device_event(&mut rx).await else {
         panic!("expected found");
      };

      let err = agent.start_scan(DiscoveryMode::OneShot, ServiceMask::HID).unwrap_err();
      assert!(matches!(err, Error::Discovery(DiscoveryError::InProgress)));
      assert_eq!(agent.mode(), Some(DiscoveryMode::Continuous));
      assert_eq!(agent.devices().unwrap(), vec![device]);

      agent.stop_scan().unwrap();
      assert_eq!(
         next_device_event(&mut rx).await,
         DiscoveryEvent::ScanStopped {
            reason: StopReason::Requested
         }
      );
      assert!(matches!(
         agent.stop_scan(),
         Err(Error::Discovery(DiscoveryError::NotInProgress))
      ));
      assert_eq!(transport.requests().last(), Some(&Request::StopInquiry));
   }

   #[tokio::test]
   async fn test_stopped_agent_hears_nothing_more() {
      let (session, transport, _events) = testing::attach_memory("disc-stopped").await;
      let (sink_a, mut rx_a) = testing::collector();
      let (sink_b, mut rx_b) = testing::collector();
      let a = session.create_discovery_agent(sink_a);
      let b = session.create_discovery_agent(sink_b);
      a.start_scan(DiscoveryMode::Continuous, ServiceMask::empty()).unwrap();
      b.start_scan(DiscoveryMode::Continuous, ServiceMask::empty()).unwrap();

      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP));
      let DiscoveryEvent::DeviceFound { device, .. } = next_device_event(&mut rx_a).await else {
         panic!("expected found on the first agent");
      };
      assert!(matches!(
         next_device_event(&mut rx_b).await,
         DiscoveryEvent::DeviceFound { .. }
      ));

      a.stop_scan().unwrap();
      assert_eq!(
         next_device_event(&mut rx_a).await,
         DiscoveryEvent::ScanStopped {
            reason: StopReason::Requested
         }
      );

      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP | ServiceMask::HANDSFREE));
      transport.inject(TransportEvent::InquiryLost(SPEAKER));
      assert_eq!(next_device_event(&mut rx_b).await, DiscoveryEvent::DeviceChanged {
         device,
         changed: DeviceAttributes::CAPABILITIES | DeviceAttributes::ROLES,
      });
      assert_eq!(next_device_event(&mut rx_b).await, DiscoveryEvent::DeviceLost(device));
      testing::settle().await;
      assert!(rx_a.try_recv().is_err());
      assert_eq!(a.devices().unwrap(), vec![device]);
   }

   #[tokio::test]
   async fn test_lost_requires_found() {
      let (session, transport, _events) = testing::attach_memory("disc-lost").await;
      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      agent.start_scan(DiscoveryMode::Continuous, ServiceMask::A2DP).unwrap();

      // Known to the registry but filtered out of this agent.
      transport.inject(inquiry(MOUSE, ServiceMask::HID));
      transport.inject(TransportEvent::InquiryLost(MOUSE));
      transport.inject(TransportEvent::InquiryLost(SPEAKER));
      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP));
      let DiscoveryEvent::DeviceFound { device, .. } = next_device_event(&mut rx).await else {
         panic!("expected found for the speaker first");
      };
      assert_eq!(session.registry().address(device).unwrap(), SPEAKER);
      testing::settle().await;
      assert!(rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_windows_expire_devices() {
      let (session, transport, _events) = testing::attach_memory("disc-window").await;
      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      agent.start_scan(DiscoveryMode::Continuous, ServiceMask::empty()).unwrap();
      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP));
      let DiscoveryEvent::DeviceFound { device, .. } = next_device_event(&mut rx).await else {
         panic!("expected found");
      };
      // Seen in the first window, absent from the second.
      transport.inject(TransportEvent::InquiryWindowComplete);
      transport.inject(TransportEvent::InquiryWindowComplete);
      assert_eq!(next_device_event(&mut rx).await, DiscoveryEvent::DeviceLost(device));

      let (sink, mut once_rx) = testing::collector();
      let once = session.create_discovery_agent(sink);
      agent.stop_scan().unwrap();
      once.start_scan(DiscoveryMode::OneShot, ServiceMask::empty()).unwrap();
      transport.inject(TransportEvent::InquiryWindowComplete);
      assert_eq!(
         next_device_event(&mut once_rx).await,
         DiscoveryEvent::ScanStopped {
            reason: StopReason::Exhausted
         }
      );
      assert!(!once.is_scanning());
   }

   #[tokio::test]
   async fn test_in_range_check_reports_paired_only() {
      let (session, transport, _events) = testing::attach_memory("disc-range").await;
      let registry = session.registry();
      let key = registry.generate_key(SPEAKER).unwrap();
      registry
         .set_key(SPEAKER, "Speaker", 0, ServiceMask::A2DP, key)
         .unwrap();
      let paired = registry.handle_for_address(SPEAKER).unwrap();
      registry.store_pairing(paired, None, Default::default()).unwrap();

      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      agent.start_scan(DiscoveryMode::InRangeCheck, ServiceMask::empty()).unwrap();
      transport.inject(inquiry(MOUSE, ServiceMask::HID));
      transport.inject(inquiry(SPEAKER, ServiceMask::A2DP));
      assert_eq!(
         next_device_event(&mut rx).await,
         DiscoveryEvent::DeviceFound {
            device: paired,
            attributes: DeviceAttributes::DEVICE_TYPE
               | DeviceAttributes::DEFAULT_NAME
               | DeviceAttributes::NAME
               | DeviceAttributes::CAPABILITIES
               | DeviceAttributes::ROLES,
         }
      );
   }

   #[tokio::test]
   async fn test_advertised_key_matching() {
      let (session, transport, _events) = testing::attach_memory("disc-keys").await;
      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      assert!(matches!(
         agent.add_key(b"alpha"),
         Err(Error::Discovery(DiscoveryError::UnknownScan))
      ));
      agent.start_advertised_scan().unwrap();
      agent.add_key(b"alpha").unwrap();

      let advertising = |address, key: &[u8]| {
         TransportEvent::InquiryResult(InquiryResult {
            address,
            eir: eir::encode_advertisement(0x004C, &[key]),
            ..Default::default()
         })
      };
      transport.inject(advertising(MOUSE, b"beta"));
      transport.inject(advertising(SPEAKER, b"alpha"));
      let DiscoveryEvent::DeviceFound { device, .. } = next_device_event(&mut rx).await else {
         panic!("expected found");
      };
      assert_eq!(session.registry().address(device).unwrap(), SPEAKER);

      assert!(agent.remove_key(b"alpha").unwrap());
      assert!(!agent.remove_key(b"alpha").unwrap());
      for n in 0..MAX_KEYS {
         agent.add_key(&[n as u8]).unwrap();
      }
      assert!(matches!(
         agent.add_key(b"one too many"),
         Err(Error::Discovery(DiscoveryError::QueueFull))
      ));
   }

   #[tokio::test]
   async fn test_device_query() {
      let (session, transport, _events) = testing::attach_memory("disc-query").await;
      transport.respond(true);
      transport.add_peer(InquiryResult {
         address: SPEAKER,
         name: Some("Kitchen".into()),
         services: ServiceMask::A2DP,
         ..Default::default()
      });
      let (sink, mut rx) = testing::collector();
      let agent = session.create_discovery_agent(sink);
      let device = session.registry().ensure_device(SPEAKER);
      agent.query_device(device).unwrap();
      assert_eq!(
         next_device_event(&mut rx).await,
         DiscoveryEvent::QueryStopped {
            device,
            result: Ok(DeviceAttributes::NAME
               | DeviceAttributes::CAPABILITIES
               | DeviceAttributes::ROLES),
         }
      );
      assert_eq!(session.registry().name(device).unwrap(), "Kitchen");

      transport.respond(false);
      agent.query_device(device).unwrap();
      assert!(matches!(
         agent.query_device(device),
         Err(Error::Discovery(DiscoveryError::QueryInProgress))
      ));
      assert_eq!(
         next_device_event(&mut rx).await,
         DiscoveryEvent::QueryStopped {
            device,
            result: Err(DiscoveryError::QueryTimeout),
         }
      );
   }
}
