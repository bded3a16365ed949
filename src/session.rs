//! Session lifecycle.
//!
//! A session is one client's attachment to the transport daemon. It owns the
//! registry, the discovery and pairing hubs and the accessory manager, and
//! runs an actor that feeds transport events into them in arrival order.

use std::{
   collections::HashSet,
   sync::{Arc, LazyLock},
   time::{Duration, Instant},
};

use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::{
   select,
   sync::mpsc,
   time::{self, MissedTickBehavior},
};

use crate::{
   accessory::AccessoryManager,
   config::Config,
   discovery::{DiscoveryAgent, DiscoveryEvent, DiscoveryHub, eir},
   error::{Error, ErrorKind, Result},
   event::{EventQueue, Sink},
   pairing::{PairingAgent, PairingEvent, PairingHub},
   registry::{Registry, store::DeviceStore},
   transport::{Transport, TransportEvent},
};

/// Maximum attach retry delay
const MAX_ATTACH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Client names with a live session in this process.
static LIVE_SESSIONS: LazyLock<Mutex<HashSet<SmolStr>>> =
   LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
   /// Waiting for the daemon.
   Attaching,
   Attached,
   Detached,
   /// The daemon went away underneath the session.
   Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
   Attached(std::result::Result<(), SessionError>),
   Detached,
   Terminated,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
   #[error("Transport daemon not reachable after {attempts} attempts")]
   AttachFailed { attempts: u32 },

   #[error("A session named {0:?} is already attached")]
   AlreadyAttached(SmolStr),

   #[error("Session not attached yet")]
   NotAttached,

   #[error("Session is {0}")]
   Invalidated(SessionState),
}

impl SessionError {
   pub const fn kind(&self) -> ErrorKind {
      match self {
         Self::AttachFailed { .. } => ErrorKind::Resource,
         Self::AlreadyAttached(_) | Self::NotAttached => ErrorKind::State,
         Self::Invalidated(_) => ErrorKind::Argument,
      }
   }

   pub const fn code(&self) -> i32 {
      match self {
         Self::AttachFailed { .. } => 100,
         Self::AlreadyAttached(_) => 15,
         Self::NotAttached => 12,
         Self::Invalidated(_) => 7,
      }
   }
}

/// State every component of one session reads.
pub(crate) struct Shared {
   pub name: SmolStr,
   pub state: AtomicCell<SessionState>,
   pub queue: Arc<EventQueue>,
   pub transport: Arc<dyn Transport>,
   pub config: Config,
}

impl Shared {
   pub fn new(name: &str, config: Config, transport: Arc<dyn Transport>) -> Self {
      Self {
         name: SmolStr::new(name),
         state: AtomicCell::new(SessionState::Attaching),
         queue: EventQueue::new(),
         transport,
         config,
      }
   }

   pub fn ensure_attached(&self) -> Result<()> {
      match self.state.load() {
         SessionState::Attached => Ok(()),
         SessionState::Attaching => Err(SessionError::NotAttached.into()),
         state => Err(SessionError::Invalidated(state).into()),
      }
   }
}

enum Command {
   Detach,
}

/// Handle to an attached (or attaching) session.
///
/// Dropping the handle detaches the session.
pub struct Session {
   shared: Arc<Shared>,
   registry: Arc<Registry>,
   discovery: Arc<DiscoveryHub>,
   pairing: Arc<PairingHub>,
   accessories: Arc<AccessoryManager>,
   inbox: mpsc::UnboundedSender<Command>,
}

impl Session {
   /// Starts attaching `name` to the daemon behind `transport`.
   ///
   /// Returns at once; the outcome is delivered to `sink` as
   /// `SessionEvent::Attached`. Must be called inside a tokio runtime.
   pub fn attach(
      name: &str,
      config: Config,
      transport: Arc<dyn Transport>,
      sink: Sink<SessionEvent>,
   ) -> Result<Self> {
      if name.is_empty() {
         return Err(Error::InvalidArgument("empty client name"));
      }
      let store = if config.persist_devices {
         Some(DeviceStore::open(&config.store_dir()?)?)
      } else {
         None
      };
      if !LIVE_SESSIONS.lock().insert(SmolStr::new(name)) {
         return Err(SessionError::AlreadyAttached(SmolStr::new(name)).into());
      }

      let shared = Arc::new(Shared::new(name, config, transport));
      let registry = Arc::new(Registry::new(shared.clone(), store));
      let discovery = Arc::new(DiscoveryHub::new(shared.clone(), registry.clone()));
      let pairing = Arc::new(PairingHub::new(shared.clone(), registry.clone()));
      let accessories = Arc::new(AccessoryManager::new(shared.clone(), registry.clone()));

      shared.queue.spawn_dispatcher();
      let (inbox, commands) = mpsc::unbounded_channel();
      let actor = SessionActor {
         shared: shared.clone(),
         registry: registry.clone(),
         discovery: discovery.clone(),
         pairing: pairing.clone(),
         accessories: accessories.clone(),
         sink,
         commands,
      };
      tokio::spawn(actor.run());
      info!("Session {name:?} attaching");

      Ok(Self {
         shared,
         registry,
         discovery,
         pairing,
         accessories,
         inbox,
      })
   }

   pub fn name(&self) -> &str {
      &self.shared.name
   }

   pub fn state(&self) -> SessionState {
      self.shared.state.load()
   }

   pub fn config(&self) -> &Config {
      &self.shared.config
   }

   /// Tears the session down; `Detached` follows on the event queue.
   pub fn detach(&self) -> Result<()> {
      let state = self.shared.state.load();
      if matches!(state, SessionState::Detached | SessionState::Terminated) {
         return Err(SessionError::Invalidated(state).into());
      }
      self.shared.state.store(SessionState::Detached);
      let _ = self.inbox.send(Command::Detach);
      Ok(())
   }

   pub fn registry(&self) -> Arc<Registry> {
      self.registry.clone()
   }

   /// The session's accessory manager. There is exactly one per session.
   pub fn accessory_manager(&self) -> Arc<AccessoryManager> {
      self.accessories.clone()
   }

   pub fn create_discovery_agent(&self, sink: Sink<DiscoveryEvent>) -> DiscoveryAgent {
      DiscoveryAgent::new(self.discovery.clone(), sink)
   }

   pub fn create_pairing_agent(&self, sink: Sink<PairingEvent>) -> PairingAgent {
      PairingAgent::new(self.pairing.clone(), sink)
   }
}

impl Drop for Session {
   fn drop(&mut self) {
      if !matches!(
         self.shared.state.load(),
         SessionState::Detached | SessionState::Terminated
      ) {
         self.shared.state.store(SessionState::Detached);
      }
      let _ = self.inbox.send(Command::Detach);
   }
}

struct SessionActor {
   shared: Arc<Shared>,
   registry: Arc<Registry>,
   discovery: Arc<DiscoveryHub>,
   pairing: Arc<PairingHub>,
   accessories: Arc<AccessoryManager>,
   sink: Sink<SessionEvent>,
   commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionActor {
   async fn run(mut self) {
      let (events_tx, mut events) = mpsc::unbounded_channel();
      if !self.open(events_tx).await {
         return;
      }

      let mut tick_interval = time::interval(self.shared.config.tick_interval());
      tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = tick_interval.tick() => {
               self.tick(Instant::now());
            }
            event = events.recv() => {
               match event {
                  Some(TransportEvent::Terminated) | None => {
                     self.terminate();
                     return;
                  },
                  Some(event) => self.handle_event(event),
               }
            }
            cmd = self.commands.recv() => {
               match cmd {
                  Some(Command::Detach) | None => {
                     self.detach();
                     return;
                  },
               }
            }
         }
      }
   }

   /// Opens the transport, retrying while the daemon is not up.
   async fn open(&mut self, events_tx: mpsc::UnboundedSender<TransportEvent>) -> bool {
      let name = self.shared.name.clone();
      let attempts = self.shared.config.attach_retry_count + 1;
      for retry in 0..attempts {
         if self.shared.state.load() != SessionState::Attaching {
            self.finish(SessionEvent::Detached);
            return false;
         }
         match self.shared.transport.open(&name, events_tx.clone()) {
            Ok(()) => {
               if let Err(e) = self.registry.load() {
                  warn!("Session {name:?}: failed to load stored devices: {e}");
               }
               // A detach may have raced the open.
               if self
                  .shared
                  .state
                  .compare_exchange(SessionState::Attaching, SessionState::Attached)
                  .is_err()
               {
                  self.shared.transport.close();
                  self.finish(SessionEvent::Detached);
                  return false;
               }
               info!("Session {name:?} attached");
               self.shared.queue.post(&self.sink, SessionEvent::Attached(Ok(())));
               return true;
            },
            Err(e) => {
               let delay = calc_retry_delay(self.shared.config.attach_retry_delay(), retry);
               debug!("Session {name:?}: attach attempt {} failed: {e}", retry + 1);
               if retry + 1 == attempts {
                  break;
               }
               select! {
                  _ = time::sleep(delay) => {},
                  cmd = self.commands.recv() => {
                     if matches!(cmd, Some(Command::Detach) | None) {
                        self.shared.state.store(SessionState::Detached);
                        self.finish(SessionEvent::Detached);
                        return false;
                     }
                  }
               }
            },
         }
      }

      error!("Session {name:?}: daemon not reachable, giving up");
      self.shared.state.store(SessionState::Detached);
      self.finish(SessionEvent::Attached(Err(SessionError::AttachFailed { attempts })));
      false
   }

   /// Posts the final event and releases the client name.
   fn finish(&self, event: SessionEvent) {
      self.shared.queue.post(&self.sink, event);
      self.shared.queue.close();
      LIVE_SESSIONS.lock().remove(&self.shared.name);
   }

   fn teardown(&self) {
      self.discovery.shutdown();
      self.pairing.shutdown();
      self.accessories.shutdown();
      self.registry.reset_connections();
   }

   fn detach(&self) {
      self.shared.state.store(SessionState::Detached);
      self.shared.transport.close();
      self.teardown();
      info!("Session {:?} detached", self.shared.name);
      self.finish(SessionEvent::Detached);
   }

   fn terminate(&self) {
      self.shared.state.store(SessionState::Terminated);
      self.teardown();
      warn!("Session {:?} terminated by the daemon", self.shared.name);
      self.finish(SessionEvent::Terminated);
   }

   fn tick(&self, now: Instant) {
      self.discovery.tick(now);
      self.pairing.tick(now);
      self.accessories.tick(now);
   }

   fn handle_event(&self, event: TransportEvent) {
      let now = Instant::now();
      match event {
         TransportEvent::Terminated => {},
         TransportEvent::NetworkAssociation(associated) => {
            self.discovery.on_network_association(associated, now);
         },
         TransportEvent::InquiryResult(result) => {
            self.discovery.on_inquiry_result(&result);
            if let Some(device) = self.registry.lookup_address(result.address) {
               let manufacturer = eir::manufacturer_data(&result.eir).map(|(_, data)| data);
               self.accessories.evaluate(device, manufacturer);
            }
         },
         TransportEvent::InquiryLost(address) => self.discovery.on_inquiry_lost(address),
         TransportEvent::InquiryWindowComplete => self.discovery.on_window_complete(now),
         TransportEvent::QueryComplete {
            address,
            name,
            services,
            success,
         } => {
            self
               .discovery
               .on_query_complete(address, name.as_ref(), services, success);
            if success && let Some(device) = self.registry.lookup_address(address) {
               self.accessories.evaluate(device, None);
            }
         },
         TransportEvent::ServicesConnected { address, services } => {
            let (device, accepted) = self.registry.apply_connected(address, services);
            if !accepted.is_empty() {
               self.accessories.on_services_connected(device, accepted);
            }
         },
         TransportEvent::ServicesDisconnected { address, services } => {
            if let Some((device, _)) = self.registry.apply_disconnected(address, services) {
               self.accessories.on_services_disconnected(device, services);
            }
         },
         TransportEvent::PairingRequested { address } => {
            self.pairing.on_pairing_requested(address);
         },
         TransportEvent::Pairing { address, request } => {
            self.pairing.on_pairing(address, request);
         },
         TransportEvent::PairingComplete { address, status } => {
            if let Some((device, true)) = self.pairing.on_pairing_complete(address, status) {
               self.accessories.evaluate(device, None);
            }
         },
         TransportEvent::LocalOobData(data) => self.pairing.on_local_oob(data),
         TransportEvent::Frame { address, data } => self.accessories.on_frame(address, &data),
         TransportEvent::SendFailed { address, timed_out } => {
            self.accessories.on_send_failed(address, timed_out);
         },
      }
   }
}

/// Exponential backoff from `base` with up to one `base` of jitter.
fn calc_retry_delay(base: Duration, retry_count: u32) -> Duration {
   let exponential = base * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_ATTACH_RETRY_DELAY);
   let jitter_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1);
   let jitter = rand::thread_rng().gen_range(0..jitter_ms);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      registry::DeviceHandle,
      services::ServiceMask,
      testing,
      transport::{MemoryTransport, Request},
   };

   #[test]
   fn test_retry_delay_grows_and_caps() {
      let base = Duration::from_millis(100);
      let first = calc_retry_delay(base, 0);
      assert!(first >= base && first < base * 2);
      let fourth = calc_retry_delay(base, 4);
      assert!(fourth >= base * 16 && fourth < base * 17);
      assert!(calc_retry_delay(base, 30) < base * 17);
      assert!(calc_retry_delay(Duration::from_secs(10), 4) <= MAX_ATTACH_RETRY_DELAY + Duration::from_secs(10));
   }

   #[tokio::test]
   async fn test_attach_waits_for_daemon() {
      let transport = MemoryTransport::new();
      transport.set_available(false);
      let (sink, mut rx) = testing::collector();
      let session = Session::attach("session-wait", testing::config(), transport.clone(), sink).unwrap();
      assert_eq!(session.state(), SessionState::Attaching);
      assert!(matches!(
         session.registry().devices(),
         Err(Error::Session(SessionError::NotAttached))
      ));

      time::sleep(Duration::from_millis(50)).await;
      transport.set_available(true);
      assert_eq!(testing::recv(&mut rx).await, SessionEvent::Attached(Ok(())));
      assert_eq!(session.state(), SessionState::Attached);
      assert_eq!(session.name(), "session-wait");
      assert!(transport.requests().contains(&Request::Open("session-wait".into())));
   }

   #[tokio::test]
   async fn test_attach_gives_up() {
      let transport = MemoryTransport::new();
      transport.set_available(false);
      let config = Config {
         attach_retry_count: 1,
         ..testing::config()
      };
      let (sink, mut rx) = testing::collector();
      let session = Session::attach("session-give-up", config, transport, sink).unwrap();
      assert_eq!(
         testing::recv(&mut rx).await,
         SessionEvent::Attached(Err(SessionError::AttachFailed { attempts: 2 }))
      );
      assert_eq!(session.state(), SessionState::Detached);
   }

   #[tokio::test]
   async fn test_one_session_per_name() {
      let (session, _transport, mut rx) = testing::attach_memory("session-unique").await;
      let (sink, _other) = testing::collector();
      let err = Session::attach("session-unique", testing::config(), MemoryTransport::new(), sink)
         .err()
         .unwrap();
      assert!(matches!(err, Error::Session(SessionError::AlreadyAttached(_))));

      session.detach().unwrap();
      assert_eq!(testing::recv(&mut rx).await, SessionEvent::Detached);
      let (sink, _again) = testing::collector();
      assert!(Session::attach("session-unique", testing::config(), MemoryTransport::new(), sink).is_ok());
   }

   #[tokio::test]
   async fn test_detach_invalidates_handle() {
      let (session, transport, mut rx) = testing::attach_memory("session-detach").await;
      let registry = session.registry();
      let (sink, mut pairing_rx) = testing::collector();
      let agent = session.create_pairing_agent(sink);
      agent.start().unwrap();

      session.detach().unwrap();
      assert_eq!(testing::recv(&mut rx).await, SessionEvent::Detached);
      assert!(!transport.is_open());
      assert!(matches!(
         registry.devices(),
         Err(Error::Session(SessionError::Invalidated(SessionState::Detached)))
      ));
      assert!(matches!(
         agent.pair(DeviceHandle::from_raw(1).unwrap()),
         Err(Error::Session(SessionError::Invalidated(_)))
      ));
      assert!(session.detach().is_err());

      // Nothing is delivered once the session is gone.
      while pairing_rx.try_recv().is_ok() {}
      transport.inject(TransportEvent::InquiryWindowComplete);
      testing::settle().await;
      assert!(pairing_rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_daemon_crash_terminates() {
      let (session, transport, mut rx) = testing::attach_memory("session-crash").await;
      let registry = session.registry();
      let device = registry
         .set_key(
            crate::address::Address::new([1, 2, 3, 4, 5, 6]),
            "Car",
            0,
            ServiceMask::HANDSFREE,
            crate::registry::LinkKey::generate(),
         )
         .unwrap();
      registry.connect_services(device, ServiceMask::HANDSFREE).unwrap();

      transport.crash();
      assert_eq!(testing::recv(&mut rx).await, SessionEvent::Terminated);
      assert_eq!(session.state(), SessionState::Terminated);
      assert!(matches!(
         registry.connected_services(device),
         Err(Error::Session(SessionError::Invalidated(SessionState::Terminated)))
      ));
      assert!(session.detach().is_err());
   }
}
