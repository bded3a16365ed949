//! Client-side Bluetooth control plane.
//!
//! A [`Session`] attaches to the transport daemon and owns the device
//! [`Registry`], discovery and pairing agents and the
//! [`AccessoryManager`]. All listener callbacks of one session run serially
//! on its event queue.

pub mod accessory;
pub mod address;
mod bits;
pub mod config;
pub mod dbus;
pub mod discovery;
pub mod error;
pub mod event;
pub mod pairing;
pub mod registry;
pub mod services;
pub mod session;
pub mod transport;

pub use crate::{
   accessory::{AccessoryEvent, AccessoryManager, AccessoryState},
   address::Address,
   config::Config,
   discovery::{DiscoveryAgent, DiscoveryEvent, DiscoveryMode},
   error::{Error, ErrorKind, Result},
   event::{EventSink, Sink, Subscription},
   pairing::{PairingAgent, PairingEvent, PairingResult},
   registry::{DeviceHandle, Registry},
   services::ServiceMask,
   session::{Session, SessionEvent, SessionState},
};

#[cfg(test)]
pub(crate) mod testing {
   use std::{sync::Arc, time::Duration};

   use tokio::{
      sync::mpsc::{self, UnboundedReceiver},
      time,
   };

   use crate::{
      config::Config,
      event::Sink,
      session::{Session, SessionEvent, Shared, SessionState},
      transport::{MemoryTransport, Transport, TransportEvent},
   };

   /// Short timeouts, no persistence.
   pub fn config() -> Config {
      Config {
         attach_retry_delay_ms: 20,
         attach_retry_count: 10,
         tick_interval_ms: 10,
         scan_window_ms: 60_000,
         periodic_scan_interval_sec: 60,
         query_timeout_ms: 200,
         pairing_user_timeout_sec: 2,
         pairing_dhkey_timeout_sec: 1,
         pairing_overall_timeout_sec: 3,
         max_pairing_attempts: 2,
         accessory_command_timeout_ms: 200,
         accessory_connect_timeout_ms: 500,
         persist_devices: false,
         ..Config::default()
      }
   }

   /// Attached state over an opened memory transport, without an actor.
   pub fn shared() -> (
      Arc<Shared>,
      Arc<MemoryTransport>,
      UnboundedReceiver<TransportEvent>,
   ) {
      let transport = MemoryTransport::new();
      let (tx, rx) = mpsc::unbounded_channel();
      transport.open("test", tx).unwrap();
      let shared = Arc::new(Shared::new("test", config(), transport.clone()));
      shared.state.store(SessionState::Attached);
      (shared, transport, rx)
   }

   /// Attaches a session and waits for `Attached`.
   pub async fn attach_memory(
      name: &str,
   ) -> (
      Session,
      Arc<MemoryTransport>,
      UnboundedReceiver<SessionEvent>,
   ) {
      let transport = MemoryTransport::new();
      let (sink, mut rx) = collector();
      let session = Session::attach(name, config(), transport.clone(), sink).unwrap();
      assert_eq!(recv(&mut rx).await, SessionEvent::Attached(Ok(())));
      (session, transport, rx)
   }

   pub fn collector<E: Send + 'static>() -> (Sink<E>, UnboundedReceiver<E>) {
      let (tx, rx) = mpsc::unbounded_channel();
      let sink: Sink<E> = Arc::new(move |event: E| {
         let _ = tx.send(event);
      });
      (sink, rx)
   }

   pub async fn recv<E>(rx: &mut UnboundedReceiver<E>) -> E {
      time::timeout(Duration::from_secs(5), rx.recv())
         .await
         .expect("timed out waiting for event")
         .expect("event channel closed")
   }

   /// Lets queued transport events and listener callbacks drain.
   pub async fn settle() {
      time::sleep(Duration::from_millis(50)).await;
   }
}
