//! Bluetooth control plane D-Bus service
//!
//! Attaches a session to bluetoothd and exports its registry, discovery,
//! pairing and accessory operations on the session bus.

use std::{sync::Arc, time::Duration};

use btctl::{
   Config, Result, Session,
   dbus::{self, ControlService, Signal},
   event::{EventSink, Sink},
   transport::bluez::BluezTransport,
};
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btctld...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known accessories",
      config.known_accessories.len()
   );

   let signals = EventProcessor::new();
   let sink: Sink<Signal> = signals.clone();

   let transport = BluezTransport::new().await?;
   let session = Session::attach(
      "btctld",
      config,
      transport,
      dbus::forward(&sink, Signal::Session),
   )?;

   let service = ControlService::new(session, &sink);

   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("btctld started at {}", dbus::SERVICE_NAME);

   signals.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down btctld...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<Signal>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<Signal> {
      loop {
         if let Some(signal) = self.queue.pop() {
            return Some(signal);
         }
         let notify = self.notifier.notified();
         if let Some(signal) = self.queue.pop() {
            return Some(signal);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface: InterfaceRef<ControlService> = connection
         .object_server()
         .interface(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(signal) = self.recv().await {
            if let Err(e) = signal.emit(iface.signal_emitter()).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventSink<Signal> for EventProcessor {
   fn emit(&self, signal: Signal) {
      self.queue.push(signal);
      self.notifier.notify_waiters();
   }
}
