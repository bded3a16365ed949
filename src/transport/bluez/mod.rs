//! `BlueZ` transport backend.
//!
//! Requests are forwarded to an actor that owns the `bluer` session. The
//! daemon's view of devices is translated into `TransportEvent`s; pairing
//! prompts arrive through a registered agent and wait for the reply handed
//! to `Transport::reply`.

mod l2cap;

use std::{
   collections::{HashMap, HashSet},
   pin::pin,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, Device, ErrorKind as BluerErrorKind,
   agent::{Agent, AgentHandle, ReqError, ReqResult},
};
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::{JoinHandle, JoinSet},
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use self::l2cap::{L2CapReceiver, L2CapSender};
use super::{
   InquiryResult, Packet, PairingFailure, PairingParams, PairingReply, PairingRequest, Transport,
   TransportEvent, TransportEvents,
};
use crate::{
   address::Address,
   discovery::eir,
   error::{Error, ErrorKind, Result},
   registry::DeviceId,
   services::ServiceMask,
};

/// Interval to check that bluetoothd is still there
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Length of one reported inquiry window
const INQUIRY_WINDOW: Duration = Duration::from_millis(10_240);
/// How long an agent prompt waits for the client
const AGENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll interval while waiting for an incoming pairing to settle
const BOND_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Profile UUIDs connected for each service bit.
const PROFILES: &[(ServiceMask, u128)] = &[
   (ServiceMask::HANDSFREE, 0x0000111e_0000_1000_8000_00805f9b34fb),
   (ServiceMask::A2DP, 0x0000110b_0000_1000_8000_00805f9b34fb),
   (ServiceMask::REMOTE, 0x0000110e_0000_1000_8000_00805f9b34fb),
   (ServiceMask::HID, 0x00001124_0000_1000_8000_00805f9b34fb),
   (ServiceMask::NET_SHARING, 0x00001116_0000_1000_8000_00805f9b34fb),
   (ServiceMask::PHONEBOOK, 0x0000112f_0000_1000_8000_00805f9b34fb),
   (ServiceMask::MAP, 0x00001132_0000_1000_8000_00805f9b34fb),
];

#[derive(Debug)]
enum Command {
   Open,
   Close,
   StartInquiry,
   StopInquiry,
   Query(Address),
   Connect(Address, ServiceMask),
   Disconnect(Address, ServiceMask),
   Pair(Address, PairingParams),
   CancelPairing(Address),
   RemoveBond(Address),
   Send(Address, Packet),
}

enum Loopback {
   ChannelUp(Address, L2CapSender, L2CapReceiver),
   ChannelDown(Address),
}

/// State shared between the transport handle, the actor and the agent.
#[derive(Default)]
struct Bridge {
   events: Mutex<Option<TransportEvents>>,
   /// Agent prompts waiting for `Transport::reply`.
   prompts: Mutex<HashMap<Address, oneshot::Sender<PairingReply>>>,
   /// Pairings started by `Transport::pair`.
   outgoing: Mutex<HashSet<Address>>,
   /// Peer-initiated pairings the client accepted.
   incoming: Mutex<HashSet<Address>>,
}

impl Bridge {
   fn emit(&self, event: TransportEvent) {
      if let Some(tx) = self.events.lock().as_ref() {
         let _ = tx.send(event);
      }
   }

   async fn prompt(&self, address: Address, event: TransportEvent) -> ReqResult<PairingReply> {
      let (tx, rx) = oneshot::channel();
      if let Some(previous) = self.prompts.lock().insert(address, tx) {
         drop(previous);
         debug!("{address}: superseded an unanswered prompt");
      }
      self.emit(event);
      match time::timeout(AGENT_TIMEOUT, rx).await {
         Ok(Ok(reply)) => Ok(reply),
         Ok(Err(_)) => Err(ReqError::Canceled),
         Err(_) => {
            self.prompts.lock().remove(&address);
            warn!("{address}: pairing prompt not answered");
            Err(ReqError::Canceled)
         },
      }
   }

   /// Makes sure the client agreed to pair with a peer that started on its own.
   async fn admit(&self, address: Address) -> ReqResult<()> {
      if self.outgoing.lock().contains(&address) || self.incoming.lock().contains(&address) {
         return Ok(());
      }
      match self
         .prompt(address, TransportEvent::PairingRequested { address })
         .await?
      {
         PairingReply::Accept(params) => {
            debug!("{address}: incoming pairing accepted with {params:?}");
            self.incoming.lock().insert(address);
            Ok(())
         },
         _ => Err(ReqError::Rejected),
      }
   }

   async fn request(&self, address: Address, request: PairingRequest) -> ReqResult<PairingReply> {
      self.admit(address).await?;
      self
         .prompt(address, TransportEvent::Pairing { address, request })
         .await
   }
}

/// Transport backed by bluetoothd over D-Bus.
pub struct BluezTransport {
   inbox: mpsc::UnboundedSender<Command>,
   bridge: Arc<Bridge>,
   available: Arc<AtomicBool>,
}

impl BluezTransport {
   pub async fn new() -> Result<Arc<Self>> {
      let session = bluer::Session::new().await?;
      let bridge = Arc::new(Bridge::default());
      let available = Arc::new(AtomicBool::new(false));
      let (inbox, commands) = mpsc::unbounded_channel();
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      let actor = BluezActor {
         session,
         bridge: bridge.clone(),
         available: available.clone(),
         commands,
         loopback_tx,
         loopback_rx,
         adapter: None,
         agent: None,
         inquiry: None,
         channels: HashMap::new(),
         jset: JoinSet::new(),
      };
      actor.check_health().await;
      tokio::spawn(actor.run());
      Ok(Arc::new(Self {
         inbox,
         bridge,
         available,
      }))
   }

   fn submit(&self, command: Command) -> Result<()> {
      if self.bridge.events.lock().is_none() {
         return Err(Error::Transport(SmolStr::new_static("transport not open")));
      }
      self
         .inbox
         .send(command)
         .map_err(|_| Error::Transport(SmolStr::new_static("transport actor gone")))
   }
}

impl Transport for BluezTransport {
   fn open(&self, client: &str, events: TransportEvents) -> Result<()> {
      if !self.available.load(Ordering::Relaxed) {
         return Err(Error::NoServerFound);
      }
      info!("Opening BlueZ transport for {client:?}");
      *self.bridge.events.lock() = Some(events);
      self.submit(Command::Open)
   }

   fn close(&self) {
      let _ = self.inbox.send(Command::Close);
      self.bridge.events.lock().take();
      self.bridge.prompts.lock().clear();
   }

   fn start_inquiry(&self, filter: ServiceMask) -> Result<()> {
      debug!("Inquiry requested for {filter}");
      self.submit(Command::StartInquiry)
   }

   fn stop_inquiry(&self) -> Result<()> {
      self.submit(Command::StopInquiry)
   }

   fn query(&self, address: Address) -> Result<()> {
      self.submit(Command::Query(address))
   }

   fn connect(&self, address: Address, services: ServiceMask) -> Result<()> {
      self.submit(Command::Connect(address, services))
   }

   fn disconnect(&self, address: Address, services: ServiceMask) -> Result<()> {
      self.submit(Command::Disconnect(address, services))
   }

   fn pair(&self, address: Address, params: PairingParams) -> Result<()> {
      self.bridge.outgoing.lock().insert(address);
      self.submit(Command::Pair(address, params))
   }

   fn reply(&self, address: Address, reply: PairingReply) -> Result<()> {
      let Some(prompt) = self.bridge.prompts.lock().remove(&address) else {
         // Passkey displays are not answered through the agent.
         return match reply {
            PairingReply::Confirm(false) | PairingReply::Reject => {
               self.submit(Command::CancelPairing(address))
            },
            PairingReply::Confirm(true) => Ok(()),
            _ => Err(Error::Transport(SmolStr::new_static("no pairing prompt pending"))),
         };
      };
      prompt
         .send(reply)
         .map_err(|_| Error::Transport(SmolStr::new_static("pairing prompt expired")))
   }

   fn cancel_pairing(&self, address: Address) -> Result<()> {
      self.bridge.prompts.lock().remove(&address);
      self.submit(Command::CancelPairing(address))
   }

   fn remove_bond(&self, address: Address) -> Result<()> {
      self.submit(Command::RemoveBond(address))
   }

   fn read_local_oob(&self) -> Result<()> {
      Err(Error::NotSupported("local OOB data over BlueZ"))
   }

   fn send(&self, address: Address, data: &[u8]) -> Result<()> {
      self.submit(Command::Send(address, Packet::from_slice(data)))
   }
}

struct BluezActor {
   session: bluer::Session,
   bridge: Arc<Bridge>,
   available: Arc<AtomicBool>,
   commands: mpsc::UnboundedReceiver<Command>,
   loopback_tx: mpsc::UnboundedSender<Loopback>,
   loopback_rx: mpsc::UnboundedReceiver<Loopback>,
   adapter: Option<Adapter>,
   agent: Option<AgentHandle>,
   inquiry: Option<JoinHandle<()>>,
   channels: HashMap<Address, L2CapSender>,
   jset: JoinSet<()>,
}

impl BluezActor {
   async fn run(mut self) {
      let mut health_check_interval = time::interval(HEALTH_CHECK_INTERVAL);
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = health_check_interval.tick() => {
               self.check_health().await;
            }
            cmd = self.commands.recv() => {
               let Some(cmd) = cmd else {
                  info!("BlueZ transport shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            }
            Some(msg) = self.loopback_rx.recv() => {
               self.handle_loopback(msg);
            }
            Some(_) = self.jset.join_next(), if !self.jset.is_empty() => {}
         }
      }
      self.teardown();
   }

   async fn check_health(&self) {
      let up = matches!(self.session.adapter_names().await, Ok(names) if !names.is_empty());
      let was_up = self.available.swap(up, Ordering::Relaxed);
      if was_up && !up {
         error!("bluetoothd or its adapter went away");
         if let Some(tx) = self.bridge.events.lock().take() {
            let _ = tx.send(TransportEvent::Terminated);
         }
      } else if up && !was_up {
         info!("bluetoothd available");
      }
   }

   fn adapter(&self) -> Option<Adapter> {
      let adapter = self.adapter.clone();
      if adapter.is_none() {
         warn!("BlueZ request before the adapter was opened");
      }
      adapter
   }

   async fn handle_command(&mut self, cmd: Command) {
      match cmd {
         Command::Open => self.open().await,
         Command::Close => self.teardown(),
         Command::StartInquiry => self.start_inquiry(),
         Command::StopInquiry => {
            if let Some(handle) = self.inquiry.take() {
               handle.abort();
            }
         },
         Command::Query(address) => {
            let Some(adapter) = self.adapter() else { return };
            let bridge = self.bridge.clone();
            self.jset.spawn(async move {
               let event = match adapter.device(address.into()) {
                  Ok(device) => {
                     let result = inquiry_result(&device).await;
                     TransportEvent::QueryComplete {
                        address,
                        name: result.name,
                        services: result.services,
                        success: true,
                     }
                  },
                  Err(e) => {
                     warn!("{address}: query failed: {e}");
                     TransportEvent::QueryComplete {
                        address,
                        name: None,
                        services: ServiceMask::empty(),
                        success: false,
                     }
                  },
               };
               bridge.emit(event);
            });
         },
         Command::Connect(address, services) => self.connect(address, services),
         Command::Disconnect(address, services) => self.disconnect(address, services),
         Command::Pair(address, params) => self.pair(address, params),
         Command::CancelPairing(address) => {
            let Some(adapter) = self.adapter() else { return };
            self.jset.spawn(async move {
               if let Ok(device) = adapter.device(address.into())
                  && let Err(e) = device.cancel_pairing().await
               {
                  debug!("{address}: cancel pairing: {e}");
               }
            });
         },
         Command::RemoveBond(address) => {
            let Some(adapter) = self.adapter() else { return };
            self.jset.spawn(async move {
               if let Err(e) = adapter.remove_device(address.into()).await {
                  warn!("{address}: failed to remove bond: {e}");
               }
            });
         },
         Command::Send(address, data) => {
            let Some(sender) = self.channels.get(&address).cloned() else {
               self.bridge.emit(TransportEvent::SendFailed {
                  address,
                  timed_out: false,
               });
               return;
            };
            let bridge = self.bridge.clone();
            self.jset.spawn(async move {
               if let Err(e) = sender.send(&data).await {
                  let timed_out = e.kind() == ErrorKind::Timeout;
                  bridge.emit(TransportEvent::SendFailed { address, timed_out });
               }
            });
         },
      }
   }

   fn handle_loopback(&mut self, msg: Loopback) {
      match msg {
         Loopback::ChannelUp(address, sender, mut receiver) => {
            self.channels.insert(address, sender);
            self.bridge.emit(TransportEvent::ServicesConnected {
               address,
               services: ServiceMask::AACP,
            });
            let bridge = self.bridge.clone();
            let loopback = self.loopback_tx.clone();
            self.jset.spawn(async move {
               while let Some(data) = receiver.recv().await {
                  bridge.emit(TransportEvent::Frame { address, data });
               }
               let _ = loopback.send(Loopback::ChannelDown(address));
            });
         },
         Loopback::ChannelDown(address) => {
            if self.channels.remove(&address).is_some() {
               self.bridge.emit(TransportEvent::ServicesDisconnected {
                  address,
                  services: ServiceMask::AACP,
               });
            }
         },
      }
   }

   async fn open(&mut self) {
      let adapter = match self.session.default_adapter().await {
         Ok(adapter) => adapter,
         Err(e) => {
            error!("No Bluetooth adapter: {e}");
            self.bridge.emit(TransportEvent::Terminated);
            return;
         },
      };
      if let Ok(false) = adapter.is_powered().await
         && let Err(e) = adapter.set_powered(true).await
      {
         warn!("Failed to power on adapter {}: {e}", adapter.name());
      }
      match self.session.register_agent(agent(self.bridge.clone(), adapter.clone())).await {
         Ok(handle) => self.agent = Some(handle),
         Err(e) => warn!("Failed to register pairing agent: {e}"),
      }
      info!("BlueZ adapter {} opened", adapter.name());
      self.adapter = Some(adapter);
   }

   fn teardown(&mut self) {
      if let Some(handle) = self.inquiry.take() {
         handle.abort();
      }
      self.agent = None;
      self.adapter = None;
      self.channels.clear();
      self.jset.abort_all();
      self.bridge.outgoing.lock().clear();
      self.bridge.incoming.lock().clear();
   }

   fn start_inquiry(&mut self) {
      let Some(adapter) = self.adapter() else { return };
      if self.inquiry.as_ref().is_some_and(|h| !h.is_finished()) {
         return;
      }
      let bridge = self.bridge.clone();
      self.inquiry = Some(tokio::spawn(async move {
         let discoverer = match adapter.discover_devices().await {
            Ok(discoverer) => discoverer,
            Err(e) => {
               warn!("Failed to start discovery: {e}");
               bridge.emit(TransportEvent::InquiryWindowComplete);
               return;
            },
         };
         let mut discoverer = pin!(discoverer);
         let mut window = time::interval(INQUIRY_WINDOW);
         window.set_missed_tick_behavior(MissedTickBehavior::Skip);
         window.tick().await;
         info!("Inquiry running on {}", adapter.name());

         loop {
            select! {
               _ = window.tick() => bridge.emit(TransportEvent::InquiryWindowComplete),
               event = discoverer.next() => match event {
                  Some(AdapterEvent::DeviceAdded(addr)) => {
                     let Ok(device) = adapter.device(addr) else { continue };
                     bridge.emit(TransportEvent::InquiryResult(inquiry_result(&device).await));
                  },
                  Some(AdapterEvent::DeviceRemoved(addr)) => {
                     bridge.emit(TransportEvent::InquiryLost(addr.into()));
                  },
                  Some(_) => {},
                  None => break,
               },
            }
         }
         bridge.emit(TransportEvent::InquiryWindowComplete);
      }));
   }

   fn connect(&mut self, address: Address, services: ServiceMask) {
      let Some(adapter) = self.adapter() else { return };
      let profiles = services - ServiceMask::AACP;
      if !profiles.is_empty() {
         let bridge = self.bridge.clone();
         self.jset.spawn(async move {
            let Ok(device) = adapter.device(address.into()) else { return };
            let mut connected = ServiceMask::empty();
            for (bit, uuid) in PROFILES.iter().filter(|(bit, _)| profiles.contains(*bit)) {
               match device.connect_profile(&Uuid::from_u128(*uuid)).await {
                  Ok(()) => connected |= *bit,
                  Err(e) => warn!("{address}: failed to connect {bit}: {e}"),
               }
            }
            if !connected.is_empty() {
               bridge.emit(TransportEvent::ServicesConnected {
                  address,
                  services: connected,
               });
            }
         });
      }
      if services.contains(ServiceMask::AACP) && !self.channels.contains_key(&address) {
         let loopback = self.loopback_tx.clone();
         self.jset.spawn(async move {
            let mut jset = JoinSet::new();
            match l2cap::connect(&mut jset, address).await {
               Ok((receiver, sender)) => {
                  info!("{address}: control channel connected");
                  let _ = loopback.send(Loopback::ChannelUp(address, sender, receiver));
                  while jset.join_next().await.is_some() {}
               },
               Err(e) => {
                  warn!("{address}: control channel failed: {e}");
                  let _ = loopback.send(Loopback::ChannelDown(address));
               },
            }
         });
      }
   }

   fn disconnect(&mut self, address: Address, services: ServiceMask) {
      if services.contains(ServiceMask::AACP) && self.channels.remove(&address).is_some() {
         self.bridge.emit(TransportEvent::ServicesDisconnected {
            address,
            services: ServiceMask::AACP,
         });
      }
      let profiles = services - ServiceMask::AACP;
      if profiles.is_empty() {
         return;
      }
      let Some(adapter) = self.adapter() else { return };
      let bridge = self.bridge.clone();
      self.jset.spawn(async move {
         let Ok(device) = adapter.device(address.into()) else { return };
         for (bit, uuid) in PROFILES.iter().filter(|(bit, _)| profiles.contains(*bit)) {
            if let Err(e) = device.disconnect_profile(&Uuid::from_u128(*uuid)).await {
               debug!("{address}: disconnect {bit}: {e}");
            }
         }
         bridge.emit(TransportEvent::ServicesDisconnected {
            address,
            services: profiles,
         });
      });
   }

   fn pair(&mut self, address: Address, params: PairingParams) {
      let Some(adapter) = self.adapter() else { return };
      if params.oob.is_some() {
         warn!("{address}: out-of-band data is not passed to BlueZ");
      }
      debug!("{address}: pairing with {}", params.io_capability);
      let bridge = self.bridge.clone();
      self.jset.spawn(async move {
         let status = match adapter.device(address.into()) {
            Ok(device) => device.pair().await.map(|()| None).map_err(pairing_failure),
            Err(e) => Err(pairing_failure(e)),
         };
         bridge.outgoing.lock().remove(&address);
         bridge.emit(TransportEvent::PairingComplete { address, status });
      });
   }
}

fn pairing_failure(e: bluer::Error) -> PairingFailure {
   match e.kind {
      BluerErrorKind::AuthenticationCanceled => PairingFailure::Cancelled,
      BluerErrorKind::AuthenticationRejected => PairingFailure::UserDenied,
      BluerErrorKind::AuthenticationTimeout => PairingFailure::Timeout,
      _ => PairingFailure::AuthenticationFailure,
   }
}

/// Snapshot of the daemon's view of `device`, with EIR rebuilt from its properties.
async fn inquiry_result(device: &Device) -> InquiryResult {
   let name = device.name().await.ok().flatten().map(SmolStr::from);
   let uuids = device.uuids().await.ok().flatten().unwrap_or_default();
   let mut eir = Vec::new();
   if let Some(name) = &name {
      let bytes = &name.as_bytes()[..name.len().min(240)];
      eir.push(bytes.len() as u8 + 1);
      eir.push(eir::TYPE_COMPLETE_NAME);
      eir.extend_from_slice(bytes);
   }
   for (company, data) in device.manufacturer_data().await.ok().flatten().unwrap_or_default() {
      let data = &data[..data.len().min(240)];
      eir.push(data.len() as u8 + 3);
      eir.push(eir::TYPE_MANUFACTURER);
      eir.extend_from_slice(&company.to_le_bytes());
      eir.extend_from_slice(data);
   }
   let device_id = device
      .modalias()
      .await
      .ok()
      .flatten()
      .and_then(|m| {
         Some(DeviceId {
            vendor: u16::try_from(m.vendor).ok()?,
            product: u16::try_from(m.product).ok()?,
         })
      });

   InquiryResult {
      address: device.address().into(),
      name,
      class: device.class().await.ok().flatten().unwrap_or(0),
      services: ServiceMask::from_uuids(&uuids),
      rssi: device.rssi().await.ok().flatten(),
      eir,
      device_id,
   }
}

/// Waits for a peer-initiated pairing to finish and reports it.
fn watch_incoming(bridge: Arc<Bridge>, adapter: Adapter, address: Address) {
   tokio::spawn(async move {
      let Ok(device) = adapter.device(address.into()) else { return };
      let deadline = time::Instant::now() + AGENT_TIMEOUT;
      let status = loop {
         if matches!(device.is_paired().await, Ok(true)) {
            break Ok(None);
         }
         if time::Instant::now() >= deadline {
            break Err(PairingFailure::Timeout);
         }
         time::sleep(BOND_POLL_INTERVAL).await;
      };
      if bridge.incoming.lock().remove(&address) {
         bridge.emit(TransportEvent::PairingComplete { address, status });
      }
   });
}

fn agent(bridge: Arc<Bridge>, adapter: Adapter) -> Agent {
   let pin_bridge = bridge.clone();
   let pin_adapter = adapter.clone();
   let confirm_bridge = bridge.clone();
   let confirm_adapter = adapter.clone();
   let authorize_bridge = bridge.clone();
   let authorize_adapter = adapter;
   let display_bridge = bridge.clone();
   let service_bridge = bridge;

   Agent {
      request_default: true,
      request_pin_code: Some(Box::new(move |req| {
         let bridge = pin_bridge.clone();
         let adapter = pin_adapter.clone();
         async move {
            let address = Address::from(req.device);
            let incoming = !bridge.outgoing.lock().contains(&address);
            match bridge
               .request(address, PairingRequest::PinCode { min_len: 0 })
               .await?
            {
               PairingReply::PinCode(pin) => {
                  if incoming {
                     watch_incoming(bridge.clone(), adapter, address);
                  }
                  Ok(pin.to_string())
               },
               _ => Err(ReqError::Rejected),
            }
         }
         .boxed()
      })),
      display_passkey: Some(Box::new(move |req| {
         let bridge = display_bridge.clone();
         async move {
            if req.entered == 0 {
               bridge.emit(TransportEvent::Pairing {
                  address: req.device.into(),
                  request: PairingRequest::PasskeyDisplay { value: req.passkey },
               });
            }
            Ok(())
         }
         .boxed()
      })),
      request_confirmation: Some(Box::new(move |req| {
         let bridge = confirm_bridge.clone();
         let adapter = confirm_adapter.clone();
         async move {
            let address = Address::from(req.device);
            let incoming = !bridge.outgoing.lock().contains(&address);
            let request = PairingRequest::Confirmation {
               value: req.passkey,
               mitm: true,
            };
            match bridge.request(address, request).await? {
               PairingReply::Confirm(true) => {
                  if incoming {
                     watch_incoming(bridge.clone(), adapter, address);
                  }
                  Ok(())
               },
               _ => Err(ReqError::Rejected),
            }
         }
         .boxed()
      })),
      request_authorization: Some(Box::new(move |req| {
         let bridge = authorize_bridge.clone();
         let adapter = authorize_adapter.clone();
         async move {
            let address = Address::from(req.device);
            let request = PairingRequest::Confirmation {
               value: 0,
               mitm: false,
            };
            match bridge.request(address, request).await? {
               PairingReply::Confirm(true) => {
                  watch_incoming(bridge.clone(), adapter, address);
                  Ok(())
               },
               _ => Err(ReqError::Rejected),
            }
         }
         .boxed()
      })),
      authorize_service: Some(Box::new(move |req| {
         let bridge = service_bridge.clone();
         async move {
            let address = Address::from(req.device);
            let services = ServiceMask::from_uuid(&req.service);
            let request = TransportEvent::Pairing {
               address,
               request: PairingRequest::Authorization { services },
            };
            match bridge.prompt(address, request).await? {
               PairingReply::Authorize(granted) if !granted.is_empty() => Ok(()),
               _ => Err(ReqError::Rejected),
            }
         }
         .boxed()
      })),
      ..Default::default()
   }
}
