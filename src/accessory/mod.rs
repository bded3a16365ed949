//! Accessory manager.
//!
//! Speaks the accessory control protocol to paired devices recognized as
//! accessories: typed control settings over a generic key/value RPC,
//! capability vectors, battery and in-ear status, setup and relay
//! messages, connection priority lists and the custom message bus.

pub mod parser;
pub mod protocol;
pub mod recognition;
pub mod settings;
mod state;

use std::{
   collections::HashMap,
   sync::Arc,
   time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::oneshot;

use self::{
   parser::{CommandStatus, RelayMessage, SetupMessage},
   protocol::{
      BatteryInfo, CapabilityBit, CapabilityInteger, CommandRequest, ControlType,
      CustomMessageType, InEarStatus, MAX_FRAME, Opcode, PKT_HANDSHAKE, PKT_REQUEST_NOTIFY,
      PriorityListKind, RelayType, SetupOp, SetupType,
   },
   recognition::Recognition,
   settings::{
      CallManagementConfig, ControlValue, CrownRotation, DoubleTapActions, GestureModes,
      ListeningMode, ListeningModeConfigs, MicMode,
   },
   state::AccessoryDevice,
};
use crate::{
   address::Address,
   error::{Error, ErrorKind, Result},
   event::{Registrations, Sink, Subscription},
   registry::{DeviceHandle, Registry, copy_into},
   services::ServiceMask,
   session::Shared,
};

/// Protocol layer at which an accessory request timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutLayer {
   /// The peer never answered a command.
   Command,
   /// The transport never delivered a frame.
   Transport,
   /// The control channel never came up.
   Connection,
}

/// Error type for accessory operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessoryError {
   #[error("Device is not a recognized accessory")]
   UnknownAccessory,

   #[error("Accessory already registered")]
   AlreadyRegistered,

   #[error("No battery information received")]
   NoBatteryInfo,

   #[error("Accessory already plugged in")]
   AlreadyPluggedIn,

   #[error("Accessory not plugged in")]
   NotPluggedIn,

   #[error("Accessory control channel not connected")]
   NotConnected,

   #[error("A request of this type is already pending")]
   Pending,

   #[error("Control type {0} is retired")]
   RetiredControl(ControlType),

   #[error("Invalid value for {0}")]
   InvalidValue(&'static str),

   #[error("Payload too large: {len} bytes")]
   PayloadTooLarge { len: usize },

   #[error("Timed out at the {0} layer")]
   Timeout(TimeoutLayer),

   #[error("Connection lost")]
   ConnectionLost,
}

impl AccessoryError {
   pub const fn kind(&self) -> ErrorKind {
      match self {
         Self::UnknownAccessory
         | Self::RetiredControl(_)
         | Self::InvalidValue(_)
         | Self::PayloadTooLarge { .. } => ErrorKind::Argument,
         Self::AlreadyRegistered
         | Self::NoBatteryInfo
         | Self::AlreadyPluggedIn
         | Self::NotPluggedIn
         | Self::NotConnected
         | Self::Pending => ErrorKind::State,
         Self::Timeout(_) => ErrorKind::Timeout,
         Self::ConnectionLost => ErrorKind::Resource,
      }
   }

   pub const fn code(&self) -> i32 {
      match self {
         Self::UnknownAccessory => 600,
         Self::AlreadyRegistered => 601,
         Self::NoBatteryInfo => 602,
         Self::AlreadyPluggedIn => 603,
         Self::NotPluggedIn => 604,
         Self::NotConnected => 312,
         Self::Pending => 10,
         Self::RetiredControl(_) | Self::InvalidValue(_) | Self::PayloadTooLarge { .. } => 3,
         Self::Timeout(TimeoutLayer::Command) => 316,
         Self::Timeout(TimeoutLayer::Transport) => 322,
         Self::Timeout(TimeoutLayer::Connection) => 307,
         Self::ConnectionLost => 313,
      }
   }
}

/// Connection state of an accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum AccessoryState {
   #[default]
   Unknown,
   PluggedIn,
   Unplugged,
}

#[derive(Debug, Clone)]
pub enum AccessoryEvent {
   DeviceFound {
      device: DeviceHandle,
      reason: Recognition,
   },
   DeviceLost(DeviceHandle),
   StateChanged {
      device: DeviceHandle,
      state: AccessoryState,
   },
   BatteryChanged {
      device: DeviceHandle,
      battery: BatteryInfo,
   },
   InEarChanged {
      device: DeviceHandle,
      status: InEarStatus,
   },
   NameChanged {
      device: DeviceHandle,
      name: SmolStr,
   },
   SettingsChanged {
      device: DeviceHandle,
      control: ControlType,
      value: u32,
   },
   CapabilitiesReceived(DeviceHandle),
   Setup {
      device: DeviceHandle,
      message: SetupMessage,
   },
   Relay {
      device: DeviceHandle,
      message: RelayMessage,
   },
   CommandStatus {
      device: DeviceHandle,
      status: CommandStatus,
   },
   /// An asynchronous request failed after it was accepted.
   Failed {
      device: DeviceHandle,
      error: AccessoryError,
   },
}

/// Inbound vendor message on one custom channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
   pub device: DeviceHandle,
   pub ty: CustomMessageType,
   pub payload: Vec<u8>,
}

/// Bytes of frame header and opcode in front of every payload.
const FRAME_OVERHEAD: usize = 6;

/// Accessory control plane of one session.
pub struct AccessoryManager {
   shared: Arc<Shared>,
   registry: Arc<Registry>,
   devices: Mutex<HashMap<DeviceHandle, Arc<AccessoryDevice>>>,
   listeners: Registrations<(), AccessoryEvent>,
   custom: Registrations<CustomMessageType, CustomMessage>,
}

impl AccessoryManager {
   pub(crate) fn new(shared: Arc<Shared>, registry: Arc<Registry>) -> Self {
      Self {
         shared,
         registry,
         devices: Mutex::new(HashMap::new()),
         listeners: Registrations::new(),
         custom: Registrations::new(),
      }
   }

   fn emit(&self, event: AccessoryEvent) {
      self.shared.queue.post_all(self.listeners.all(), event);
   }

   fn entry(&self, handle: DeviceHandle, address: Address) -> Arc<AccessoryDevice> {
      self
         .devices
         .lock()
         .entry(handle)
         .or_insert_with(|| Arc::new(AccessoryDevice::new(handle, address)))
         .clone()
   }

   fn device(&self, handle: DeviceHandle) -> Result<Arc<AccessoryDevice>> {
      self.shared.ensure_attached()?;
      let info = self.registry.snapshot(handle).ok_or(Error::InvalidHandle)?;
      if !info.accessory {
         return Err(AccessoryError::UnknownAccessory.into());
      }
      Ok(self.entry(handle, info.address))
   }

   fn connected(&self, handle: DeviceHandle) -> Result<Arc<AccessoryDevice>> {
      let dev = self.device(handle)?;
      if !dev.is_plugged_in() {
         return Err(AccessoryError::NotConnected.into());
      }
      Ok(dev)
   }

   fn by_address(&self, address: Address) -> Option<Arc<AccessoryDevice>> {
      let handle = self.registry.lookup_address(address)?;
      self.devices.lock().get(&handle).cloned()
   }

   fn send_frame(&self, dev: &AccessoryDevice, data: &[u8]) -> Result<()> {
      if data.len() > MAX_FRAME {
         return Err(AccessoryError::PayloadTooLarge { len: data.len() }.into());
      }
      debug!("{}: → {}", dev.address, hex::encode(data));
      self.shared.transport.send(dev.address, data)
   }

   fn check_payload(payload: &[u8], extra: usize) -> Result<()> {
      if payload.len() + extra + FRAME_OVERHEAD > MAX_FRAME {
         return Err(AccessoryError::PayloadTooLarge { len: payload.len() }.into());
      }
      Ok(())
   }

   // ---- registration ----

   /// Registers `address` as an accessory, creating the registry entry if needed.
   pub fn register_device(
      &self,
      address: Address,
      name: &str,
      class: u32,
      pincode: &str,
   ) -> Result<DeviceHandle> {
      self.shared.ensure_attached()?;
      let existing = self
         .registry
         .lookup_address(address)
         .and_then(|h| self.registry.snapshot(h).map(|info| (h, info)));
      let handle = match existing {
         Some((_, info)) if info.accessory => return Err(AccessoryError::AlreadyRegistered.into()),
         Some((h, info)) if info.paired => h,
         _ => self.registry.register_device(address, name, class, pincode)?,
      };
      self.registry.set_accessory(handle, true)?;
      self.registry.grant_services(handle, ServiceMask::AACP)?;
      self.entry(handle, address);
      info!("{address}: registered accessory");
      self.emit(AccessoryEvent::DeviceFound {
         device: handle,
         reason: Recognition::Registered,
      });
      Ok(handle)
   }

   pub fn unregister_device(&self, handle: DeviceHandle) -> Result<()> {
      let dev = self.device(handle)?;
      if dev.is_plugged_in() {
         self.registry.disconnect_services(handle, ServiceMask::AACP)?;
      }
      dev.fail_all(&AccessoryError::UnknownAccessory);
      self.registry.set_accessory(handle, false)?;
      self.devices.lock().remove(&handle);
      self.emit(AccessoryEvent::DeviceLost(handle));
      Ok(())
   }

   pub fn is_accessory(&self, handle: DeviceHandle) -> Result<bool> {
      self.shared.ensure_attached()?;
      let info = self.registry.snapshot(handle).ok_or(Error::InvalidHandle)?;
      Ok(info.accessory)
   }

   pub fn state(&self, handle: DeviceHandle) -> Result<AccessoryState> {
      Ok(self.device(handle)?.state())
   }

   /// Opens the control channel. Completion arrives as `StateChanged`.
   pub fn plug_in(&self, handle: DeviceHandle) -> Result<()> {
      let dev = self.device(handle)?;
      if dev.is_plugged_in() {
         return Err(AccessoryError::AlreadyPluggedIn.into());
      }
      self.registry.connect_services(handle, ServiceMask::AACP)?;
      dev.arm_connect(Instant::now() + self.shared.config.accessory_connect_timeout());
      Ok(())
   }

   pub fn unplug(&self, handle: DeviceHandle) -> Result<()> {
      let dev = self.device(handle)?;
      if !dev.is_plugged_in() {
         return Err(AccessoryError::NotPluggedIn.into());
      }
      self.registry.disconnect_services(handle, ServiceMask::AACP)
   }

   /// Plugged-in accessories.
   pub fn devices(&self) -> Result<Vec<DeviceHandle>> {
      self.shared.ensure_attached()?;
      let mut handles: Vec<_> = self
         .devices
         .lock()
         .values()
         .filter(|d| d.is_plugged_in())
         .map(|d| d.handle)
         .collect();
      handles.sort_unstable();
      Ok(handles)
   }

   pub fn devices_into(&self, out: &mut [DeviceHandle]) -> Result<usize> {
      copy_into(&self.devices()?, out)
   }

   pub fn add_listener(&self, sink: Sink<AccessoryEvent>) -> Subscription {
      self.listeners.add((), sink)
   }

   // ---- status ----

   pub fn battery(&self, handle: DeviceHandle) -> Result<BatteryInfo> {
      self
         .device(handle)?
         .battery()
         .ok_or_else(|| AccessoryError::NoBatteryInfo.into())
   }

   pub fn in_ear_status(&self, handle: DeviceHandle) -> Result<InEarStatus> {
      Ok(self.device(handle)?.in_ear().unwrap_or_default())
   }

   pub fn capability_bit(&self, handle: DeviceHandle, bit: CapabilityBit) -> Result<bool> {
      Ok(self.device(handle)?.capability_bit(bit))
   }

   pub fn capability_integer(&self, handle: DeviceHandle, integer: CapabilityInteger) -> Result<u32> {
      Ok(self.device(handle)?.capability_integer(integer))
   }

   pub fn capabilities_received(&self, handle: DeviceHandle) -> Result<bool> {
      Ok(self.device(handle)?.capabilities_received())
   }

   // ---- control RPC ----

   pub fn send_control(&self, handle: DeviceHandle, ty: ControlType, value: u32) -> Result<()> {
      if ty.is_retired() {
         return Err(AccessoryError::RetiredControl(ty).into());
      }
      let dev = self.connected(handle)?;
      self.send_frame(&dev, &protocol::control_frame(ty, value))?;
      if dev.update_control(ty, value).is_updated() {
         debug!("{}: {ty} = {value:#x}", dev.address);
      }
      Ok(())
   }

   /// Queries the peer. A newer get of the same type answers both.
   pub async fn get_control(&self, handle: DeviceHandle, ty: ControlType, subtype: u16) -> Result<u32> {
      let rx = self.request_control(handle, ty, subtype)?;
      match rx.await {
         Ok(result) => result.map_err(Error::from),
         Err(_) => Err(AccessoryError::ConnectionLost.into()),
      }
   }

   fn request_control(
      &self,
      handle: DeviceHandle,
      ty: ControlType,
      subtype: u16,
   ) -> Result<oneshot::Receiver<std::result::Result<u32, AccessoryError>>> {
      if ty.is_retired() {
         return Err(AccessoryError::RetiredControl(ty).into());
      }
      let dev = self.connected(handle)?;
      let (tx, rx) = oneshot::channel();
      let deadline = Instant::now() + self.shared.config.accessory_command_timeout();
      dev.add_pending(ty, tx, deadline);
      if let Err(e) = self.send_frame(&dev, &protocol::control_query_frame(ty, subtype)) {
         drop(rx);
         dev.discard_abandoned(ty);
         return Err(e);
      }
      Ok(rx)
   }

   /// Last value seen for `ty` on the current connection.
   pub fn control(&self, handle: DeviceHandle, ty: ControlType) -> Result<Option<u32>> {
      Ok(self.device(handle)?.control(ty))
   }

   pub fn controls(&self, handle: DeviceHandle) -> Result<Vec<(ControlType, u32)>> {
      Ok(self.device(handle)?.controls())
   }

   pub fn set_setting<T: ControlValue>(&self, handle: DeviceHandle, ty: ControlType, value: T) -> Result<()> {
      self.send_control(handle, ty, value.encode())
   }

   pub fn setting<T: ControlValue>(&self, handle: DeviceHandle, ty: ControlType) -> Result<Option<T>> {
      Ok(self.control(handle, ty)?.and_then(T::decode))
   }

   // ---- setup / relay / priority list ----

   pub fn send_setup_command(
      &self,
      handle: DeviceHandle,
      ty: SetupType,
      op: SetupOp,
      payload: &[u8],
   ) -> Result<()> {
      Self::check_payload(payload, 4)?;
      let dev = self.connected(handle)?;
      self.send_frame(&dev, &protocol::setup_frame(ty, op as u8, payload))
   }

   pub fn send_relay_message(
      &self,
      handle: DeviceHandle,
      dest: Address,
      ty: RelayType,
      payload: &[u8],
   ) -> Result<()> {
      Self::check_payload(payload, 9)?;
      let dev = self.connected(handle)?;
      self.send_frame(&dev, &protocol::relay_frame(dest, ty, payload))
   }

   /// TiPi updates are single-outstanding until acknowledged or timed out.
   pub fn send_priority_list(
      &self,
      handle: DeviceHandle,
      kind: PriorityListKind,
      list: &[Address],
   ) -> Result<()> {
      if list.len() > usize::from(u8::MAX) {
         return Err(AccessoryError::InvalidValue("priority list length").into());
      }
      let dev = self.connected(handle)?;
      let packet = protocol::priority_list_frame(kind, list);
      if kind == PriorityListKind::TiPi {
         let deadline = Instant::now() + self.shared.config.accessory_command_timeout();
         if !dev.begin_tipi(deadline) {
            return Err(AccessoryError::Pending.into());
         }
         if let Err(e) = self.send_frame(&dev, &packet) {
            dev.end_tipi();
            return Err(e);
         }
         return Ok(());
      }
      self.send_frame(&dev, &packet)
   }

   // ---- custom messages ----

   /// Subscribes `sink` to every channel in `mask`.
   pub fn register_custom_message_client(
      &self,
      mask: CustomMessageType,
      sink: Sink<CustomMessage>,
   ) -> Result<Subscription> {
      self.shared.ensure_attached()?;
      if mask.is_empty() {
         return Err(AccessoryError::InvalidValue("custom message mask").into());
      }
      Ok(self.custom.add(mask, sink))
   }

   pub fn send_custom_message(
      &self,
      handle: DeviceHandle,
      ty: CustomMessageType,
      payload: &[u8],
   ) -> Result<()> {
      if ty.bits().count_ones() != 1 {
         return Err(AccessoryError::InvalidValue("custom message type").into());
      }
      Self::check_payload(payload, 4)?;
      let dev = self.connected(handle)?;
      self.send_frame(&dev, &protocol::custom_frame(ty, payload))
   }

   // ---- transport events ----

   /// Runs recognition; marks the device as an accessory on first match.
   pub(crate) fn evaluate(&self, handle: DeviceHandle, manufacturer: Option<&[u8]>) -> Option<Recognition> {
      let info = self.registry.snapshot(handle)?;
      if info.accessory {
         return Some(Recognition::Registered);
      }
      let reason = recognition::recognize(&info, &self.shared.config, manufacturer)?;
      if let Err(e) = self.registry.set_accessory(handle, true) {
         warn!("{}: failed to mark accessory: {e}", info.address);
      }
      if info.paired
         && let Err(e) = self.registry.grant_services(handle, ServiceMask::AACP)
      {
         warn!("{}: failed to authorize control channel: {e}", info.address);
      }
      self.entry(handle, info.address);
      info!("{}: recognized accessory ({reason})", info.address);
      self.emit(AccessoryEvent::DeviceFound {
         device: handle,
         reason,
      });
      Some(reason)
   }

   pub(crate) fn on_services_connected(&self, handle: DeviceHandle, services: ServiceMask) {
      if !services.contains(ServiceMask::AACP) || self.evaluate(handle, None).is_none() {
         return;
      }
      let Some(address) = self.registry.snapshot(handle).map(|i| i.address) else {
         return;
      };
      let dev = self.entry(handle, address);
      dev.disarm_connect();
      if dev.set_state(AccessoryState::PluggedIn) == AccessoryState::PluggedIn {
         return;
      }
      info!("{address}: accessory plugged in");
      for packet in [PKT_HANDSHAKE, PKT_REQUEST_NOTIFY] {
         if let Err(e) = self.send_frame(&dev, packet) {
            warn!("{address}: failed to start control session: {e}");
            break;
         }
      }
      self.emit(AccessoryEvent::StateChanged {
         device: handle,
         state: AccessoryState::PluggedIn,
      });
   }

   pub(crate) fn on_services_disconnected(&self, handle: DeviceHandle, services: ServiceMask) {
      if !services.contains(ServiceMask::AACP) {
         return;
      }
      let Some(dev) = self.devices.lock().get(&handle).cloned() else {
         return;
      };
      dev.on_disconnect();
      if dev.set_state(AccessoryState::Unplugged) != AccessoryState::Unplugged {
         info!("{}: accessory unplugged", dev.address);
         self.emit(AccessoryEvent::StateChanged {
            device: handle,
            state: AccessoryState::Unplugged,
         });
      }
   }

   pub(crate) fn on_send_failed(&self, address: Address, timed_out: bool) {
      let Some(dev) = self.by_address(address) else {
         return;
      };
      let error = if timed_out {
         AccessoryError::Timeout(TimeoutLayer::Transport)
      } else {
         AccessoryError::ConnectionLost
      };
      warn!("{address}: frame not delivered: {error}");
      dev.fail_all(&error);
      self.emit(AccessoryEvent::Failed {
         device: dev.handle,
         error,
      });
   }

   pub(crate) fn on_frame(&self, address: Address, data: &[u8]) {
      debug!("{address}: ← {}", hex::encode(data));
      let Some(dev) = self.by_address(address).filter(|d| d.is_plugged_in()) else {
         debug!("{address}: frame from unknown accessory dropped");
         return;
      };
      let (opcode, payload) = match parser::split_frame(data) {
         Ok(split) => split,
         Err(e) => {
            warn!("{address}: malformed frame: {e}");
            return;
         },
      };
      if let Err(e) = self.dispatch(&dev, opcode, payload) {
         warn!("{address}: failed to parse {opcode}: {e}");
      }
   }

   fn dispatch(
      &self,
      dev: &AccessoryDevice,
      opcode: Opcode,
      payload: &[u8],
   ) -> std::result::Result<(), parser::ProtoError> {
      let device = dev.handle;
      match opcode {
         Opcode::BATTERY => {
            let battery = parser::parse_battery(payload)?;
            self.registry.set_battery_level(device, battery.summary_level());
            if dev.update_battery(battery).is_updated() {
               self.emit(AccessoryEvent::BatteryChanged { device, battery });
            }
         },
         Opcode::IN_EAR => {
            let status = parser::parse_in_ear(payload)?;
            if dev.update_in_ear(status).is_updated() {
               self.emit(AccessoryEvent::InEarChanged { device, status });
            }
         },
         Opcode::CONTROL => {
            let (control, value) = parser::parse_control(payload)?;
            dev.resolve(control, value);
            if dev.update_control(control, value).is_updated() {
               self.emit(AccessoryEvent::SettingsChanged {
                  device,
                  control,
                  value,
               });
            }
         },
         Opcode::METADATA => {
            let metadata = parser::parse_metadata(payload)?;
            if let Some(name) = metadata.name_candidate
               && dev.update_name(name.clone()).is_updated()
               && self.registry.update_name_from_peer(device, &name)
            {
               self.emit(AccessoryEvent::NameChanged { device, name });
            }
         },
         Opcode::CAPABILITIES => {
            let caps = parser::parse_capabilities(payload)?;
            debug!(
               "{}: {} capability bits, {} integers",
               dev.address,
               caps.bits.len(),
               caps.integers.len()
            );
            dev.set_capabilities(&caps);
            self.emit(AccessoryEvent::CapabilitiesReceived(device));
         },
         Opcode::SETUP => {
            let message = parser::parse_setup(payload)?;
            self.emit(AccessoryEvent::Setup { device, message });
         },
         Opcode::RELAY => {
            let message = parser::parse_relay(payload)?;
            self.emit(AccessoryEvent::Relay { device, message });
         },
         Opcode::COMMAND_STATUS => {
            let status = parser::parse_command_status(payload)?;
            if status.request == CommandRequest::PriorityListTiPi {
               dev.end_tipi();
            }
            self.emit(AccessoryEvent::CommandStatus { device, status });
         },
         Opcode::CUSTOM => {
            let (ty, body) = parser::parse_custom(payload)?;
            let sinks = self.custom.matching(|mask| mask.intersects(ty));
            if sinks.is_empty() {
               debug!("{}: no client for custom message {ty}", dev.address);
            }
            self.shared.queue.post_all(
               sinks,
               CustomMessage {
                  device,
                  ty,
                  payload: body.to_vec(),
               },
            );
         },
         other => debug!("{}: ignoring opcode {other}", dev.address),
      }
      Ok(())
   }

   pub(crate) fn tick(&self, now: Instant) {
      let devices: Vec<_> = self.devices.lock().values().cloned().collect();
      for dev in devices {
         let expired = dev.expire(now);
         if expired > 0 {
            debug!("{}: {expired} control queries timed out", dev.address);
         }
         if dev.tipi_expired(now) {
            warn!("{}: priority list update not acknowledged", dev.address);
            self.emit(AccessoryEvent::Failed {
               device: dev.handle,
               error: AccessoryError::Timeout(TimeoutLayer::Command),
            });
         }
         if dev.connect_expired(now) {
            warn!("{}: control channel did not come up", dev.address);
            self.emit(AccessoryEvent::Failed {
               device: dev.handle,
               error: AccessoryError::Timeout(TimeoutLayer::Connection),
            });
            if dev.set_state(AccessoryState::Unplugged) != AccessoryState::Unplugged {
               self.emit(AccessoryEvent::StateChanged {
                  device: dev.handle,
                  state: AccessoryState::Unplugged,
               });
            }
         }
      }
   }

   /// Fails outstanding requests when the session goes away.
   pub(crate) fn shutdown(&self) {
      for dev in self.devices.lock().drain().map(|(_, d)| d) {
         dev.fail_all(&AccessoryError::ConnectionLost);
      }
      self.listeners.clear();
      self.custom.clear();
   }
}

macro_rules! typed_controls {
   ($( $(#[$meta:meta])* $get:ident, $set:ident: $ty:ty = $control:ident; )*) => {
      impl AccessoryManager {
         $(
            $(#[$meta])*
            pub fn $get(&self, handle: DeviceHandle) -> Result<Option<$ty>> {
               self.setting(handle, ControlType::$control)
            }

            $(#[$meta])*
            pub fn $set(&self, handle: DeviceHandle, value: $ty) -> Result<()> {
               self.set_setting(handle, ControlType::$control, value)
            }
         )*
      }
   };
}

typed_controls! {
   listening_mode, set_listening_mode: ListeningMode = LISTENING_MODE;
   listening_mode_configs, set_listening_mode_configs: ListeningModeConfigs = LISTENING_MODE_CONFIGS;
   one_bud_anc, set_one_bud_anc: bool = ONE_BUD_ANC;
   crown_rotation, set_crown_rotation: CrownRotation = CROWN_ROTATION;
   auto_answer, set_auto_answer: bool = AUTO_ANSWER;
   double_click_interval, set_double_click_interval: Duration = DOUBLE_CLICK_INTERVAL;
   click_hold_interval, set_click_hold_interval: Duration = CLICK_HOLD_INTERVAL;
   click_hold_modes, set_click_hold_modes: GestureModes = CLICK_HOLD;
   call_management_config, set_call_management_config: CallManagementConfig = CALL_CONFIG;
   volume_swipe_mode, set_volume_swipe_mode: bool = VOLUME_SWIPE_MODE;
   volume_swipe_interval, set_volume_swipe_interval: Duration = VOLUME_SWIPE_INTERVAL;
   /// Raw switch control mode; its values are product specific.
   switch_control_mode, set_switch_control_mode: u32 = SWITCH_CONTROL;
   mic_mode, set_mic_mode: MicMode = MIC_MODE;
   in_ear_detection, set_in_ear_detection: bool = IN_EAR_DETECTION;
   double_tap_actions, set_double_tap_actions: DoubleTapActions = DOUBLE_TAP;
}

impl AccessoryManager {
   pub fn chime_volume(&self, handle: DeviceHandle) -> Result<Option<u8>> {
      self.setting(handle, ControlType::CHIME_VOLUME)
   }

   /// Percent, 0-100.
   pub fn set_chime_volume(&self, handle: DeviceHandle, volume: u8) -> Result<()> {
      if volume > 100 {
         return Err(AccessoryError::InvalidValue("chime volume").into());
      }
      self.set_setting(handle, ControlType::CHIME_VOLUME, volume)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      testing,
      transport::{MemoryTransport, Request, TransportEvent},
   };

   const BUDS: Address = Address::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);

   struct Rig {
      session: crate::session::Session,
      transport: Arc<MemoryTransport>,
      manager: Arc<AccessoryManager>,
      handle: DeviceHandle,
      rx: tokio::sync::mpsc::UnboundedReceiver<AccessoryEvent>,
      _sub: Subscription,
   }

   async fn plugged_in(name: &str) -> Rig {
      let (session, transport, _events) = testing::attach_memory(name).await;
      transport.respond(true);
      let manager = session.accessory_manager();
      let (sink, mut rx) = testing::collector();
      let sub = manager.add_listener(sink);
      let handle = manager.register_device(BUDS, "Buds", 0x240418, "").unwrap();
      manager.plug_in(handle).unwrap();
      loop {
         if let AccessoryEvent::StateChanged { state, .. } = testing::recv(&mut rx).await {
            assert_eq!(state, AccessoryState::PluggedIn);
            break;
         }
      }
      Rig {
         session,
         transport,
         manager,
         handle,
         rx,
         _sub: sub,
      }
   }

   #[tokio::test]
   async fn test_control_round_trip_through_echo() {
      let Rig {
         session: _session,
         transport,
         manager,
         handle,
         rx: _rx,
         _sub,
      } = plugged_in("acc-echo").await;
      let frames = transport.sent_frames(BUDS);
      assert_eq!(&frames[0][..], PKT_HANDSHAKE);
      assert_eq!(&frames[1][..], PKT_REQUEST_NOTIFY);

      manager.set_listening_mode(handle, ListeningMode::Anc).unwrap();
      let value = manager
         .get_control(handle, ControlType::LISTENING_MODE, 0)
         .await
         .unwrap();
      assert_eq!(value, ListeningMode::Anc as u32);
      assert_eq!(
         manager.listening_mode(handle).unwrap(),
         Some(ListeningMode::Anc)
      );
   }

   #[tokio::test]
   async fn test_custom_message_fan_out() {
      let Rig {
         session: _session,
         transport,
         manager,
         handle,
         rx: _rx,
         _sub,
      } = plugged_in("acc-custom").await;
      let (sink_a, mut rx_a) = testing::collector();
      let (sink_b, mut rx_b) = testing::collector();
      let _a = manager
         .register_custom_message_client(CustomMessageType::from_bits(0x01), sink_a)
         .unwrap();
      let _b = manager
         .register_custom_message_client(CustomMessageType::from_bits(0x03), sink_b)
         .unwrap();

      let frame = |bits| TransportEvent::Frame {
         address: BUDS,
         data: protocol::custom_frame(CustomMessageType::from_bits(bits), b"hi"),
      };
      assert!(transport.inject(frame(0x01)));
      let a: CustomMessage = testing::recv(&mut rx_a).await;
      let b: CustomMessage = testing::recv(&mut rx_b).await;
      assert_eq!(a, b);
      assert_eq!(a.device, handle);
      assert_eq!(a.payload, b"hi");

      assert!(transport.inject(frame(0x02)));
      let b: CustomMessage = testing::recv(&mut rx_b).await;
      assert_eq!(b.ty, CustomMessageType::SCP);
      testing::settle().await;
      assert!(rx_a.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_priority_list_pending() {
      let Rig {
         session: _session,
         transport,
         manager,
         handle,
         mut rx,
         _sub,
      } = plugged_in("acc-tipi").await;
      let list = [Address::new([1, 1, 1, 1, 1, 1])];
      manager
         .send_priority_list(handle, PriorityListKind::TiPi, &list)
         .unwrap();
      let err = manager
         .send_priority_list(handle, PriorityListKind::TiPi, &list)
         .unwrap_err();
      assert!(matches!(err, Error::Accessory(AccessoryError::Pending)));
      manager
         .send_priority_list(handle, PriorityListKind::LegacyTriangle, &list)
         .unwrap();

      let mut status = protocol::HDR_FRAME.to_vec();
      status.extend_from_slice(&[0x33, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
      assert!(transport.inject(TransportEvent::Frame {
         address: BUDS,
         data: status.as_slice().into(),
      }));
      loop {
         if let AccessoryEvent::CommandStatus { status, .. } = testing::recv(&mut rx).await {
            assert_eq!(status.request, CommandRequest::PriorityListTiPi);
            break;
         }
      }
      manager
         .send_priority_list(handle, PriorityListKind::TiPi, &list)
         .unwrap();
   }

   #[tokio::test]
   async fn test_status_frames_and_capabilities() {
      let Rig {
         session,
         transport,
         manager,
         handle,
         mut rx,
         _sub,
      } = plugged_in("acc-status").await;
      assert!(matches!(
         manager.battery(handle),
         Err(Error::Accessory(AccessoryError::NoBatteryInfo))
      ));
      assert!(!manager.capability_bit(handle, CapabilityBit::SPATIAL_AUDIO).unwrap());
      assert_eq!(
         manager
            .capability_integer(handle, CapabilityInteger::CHIME_VOLUME)
            .unwrap(),
         0
      );

      let mut battery = protocol::HDR_FRAME.to_vec();
      battery.extend_from_slice(&[0x04, 0x00, 0x01, 0x01, 0x00, 0x37, 0x02, 0x01]);
      transport.inject(TransportEvent::Frame {
         address: BUDS,
         data: battery.as_slice().into(),
      });
      let mut caps = protocol::HDR_FRAME.to_vec();
      caps.extend_from_slice(&[0x2B, 0x00, 0x01, 0x40, 0x01, 0x07, 0x0A, 0x00, 0x00, 0x00]);
      transport.inject(TransportEvent::Frame {
         address: BUDS,
         data: caps.as_slice().into(),
      });
      loop {
         if let AccessoryEvent::CapabilitiesReceived(device) = testing::recv(&mut rx).await {
            assert_eq!(device, handle);
            break;
         }
      }
      assert_eq!(manager.battery(handle).unwrap().single.level, 0x37);
      assert_eq!(session.registry().battery_level(handle).unwrap(), Some(0x37));
      assert!(manager.capability_bit(handle, CapabilityBit::SPATIAL_AUDIO).unwrap());
      assert_eq!(
         manager
            .capability_integer(handle, CapabilityInteger::CHIME_VOLUME)
            .unwrap(),
         10
      );
   }

   #[tokio::test]
   async fn test_rejections() {
      let Rig {
         session,
         transport,
         manager,
         handle,
         mut rx,
         _sub,
      } = plugged_in("acc-reject").await;
      let other = session.registry().ensure_device(Address::new([9; 6]));
      assert!(matches!(
         manager.send_control(other, ControlType::MIC_MODE, 0),
         Err(Error::Accessory(AccessoryError::UnknownAccessory))
      ));
      assert!(matches!(
         manager.send_control(handle, ControlType::from_raw(0x0E), 0),
         Err(Error::Accessory(AccessoryError::RetiredControl(_)))
      ));
      assert!(matches!(
         manager.plug_in(handle),
         Err(Error::Accessory(AccessoryError::AlreadyPluggedIn))
      ));
      assert!(manager.set_chime_volume(handle, 101).is_err());
      assert!(
         manager
            .send_custom_message(handle, CustomMessageType::from_bits(0x3), b"")
            .is_err()
      );
      assert_eq!(manager.devices().unwrap(), vec![handle]);

      manager.unplug(handle).unwrap();
      loop {
         if let AccessoryEvent::StateChanged { state, .. } = testing::recv(&mut rx).await {
            assert_eq!(state, AccessoryState::Unplugged);
            break;
         }
      }
      assert!(matches!(
         manager.send_control(handle, ControlType::MIC_MODE, 0),
         Err(Error::Accessory(AccessoryError::NotConnected))
      ));
      assert!(matches!(
         manager.unplug(handle),
         Err(Error::Accessory(AccessoryError::NotPluggedIn))
      ));
      assert!(
         transport
            .requests()
            .contains(&Request::Disconnect(BUDS, ServiceMask::AACP))
      );
   }

   #[tokio::test]
   async fn test_refused_get_leaves_nothing_pending() {
      let Rig {
         session: _session,
         transport,
         manager,
         handle,
         rx: _rx,
         _sub,
      } = plugged_in("acc-refused").await;
      transport.respond(false);
      let waiting = {
         let manager = manager.clone();
         tokio::spawn(async move { manager.get_control(handle, ControlType::CHIME_VOLUME, 0).await })
      };
      testing::settle().await;
      assert_eq!(manager.device(handle).unwrap().pending_gets(), 1);

      transport.refuse_sends(true);
      assert!(matches!(
         manager.get_control(handle, ControlType::CHIME_VOLUME, 0).await,
         Err(Error::Transport(_))
      ));
      let dev = manager.device(handle).unwrap();
      assert_eq!(dev.pending_gets(), 1);

      transport.refuse_sends(false);
      assert_eq!(dev.resolve(ControlType::CHIME_VOLUME, 7), 1);
      assert_eq!(waiting.await.unwrap().unwrap(), 7);
      assert_eq!(dev.pending_gets(), 0);
   }

   #[tokio::test]
   async fn test_get_control_times_out() {
      let Rig {
         session: _session,
         transport,
         manager,
         handle,
         rx: _rx,
         _sub,
      } = plugged_in("acc-timeout").await;
      transport.respond(false);
      let err = manager
         .get_control(handle, ControlType::CHIME_VOLUME, 0)
         .await
         .unwrap_err();
      assert!(matches!(
         err,
         Error::Accessory(AccessoryError::Timeout(TimeoutLayer::Command))
      ));
   }
}
