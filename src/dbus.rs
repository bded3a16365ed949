//! D-Bus surface of the control plane.
//!
//! Addresses travel as `XX:XX:XX:XX:XX:XX` strings, masks in their textual
//! `a|b` form and structured results as JSON. Events of every component in
//! the session are relayed as signals carrying one JSON object each.

use std::{str::FromStr, sync::Arc};

use log::info;
use serde_json::{Value, json};
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
   accessory::{
      AccessoryEvent,
      protocol::{ControlType, CustomMessageType},
   },
   address::Address,
   discovery::{DiscoveryAgent, DiscoveryEvent, DiscoveryMode},
   error::{Error, ErrorKind},
   event::{Sink, Subscription},
   pairing::{IoCapability, OobData, PairingAgent, PairingEvent, SspResponse},
   registry::{DeviceHandle, DeviceInfo, LinkKey, ServiceEvent},
   services::{ServiceMask, SyncSettings},
   session::{Session, SessionEvent},
};

pub const SERVICE_NAME: &str = "org.btctl";
pub const OBJECT_PATH: &str = "/org/btctl/manager";

/// Event of any session component, queued for emission as a signal.
#[derive(Debug, Clone)]
pub enum Signal {
   Session(SessionEvent),
   Discovery(DiscoveryEvent),
   Pairing(PairingEvent),
   Service(ServiceEvent),
   Accessory(AccessoryEvent),
}

/// Wraps `signals` into a sink for one event category.
pub fn forward<E: Send + 'static>(signals: &Sink<Signal>, wrap: fn(E) -> Signal) -> Sink<E> {
   let signals = signals.clone();
   Arc::new(move |event: E| signals.emit(wrap(event)))
}

fn fail(e: Error) -> fdo::Error {
   let message = format!("[{}] {e}", e.code());
   match e.kind() {
      ErrorKind::Argument => fdo::Error::InvalidArgs(message),
      ErrorKind::Unsupported => fdo::Error::NotSupported(message),
      _ => fdo::Error::Failed(message),
   }
}

fn parse<T: FromStr>(what: &str, value: &str) -> fdo::Result<T> {
   value
      .parse()
      .map_err(|_| fdo::Error::InvalidArgs(format!("Invalid {what}: {value:?}")))
}

fn decode_hex(what: &str, value: &str) -> fdo::Result<Vec<u8>> {
   hex::decode(value).map_err(|e| fdo::Error::InvalidArgs(format!("Invalid {what}: {e}")))
}

fn decode_key(value: &str) -> fdo::Result<LinkKey> {
   let bytes: [u8; LinkKey::LEN] = decode_hex("link key", value)?
      .try_into()
      .map_err(|_| fdo::Error::InvalidArgs(format!("Link key must be {} bytes", LinkKey::LEN)))?;
   Ok(LinkKey::from_bytes(bytes))
}

pub fn device_json(handle: DeviceHandle, info: &DeviceInfo) -> Value {
   json!({
      "handle": handle.get(),
      "address": info.address.to_string(),
      "identifier": info.identifier.map(|id| id.to_string()),
      "name": info.display_name(),
      "type": info.device_type().to_string(),
      "class": info.class,
      "device_id": info.device_id,
      "supported": info.supported.to_string(),
      "authorized": info.authorized.to_string(),
      "connected": info.connected.to_string(),
      "paired": info.paired,
      "provenance": info.provenance.to_string(),
      "accessory": info.accessory,
      "hidden": info.hidden,
      "sync_settings": info.sync_settings.to_string(),
      "sync_groups": info.sync_groups,
      "battery_level": info.battery_level,
      "color": info.color,
      "rssi": info.rssi,
   })
}

impl Signal {
   pub fn to_json(&self) -> Value {
      match self {
         Self::Session(event) => match event {
            SessionEvent::Attached(Ok(())) => json!({ "event": "attached" }),
            SessionEvent::Attached(Err(e)) => {
               json!({ "event": "attached", "error": e.to_string(), "code": e.code() })
            },
            SessionEvent::Detached => json!({ "event": "detached" }),
            SessionEvent::Terminated => json!({ "event": "terminated" }),
         },
         Self::Discovery(event) => match event {
            DiscoveryEvent::ScanStarted { mode } => {
               json!({ "event": "scan_started", "mode": mode.to_string() })
            },
            DiscoveryEvent::ScanStopped { reason } => {
               json!({ "event": "scan_stopped", "reason": reason.to_string() })
            },
            DiscoveryEvent::QueryStarted(device) => {
               json!({ "event": "query_started", "device": device.get() })
            },
            DiscoveryEvent::QueryStopped { device, result } => match result {
               Ok(attributes) => json!({
                  "event": "query_stopped",
                  "device": device.get(),
                  "attributes": attributes.to_string(),
               }),
               Err(e) => json!({
                  "event": "query_stopped",
                  "device": device.get(),
                  "error": e.to_string(),
                  "code": e.code(),
               }),
            },
            DiscoveryEvent::DeviceFound { device, attributes } => json!({
               "event": "device_found",
               "device": device.get(),
               "attributes": attributes.to_string(),
            }),
            DiscoveryEvent::DeviceLost(device) => {
               json!({ "event": "device_lost", "device": device.get() })
            },
            DiscoveryEvent::DeviceChanged { device, changed } => json!({
               "event": "device_changed",
               "device": device.get(),
               "changed": changed.to_string(),
            }),
         },
         Self::Pairing(event) => match event {
            PairingEvent::AgentStarted => json!({ "event": "agent_started" }),
            PairingEvent::AgentStopped => json!({ "event": "agent_stopped" }),
            PairingEvent::AttemptStarted(device) => {
               json!({ "event": "attempt_started", "device": device.get() })
            },
            PairingEvent::AttemptComplete { device, result } => json!({
               "event": "attempt_complete",
               "device": device.get(),
               "result": result.to_string(),
               "code": result.code(),
            }),
            PairingEvent::PincodeRequest { device, min_length } => json!({
               "event": "pincode_request",
               "device": device.get(),
               "min_length": min_length,
            }),
            PairingEvent::UserConfirmation { device, value, mitm } => json!({
               "event": "user_confirmation",
               "device": device.get(),
               "value": format!("{value:06}"),
               "mitm": mitm,
            }),
            PairingEvent::PasskeyDisplay { device, value } => json!({
               "event": "passkey_display",
               "device": device.get(),
               "value": format!("{value:06}"),
            }),
            PairingEvent::AuthorizationRequest { device, services } => json!({
               "event": "authorization_request",
               "device": device.get(),
               "services": services.to_string(),
            }),
            PairingEvent::LocalOobDataReady(data) => {
               json!({ "event": "local_oob_data", "data": data })
            },
         },
         Self::Service(event) => {
            let name = match event {
               ServiceEvent::Connected { .. } => "connected",
               ServiceEvent::Disconnected { .. } => "disconnected",
               ServiceEvent::Refused { .. } => "refused",
            };
            json!({
               "event": name,
               "device": event.device().get(),
               "services": event.services().to_string(),
            })
         },
         Self::Accessory(event) => match event {
            AccessoryEvent::DeviceFound { device, reason } => json!({
               "event": "device_found",
               "device": device.get(),
               "reason": reason.to_string(),
            }),
            AccessoryEvent::DeviceLost(device) => {
               json!({ "event": "device_lost", "device": device.get() })
            },
            AccessoryEvent::StateChanged { device, state } => json!({
               "event": "state_changed",
               "device": device.get(),
               "state": state.to_string(),
            }),
            AccessoryEvent::BatteryChanged { device, battery } => json!({
               "event": "battery_changed",
               "device": device.get(),
               "battery": battery,
            }),
            AccessoryEvent::InEarChanged { device, status } => json!({
               "event": "in_ear_changed",
               "device": device.get(),
               "status": status,
            }),
            AccessoryEvent::NameChanged { device, name } => json!({
               "event": "name_changed",
               "device": device.get(),
               "name": name.as_str(),
            }),
            AccessoryEvent::SettingsChanged {
               device,
               control,
               value,
            } => json!({
               "event": "settings_changed",
               "device": device.get(),
               "control": control.to_string(),
               "value": value,
            }),
            AccessoryEvent::CapabilitiesReceived(device) => {
               json!({ "event": "capabilities_received", "device": device.get() })
            },
            AccessoryEvent::Setup { device, message } => json!({
               "event": "setup",
               "device": device.get(),
               "type": message.ty.to_string(),
               "op": message.op,
               "payload": hex::encode(&message.payload),
            }),
            AccessoryEvent::Relay { device, message } => json!({
               "event": "relay",
               "device": device.get(),
               "source": message.source.to_string(),
               "type": message.ty.to_string(),
               "payload": hex::encode(&message.payload),
            }),
            AccessoryEvent::CommandStatus { device, status } => json!({
               "event": "command_status",
               "device": device.get(),
               "request": status.request.to_string(),
               "result": status.result,
               "reason": status.reason,
            }),
            AccessoryEvent::Failed { device, error } => json!({
               "event": "failed",
               "device": device.get(),
               "error": error.to_string(),
               "code": error.code(),
            }),
         },
      }
   }

   pub async fn emit(&self, emitter: &SignalEmitter<'_>) -> zbus::Result<()> {
      let body = self.to_json().to_string();
      match self {
         Self::Session(_) => ControlService::session_event(emitter, &body).await,
         Self::Discovery(_) => ControlService::discovery_event(emitter, &body).await,
         Self::Pairing(_) => ControlService::pairing_event(emitter, &body).await,
         Self::Service(_) => ControlService::service_event(emitter, &body).await,
         Self::Accessory(_) => ControlService::accessory_event(emitter, &body).await,
      }
   }
}

/// Session exported on the bus together with one discovery and one pairing agent.
pub struct ControlService {
   discovery: DiscoveryAgent,
   pairing: PairingAgent,
   session: Session,
   _listeners: [Subscription; 2],
}

impl ControlService {
   pub fn new(session: Session, signals: &Sink<Signal>) -> Self {
      let listeners = [
         session
            .registry()
            .add_service_listener(ServiceMask::ALL, forward(signals, Signal::Service)),
         session
            .accessory_manager()
            .add_listener(forward(signals, Signal::Accessory)),
      ];
      Self {
         discovery: session.create_discovery_agent(forward(signals, Signal::Discovery)),
         pairing: session.create_pairing_agent(forward(signals, Signal::Pairing)),
         session,
         _listeners: listeners,
      }
   }

   pub const fn session(&self) -> &Session {
      &self.session
   }

   fn handle(&self, address: &str) -> fdo::Result<DeviceHandle> {
      let address: Address = parse("address", address)?;
      self
         .session
         .registry()
         .handle_for_address(address)
         .map_err(fail)
   }

   fn devices_json(&self, handles: crate::Result<Vec<DeviceHandle>>) -> fdo::Result<String> {
      let registry = self.session.registry();
      let devices: Vec<Value> = handles
         .map_err(fail)?
         .into_iter()
         .filter_map(|h| registry.info(h).ok().map(|info| device_json(h, &info)))
         .collect();
      Ok(Value::Array(devices).to_string())
   }

   fn accessory_json(&self, handle: DeviceHandle) -> fdo::Result<Value> {
      let accessories = self.session.accessory_manager();
      let registry = self.session.registry();
      let controls: serde_json::Map<String, Value> = accessories
         .controls(handle)
         .map_err(fail)?
         .into_iter()
         .map(|(ty, value)| (ty.to_string(), json!(value)))
         .collect();
      Ok(json!({
         "handle": handle.get(),
         "address": registry.address(handle).map_err(fail)?.to_string(),
         "name": registry.name(handle).map_err(fail)?.as_str(),
         "state": accessories.state(handle).map_err(fail)?.to_string(),
         "battery": accessories.battery(handle).ok(),
         "in_ear": accessories.in_ear_status(handle).ok(),
         "capabilities_received": accessories.capabilities_received(handle).unwrap_or(false),
         "controls": controls,
      }))
   }

   /// Decoded view of the cached settings; unknown values are null.
   fn settings_json(&self, handle: DeviceHandle) -> fdo::Result<Value> {
      let acc = self.session.accessory_manager();
      acc.state(handle).map_err(fail)?;
      let millis = |d: crate::Result<Option<std::time::Duration>>| d.ok().flatten().map(|d| d.as_millis() as u64);
      Ok(json!({
         "listening_mode": acc.listening_mode(handle).ok().flatten().map(|m| m.to_str()),
         "mic_mode": acc.mic_mode(handle).ok().flatten().map(|m| m.to_string()),
         "crown_rotation": acc.crown_rotation(handle).ok().flatten().map(|c| c.to_string()),
         "one_bud_anc": acc.one_bud_anc(handle).ok().flatten(),
         "auto_answer": acc.auto_answer(handle).ok().flatten(),
         "in_ear_detection": acc.in_ear_detection(handle).ok().flatten(),
         "volume_swipe_mode": acc.volume_swipe_mode(handle).ok().flatten(),
         "chime_volume": acc.chime_volume(handle).ok().flatten(),
         "switch_control_mode": acc.switch_control_mode(handle).ok().flatten(),
         "double_click_interval_ms": millis(acc.double_click_interval(handle)),
         "click_hold_interval_ms": millis(acc.click_hold_interval(handle)),
         "volume_swipe_interval_ms": millis(acc.volume_swipe_interval(handle)),
      }))
   }
}

#[interface(name = "org.btctl.Manager1")]
impl ControlService {
   // ---- registry ----

   async fn get_devices(&self) -> fdo::Result<String> {
      self.devices_json(self.session.registry().devices())
   }

   async fn get_paired_devices(&self) -> fdo::Result<String> {
      self.devices_json(self.session.registry().paired_devices())
   }

   async fn get_connected_devices(&self) -> fdo::Result<String> {
      self.devices_json(self.session.registry().connected_devices())
   }

   async fn get_device(&self, address: String) -> fdo::Result<String> {
      let handle = self.handle(&address)?;
      let info = self.session.registry().info(handle).map_err(fail)?;
      Ok(device_json(handle, &info).to_string())
   }

   async fn register_device(
      &self,
      address: String,
      name: String,
      class: u32,
      pincode: String,
   ) -> fdo::Result<u32> {
      let address: Address = parse("address", &address)?;
      let handle = self
         .session
         .registry()
         .register_device(address, &name, class, &pincode)
         .map_err(fail)?;
      info!("{address}: registered over D-Bus as {handle}");
      Ok(handle.get())
   }

   async fn forget(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.session.registry().forget(handle).map_err(fail)
   }

   async fn set_user_name(&self, address: String, name: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let name = (!name.is_empty()).then_some(name.as_str());
      self
         .session
         .registry()
         .set_user_name(handle, name)
         .map_err(fail)
   }

   async fn set_authorized_services(&self, address: String, services: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let services: ServiceMask = parse("service mask", &services)?;
      self
         .session
         .registry()
         .set_authorized_services(handle, services)
         .map_err(fail)
   }

   async fn set_sync_settings(&self, address: String, settings: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let settings: SyncSettings = parse("sync settings", &settings)?;
      self
         .session
         .registry()
         .set_sync_settings(handle, settings)
         .map_err(fail)
   }

   async fn set_hidden(&self, address: String, hidden: bool) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self
         .session
         .registry()
         .set_hidden(handle, hidden)
         .map_err(fail)
   }

   async fn connect_services(&self, address: String, services: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let services: ServiceMask = parse("service mask", &services)?;
      self
         .session
         .registry()
         .connect_services(handle, services)
         .map_err(fail)
   }

   async fn disconnect_services(&self, address: String, services: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let services: ServiceMask = parse("service mask", &services)?;
      self
         .session
         .registry()
         .disconnect_services(handle, services)
         .map_err(fail)
   }

   // ---- key exchange ----

   async fn generate_key(&self, address: String) -> fdo::Result<String> {
      let address: Address = parse("address", &address)?;
      let key = self
         .session
         .registry()
         .generate_key(address)
         .map_err(fail)?;
      Ok(hex::encode(key.as_bytes()))
   }

   async fn set_key(
      &self,
      address: String,
      name: String,
      class: u32,
      services: String,
      key: String,
   ) -> fdo::Result<u32> {
      let address: Address = parse("address", &address)?;
      let services: ServiceMask = parse("service mask", &services)?;
      let key = decode_key(&key)?;
      let handle = self
         .session
         .registry()
         .set_key(address, &name, class, services, key)
         .map_err(fail)?;
      Ok(handle.get())
   }

   async fn link_key(&self, address: String) -> fdo::Result<String> {
      let handle = self.handle(&address)?;
      let key = self.session.registry().link_key(handle).map_err(fail)?;
      Ok(hex::encode(key.as_bytes()))
   }

   // ---- discovery ----

   async fn start_scan(&self, mode: String, filter: String) -> fdo::Result<()> {
      let mode: DiscoveryMode = parse("discovery mode", &mode)?;
      let filter: ServiceMask = parse("service mask", &filter)?;
      self.discovery.start_scan(mode, filter).map_err(fail)
   }

   async fn start_advertised_scan(&self) -> fdo::Result<()> {
      self.discovery.start_advertised_scan().map_err(fail)
   }

   async fn stop_scan(&self) -> fdo::Result<()> {
      self.discovery.stop_scan().map_err(fail)
   }

   async fn add_discovery_key(&self, key: String) -> fdo::Result<()> {
      let key = decode_hex("key", &key)?;
      self.discovery.add_key(&key).map_err(fail)
   }

   async fn remove_discovery_key(&self, key: String) -> fdo::Result<bool> {
      let key = decode_hex("key", &key)?;
      self.discovery.remove_key(&key).map_err(fail)
   }

   async fn query_device(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.discovery.query_device(handle).map_err(fail)
   }

   async fn cancel_query(&self) -> fdo::Result<()> {
      self.discovery.cancel_query().map_err(fail)
   }

   async fn get_discovered_devices(&self) -> fdo::Result<String> {
      self.devices_json(self.discovery.devices())
   }

   // ---- pairing ----

   async fn start_pairing_agent(&self) -> fdo::Result<()> {
      self.pairing.start().map_err(fail)
   }

   async fn stop_pairing_agent(&self) -> fdo::Result<()> {
      self.pairing.stop().map_err(fail)
   }

   async fn set_io_capability(&self, capability: String) -> fdo::Result<()> {
      let capability: IoCapability = parse("I/O capability", &capability)?;
      self.pairing.set_io_capability(capability).map_err(fail)
   }

   async fn pair(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.pairing.pair(handle).map_err(fail)
   }

   async fn cancel_pairing(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.pairing.cancel_pairing(handle).map_err(fail)
   }

   async fn set_pincode(&self, address: String, pincode: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.pairing.set_pincode(handle, &pincode).map_err(fail)
   }

   async fn confirm(&self, address: String, accept: bool) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let response = if accept {
         SspResponse::Accept
      } else {
         SspResponse::Reject
      };
      self.pairing.accept_ssp(handle, response).map_err(fail)
   }

   async fn reply_authorization(&self, address: String, granted: bool) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self
         .pairing
         .reply_authorization(handle, granted)
         .map_err(fail)
   }

   /// `data` is a JSON object with optional `p192` and `p256` pairs.
   async fn set_oob_data(&self, address: String, data: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let data: OobData = serde_json::from_str(&data)
         .map_err(|e| fdo::Error::InvalidArgs(format!("Invalid OOB data: {e}")))?;
      self.pairing.set_oob_data(handle, data).map_err(fail)
   }

   async fn clear_oob_data(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.pairing.clear_oob_data(handle).map_err(fail)
   }

   async fn read_local_oob_data(&self) -> fdo::Result<()> {
      self.pairing.read_local_oob_data().map_err(fail)
   }

   async fn delete_paired_device(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.pairing.delete_paired_device(handle).map_err(fail)
   }

   // ---- accessories ----

   async fn register_accessory(
      &self,
      address: String,
      name: String,
      class: u32,
      pincode: String,
   ) -> fdo::Result<u32> {
      let address: Address = parse("address", &address)?;
      let handle = self
         .session
         .accessory_manager()
         .register_device(address, &name, class, &pincode)
         .map_err(fail)?;
      Ok(handle.get())
   }

   async fn unregister_accessory(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self
         .session
         .accessory_manager()
         .unregister_device(handle)
         .map_err(fail)
   }

   async fn get_accessories(&self) -> fdo::Result<String> {
      let handles = self.session.accessory_manager().devices().map_err(fail)?;
      let accessories = handles
         .into_iter()
         .map(|h| self.accessory_json(h))
         .collect::<fdo::Result<Vec<_>>>()?;
      Ok(Value::Array(accessories).to_string())
   }

   async fn get_accessory(&self, address: String) -> fdo::Result<String> {
      let handle = self.handle(&address)?;
      Ok(self.accessory_json(handle)?.to_string())
   }

   async fn get_accessory_settings(&self, address: String) -> fdo::Result<String> {
      let handle = self.handle(&address)?;
      Ok(self.settings_json(handle)?.to_string())
   }

   async fn plug_in(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.session.accessory_manager().plug_in(handle).map_err(fail)
   }

   async fn unplug(&self, address: String) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      self.session.accessory_manager().unplug(handle).map_err(fail)
   }

   async fn send_control(&self, address: String, control: String, value: u32) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let control: ControlType = parse("control", &control)?;
      self
         .session
         .accessory_manager()
         .send_control(handle, control, value)
         .map_err(fail)?;
      info!("{address}: {control} set to {value}");
      Ok(())
   }

   async fn get_control(&self, address: String, control: String, subtype: u16) -> fdo::Result<u32> {
      let handle = self.handle(&address)?;
      let control: ControlType = parse("control", &control)?;
      let accessories = self.session.accessory_manager();
      accessories
         .get_control(handle, control, subtype)
         .await
         .map_err(fail)
   }

   async fn send_custom_message(
      &self,
      address: String,
      channel: String,
      payload: String,
   ) -> fdo::Result<()> {
      let handle = self.handle(&address)?;
      let channel: CustomMessageType = parse("custom message type", &channel)?;
      let payload = decode_hex("payload", &payload)?;
      self
         .session
         .accessory_manager()
         .send_custom_message(handle, channel, &payload)
         .map_err(fail)
   }

   // Signals
   #[zbus(signal)]
   pub async fn session_event(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_event(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pairing_event(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn service_event(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn accessory_event(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;

   // Properties
   #[zbus(property)]
   async fn state(&self) -> String {
      self.session.state().to_string()
   }

   #[zbus(property)]
   async fn scanning(&self) -> bool {
      self.discovery.is_scanning()
   }

   #[zbus(property)]
   async fn pairing_agent_state(&self) -> String {
      self.pairing.state().to_string()
   }

   #[zbus(property)]
   async fn io_capability(&self) -> String {
      self.pairing.io_capability().to_string()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      accessory::AccessoryState,
      pairing::{PairingPhase, PairingResult},
      testing,
   };

   const PEER: &str = "00:11:22:33:44:55";

   async fn service(name: &str) -> (ControlService, tokio::sync::mpsc::UnboundedReceiver<Signal>) {
      let (session, _transport, _rx) = testing::attach_memory(name).await;
      let (signals, rx) = testing::collector::<Signal>();
      (ControlService::new(session, &signals), rx)
   }

   #[tokio::test]
   async fn test_register_and_list_devices() {
      let (service, _rx) = service("dbus-register").await;
      let raw = service
         .register_device(PEER.into(), "Speaker".into(), 0x240404, "0000".into())
         .await
         .unwrap();
      assert_ne!(raw, 0);

      let devices: Value = serde_json::from_str(&service.get_devices().await.unwrap()).unwrap();
      assert_eq!(devices[0]["address"], PEER);
      assert_eq!(devices[0]["name"], "Speaker");
      assert_eq!(devices[0]["paired"], false);
      assert_eq!(service.get_paired_devices().await.unwrap(), "[]");

      service
         .set_user_name(PEER.into(), "Kitchen".into())
         .await
         .unwrap();
      let device: Value = serde_json::from_str(&service.get_device(PEER.into()).await.unwrap()).unwrap();
      assert_eq!(device["name"], "Kitchen");
   }

   #[tokio::test]
   async fn test_key_exchange() {
      let (service, _rx) = service("dbus-keys").await;
      let key = service.generate_key(PEER.into()).await.unwrap();
      assert_eq!(key.len(), LinkKey::LEN * 2);
      assert!(matches!(
         service.link_key(PEER.into()).await,
         Err(fdo::Error::InvalidArgs(_) | fdo::Error::Failed(_))
      ));
      assert!(matches!(
         service
            .set_key(PEER.into(), "Phone".into(), 0, "handsfree".into(), "abcd".into())
            .await,
         Err(fdo::Error::InvalidArgs(_))
      ));

      let raw = service
         .set_key(PEER.into(), "Phone".into(), 0x5A020C, "handsfree".into(), key.clone())
         .await
         .unwrap();
      assert_ne!(raw, 0);
      assert_eq!(service.link_key(PEER.into()).await.unwrap(), key);
      let device: Value = serde_json::from_str(&service.get_device(PEER.into()).await.unwrap()).unwrap();
      assert_eq!(device["name"], "Phone");
   }

   #[tokio::test]
   async fn test_accessory_settings() {
      let (session, transport, _events) = testing::attach_memory("dbus-settings").await;
      transport.respond(true);
      let (signals, mut rx) = testing::collector::<Signal>();
      let service = ControlService::new(session, &signals);
      service
         .register_accessory(PEER.into(), "Buds".into(), 0x240418, String::new())
         .await
         .unwrap();
      service.plug_in(PEER.into()).await.unwrap();
      loop {
         if let Signal::Accessory(AccessoryEvent::StateChanged {
            state: AccessoryState::PluggedIn,
            ..
         }) = testing::recv(&mut rx).await
         {
            break;
         }
      }

      service
         .send_control(PEER.into(), "mic_mode".into(), 2)
         .await
         .unwrap();
      service
         .send_control(PEER.into(), "double_click_interval".into(), 300)
         .await
         .unwrap();
      let settings: Value =
         serde_json::from_str(&service.get_accessory_settings(PEER.into()).await.unwrap()).unwrap();
      assert_eq!(settings["mic_mode"], "fixed_left");
      assert_eq!(settings["double_click_interval_ms"], 300);
      assert!(settings["chime_volume"].is_null());

      assert!(service.get_accessory_settings("00:00:00:00:00:01".into()).await.is_err());
   }

   #[tokio::test]
   async fn test_invalid_arguments() {
      let (service, _rx) = service("dbus-args").await;
      assert!(matches!(
         service.get_device("not an address".into()).await,
         Err(fdo::Error::InvalidArgs(_))
      ));
      assert!(matches!(
         service.start_scan("sometimes".into(), String::new()).await,
         Err(fdo::Error::InvalidArgs(_))
      ));
      assert!(matches!(
         service.set_io_capability("telepathy".into()).await,
         Err(fdo::Error::InvalidArgs(_))
      ));
   }

   #[tokio::test]
   async fn test_agent_events_are_forwarded() {
      let (service, mut rx) = service("dbus-agent").await;
      service.start_pairing_agent().await.unwrap();
      let signal = testing::recv(&mut rx).await;
      assert!(matches!(signal, Signal::Pairing(PairingEvent::AgentStarted)));
      assert_eq!(signal.to_json()["event"], "agent_started");
   }

   #[test]
   fn test_signal_json() {
      let device = DeviceHandle::from_raw(7).unwrap();
      let signal = Signal::Pairing(PairingEvent::AttemptComplete {
         device,
         result: PairingResult::Timeout(PairingPhase::DhKeyCheck),
      });
      let json = signal.to_json();
      assert_eq!(json["device"], 7);
      assert_eq!(json["code"], 173);

      let signal = Signal::Pairing(PairingEvent::UserConfirmation {
         device,
         value: 1234,
         mitm: true,
      });
      assert_eq!(signal.to_json()["value"], "001234");

      let signal = Signal::Service(ServiceEvent::Connected {
         device,
         services: ServiceMask::A2DP | ServiceMask::HANDSFREE,
      });
      let json = signal.to_json();
      assert_eq!(json["event"], "connected");
      assert_eq!(json["services"], "handsfree|a2dp");
   }
}
