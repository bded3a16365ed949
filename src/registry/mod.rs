//! Device registry.
//!
//! Single source of truth for known devices: attributes, policy masks,
//! pairing state and link keys. Every other component reads and writes
//! device state through here.

pub mod device;
pub mod store;

use std::{
   collections::{BTreeMap, HashMap},
   num::NonZeroU32,
   sync::Arc,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use uuid::Uuid;

pub use self::device::{
   CapabilityLevel, DeviceHandle, DeviceId, DeviceInfo, DeviceRecord, DeviceType, LinkKey,
   MAX_NAME_LEN, Provenance, sync_group,
};
use self::store::{DeviceStore, StoredDevice};
use crate::{
   address::Address,
   error::{Error, Result},
   event::{Registrations, Sink, Subscription},
   services::{DeviceAttributes, ServiceMask, SyncSettings},
   session::Shared,
   transport::InquiryResult,
};

/// Connection-level change on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
   Connected { device: DeviceHandle, services: ServiceMask },
   Disconnected { device: DeviceHandle, services: ServiceMask },
   /// Inbound connection of services the device is not authorized for.
   Refused { device: DeviceHandle, services: ServiceMask },
}

impl ServiceEvent {
   pub const fn device(&self) -> DeviceHandle {
      match *self {
         Self::Connected { device, .. }
         | Self::Disconnected { device, .. }
         | Self::Refused { device, .. } => device,
      }
   }

   pub const fn services(&self) -> ServiceMask {
      match *self {
         Self::Connected { services, .. }
         | Self::Disconnected { services, .. }
         | Self::Refused { services, .. } => services,
      }
   }
}

/// Copies `items` into a caller buffer, reporting the full count either way.
pub(crate) fn copy_into<T: Copy>(items: &[T], out: &mut [T]) -> Result<usize> {
   if items.len() > out.len() {
      return Err(Error::BufferTooSmall {
         available: items.len(),
      });
   }
   out[..items.len()].copy_from_slice(items);
   Ok(items.len())
}

struct Inner {
   records: BTreeMap<DeviceHandle, DeviceRecord>,
   by_address: HashMap<Address, DeviceHandle>,
   by_identifier: HashMap<Uuid, DeviceHandle>,
   next: NonZeroU32,
}

impl Inner {
   fn lookup(&self, handle: DeviceHandle) -> Result<&DeviceRecord> {
      self.records.get(&handle).ok_or(Error::InvalidHandle)
   }

   fn lookup_mut(&mut self, handle: DeviceHandle) -> Result<&mut DeviceRecord> {
      self.records.get_mut(&handle).ok_or(Error::InvalidHandle)
   }

   fn insert(&mut self, record: DeviceRecord) -> DeviceHandle {
      let handle = DeviceHandle::new(self.next);
      self.next = self.next.saturating_add(1);
      self.by_address.insert(record.info.address, handle);
      if let Some(id) = record.info.identifier {
         self.by_identifier.insert(id, handle);
      }
      self.records.insert(handle, record);
      handle
   }

   fn ensure(&mut self, address: Address) -> (DeviceHandle, bool) {
      match self.by_address.get(&address) {
         Some(&h) => (h, false),
         None => (self.insert(DeviceRecord::new(address)), true),
      }
   }

   fn handles(&self, keep: impl Fn(&DeviceInfo) -> bool) -> Vec<DeviceHandle> {
      self
         .records
         .iter()
         .filter(|(_, r)| keep(&r.info))
         .map(|(h, _)| *h)
         .collect()
   }
}

/// Known devices of one session.
pub struct Registry {
   shared: Arc<Shared>,
   store: Option<DeviceStore>,
   inner: Mutex<Inner>,
   listeners: Registrations<ServiceMask, ServiceEvent>,
}

impl Registry {
   pub(crate) fn new(shared: Arc<Shared>, store: Option<DeviceStore>) -> Self {
      Self {
         shared,
         store,
         inner: Mutex::new(Inner {
            records: BTreeMap::new(),
            by_address: HashMap::new(),
            by_identifier: HashMap::new(),
            next: NonZeroU32::MIN,
         }),
         listeners: Registrations::new(),
      }
   }

   /// Loads persisted devices. Connection state always starts empty.
   pub(crate) fn load(&self) -> Result<()> {
      let Some(store) = &self.store else {
         return Ok(());
      };
      let stored = store.load_all()?;
      let mut inner = self.inner.lock();
      for device in stored {
         if inner.by_address.contains_key(&device.address) {
            continue;
         }
         inner.insert(device.into());
      }
      info!("Registry loaded {} devices", inner.records.len());
      Ok(())
   }

   fn persist(&self, record: &DeviceRecord) -> Result<()> {
      if let Some(store) = &self.store {
         store.put(&StoredDevice::from(record))?;
      }
      Ok(())
   }

   fn read<T>(&self, handle: DeviceHandle, f: impl FnOnce(&DeviceRecord) -> T) -> Result<T> {
      self.shared.ensure_attached()?;
      Ok(f(self.inner.lock().lookup(handle)?))
   }

   /// Applies a policy change and writes the record through to the store.
   fn update<T>(
      &self,
      handle: DeviceHandle,
      f: impl FnOnce(&mut DeviceRecord) -> Result<T>,
   ) -> Result<T> {
      self.shared.ensure_attached()?;
      let mut inner = self.inner.lock();
      let record = inner.lookup_mut(handle)?;
      let out = f(record)?;
      self.persist(record)?;
      Ok(out)
   }

   fn post_service_event(&self, event: ServiceEvent) {
      let services = event.services();
      let sinks = self
         .listeners
         .matching(|filter| services.matches_filter(*filter));
      self.shared.queue.post_all(sinks, event);
   }

   // ---- resolution ----

   pub fn handle_for_address(&self, address: Address) -> Result<DeviceHandle> {
      self.shared.ensure_attached()?;
      self
         .inner
         .lock()
         .by_address
         .get(&address)
         .copied()
         .ok_or_else(|| Error::DeviceNotFound(address.to_string().into()))
   }

   pub fn handle_for_identifier(&self, identifier: &Uuid) -> Result<DeviceHandle> {
      self.shared.ensure_attached()?;
      self
         .inner
         .lock()
         .by_identifier
         .get(identifier)
         .copied()
         .ok_or_else(|| Error::DeviceNotFound(identifier.to_string().into()))
   }

   // ---- getters ----

   /// Snapshot of the device's attributes.
   pub fn info(&self, handle: DeviceHandle) -> Result<DeviceInfo> {
      self.read(handle, |r| r.info.clone())
   }

   pub fn address(&self, handle: DeviceHandle) -> Result<Address> {
      self.read(handle, |r| r.info.address)
   }

   pub fn identifier(&self, handle: DeviceHandle) -> Result<Option<Uuid>> {
      self.read(handle, |r| r.info.identifier)
   }

   /// Name shown to users: user name, else peer name, else the type's default.
   pub fn name(&self, handle: DeviceHandle) -> Result<SmolStr> {
      self.read(handle, |r| SmolStr::new(r.info.display_name()))
   }

   pub fn default_name(&self, handle: DeviceHandle) -> Result<&'static str> {
      self.read(handle, |r| r.info.device_type().default_name())
   }

   pub fn device_type(&self, handle: DeviceHandle) -> Result<DeviceType> {
      self.read(handle, |r| r.info.device_type())
   }

   pub fn class(&self, handle: DeviceHandle) -> Result<u32> {
      self.read(handle, |r| r.info.class)
   }

   pub fn device_id(&self, handle: DeviceHandle) -> Result<Option<DeviceId>> {
      self.read(handle, |r| r.info.device_id)
   }

   pub fn capability(&self, handle: DeviceHandle, role: ServiceMask) -> Result<CapabilityLevel> {
      self.read(handle, |r| r.info.capability(role))
   }

   pub fn battery_level(&self, handle: DeviceHandle) -> Result<Option<u8>> {
      self.read(handle, |r| r.info.battery_level)
   }

   pub fn color(&self, handle: DeviceHandle) -> Result<Option<u32>> {
      self.read(handle, |r| r.info.color)
   }

   pub fn pairing_status(&self, handle: DeviceHandle) -> Result<bool> {
      self.read(handle, |r| r.info.paired)
   }

   pub fn provenance(&self, handle: DeviceHandle) -> Result<Provenance> {
      self.read(handle, |r| r.info.provenance)
   }

   pub fn is_cloud_paired(&self, handle: DeviceHandle) -> Result<bool> {
      self.read(handle, |r| r.info.is_cloud_paired())
   }

   pub fn is_magic_paired(&self, handle: DeviceHandle) -> Result<bool> {
      self.read(handle, |r| r.info.is_magic_paired())
   }

   pub fn is_temporary_paired(&self, handle: DeviceHandle) -> Result<bool> {
      self.read(handle, |r| r.info.is_temporary_paired())
   }

   pub fn supported_services(&self, handle: DeviceHandle) -> Result<ServiceMask> {
      self.read(handle, |r| r.info.supported)
   }

   pub fn authorized_services(&self, handle: DeviceHandle) -> Result<ServiceMask> {
      self.read(handle, |r| r.info.authorized)
   }

   pub fn connected_services(&self, handle: DeviceHandle) -> Result<ServiceMask> {
      self.read(handle, |r| r.info.connected)
   }

   pub fn sync_settings(&self, handle: DeviceHandle) -> Result<SyncSettings> {
      self.read(handle, |r| r.info.sync_settings)
   }

   pub fn sync_groups(&self, handle: DeviceHandle) -> Result<Vec<i32>> {
      self.read(handle, |r| r.info.sync_groups.clone())
   }

   pub fn is_hidden(&self, handle: DeviceHandle) -> Result<bool> {
      self.read(handle, |r| r.info.hidden)
   }

   // ---- policy setters ----

   /// Sets or clears (`None` or empty) the user-assigned name.
   pub fn set_user_name(&self, handle: DeviceHandle, name: Option<&str>) -> Result<()> {
      let name = name.map(str::trim).filter(|n| !n.is_empty());
      if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
         return Err(Error::InvalidArgument("name longer than 248 bytes"));
      }
      self.update(handle, |r| {
         r.info.user_name = name.map(SmolStr::new);
         Ok(())
      })
   }

   /// Updates the sync policy. `SUPPORTS_SYNC` reflects the device and is not settable.
   pub fn set_sync_settings(&self, handle: DeviceHandle, settings: SyncSettings) -> Result<()> {
      self.update(handle, |r| {
         let supports = r.info.sync_settings & SyncSettings::SUPPORTS_SYNC;
         if supports.is_empty() && settings.intersects(SyncSettings::SYNC_ENABLED) {
            return Err(Error::NotSupported("contact sync"));
         }
         r.info.sync_settings = (settings - SyncSettings::SUPPORTS_SYNC) | supports;
         Ok(())
      })
   }

   /// Enables or disables one sync group. `sync_group::ALL` and `NONE` replace the whole set.
   pub fn set_sync_group(&self, handle: DeviceHandle, group: i32, enabled: bool) -> Result<()> {
      if group < 0 && group != sync_group::ALL && group != sync_group::NONE {
         return Err(Error::InvalidArgument("reserved sync group"));
      }
      self.update(handle, |r| {
         let groups = &mut r.info.sync_groups;
         match (group, enabled) {
            (sync_group::ALL, true) => *groups = vec![sync_group::ALL],
            (sync_group::ALL, false) | (sync_group::NONE, _) => *groups = vec![sync_group::NONE],
            (g, true) => {
               groups.retain(|x| *x >= 0);
               if !groups.contains(&g) {
                  groups.push(g);
               }
            },
            (g, false) => groups.retain(|x| *x >= 0 && *x != g),
         }
         Ok(())
      })
   }

   /// Replaces the authorized set. Live connections outside it are dropped before returning.
   /// A failed store write is reported only after the drop has been requested.
   pub fn set_authorized_services(&self, handle: DeviceHandle, services: ServiceMask) -> Result<()> {
      self.shared.ensure_attached()?;
      let (address, dropped, persisted) = {
         let mut inner = self.inner.lock();
         let record = inner.lookup_mut(handle)?;
         record.info.authorized = services;
         let dropped = record.info.connected - services;
         record.info.connected &= services;
         (record.info.address, dropped, self.persist(record))
      };
      if !dropped.is_empty() {
         info!("{address}: authorization narrowed, disconnecting {dropped}");
         self.post_service_event(ServiceEvent::Disconnected {
            device: handle,
            services: dropped,
         });
         self.shared.transport.disconnect(address, dropped)?;
      }
      if let Err(e) = &persisted {
         warn!("{address}: failed to persist authorization: {e}");
      }
      persisted
   }

   pub fn set_hidden(&self, handle: DeviceHandle, hidden: bool) -> Result<()> {
      self.update(handle, |r| {
         r.info.hidden = hidden;
         Ok(())
      })
   }

   // ---- key exchange ----

   /// Fresh random key for exchange with `address`; nothing is stored.
   pub fn generate_key(&self, address: Address) -> Result<LinkKey> {
      self.shared.ensure_attached()?;
      debug!("{address}: generated link key");
      Ok(LinkKey::generate())
   }

   /// Stores a provisional key, creating the device if needed.
   pub fn set_key(
      &self,
      address: Address,
      name: &str,
      class: u32,
      services: ServiceMask,
      key: LinkKey,
   ) -> Result<DeviceHandle> {
      self.shared.ensure_attached()?;
      if name.len() > MAX_NAME_LEN {
         return Err(Error::InvalidArgument("name longer than 248 bytes"));
      }
      let mut inner = self.inner.lock();
      let (handle, _) = inner.ensure(address);
      let record = inner.lookup_mut(handle)?;
      if !name.is_empty() {
         record.info.name = Some(SmolStr::new(name));
      }
      if class != 0 {
         record.info.class = class;
      }
      record.info.supported |= services;
      record.info.authorized |= services;
      record.key = Some(key);
      self.persist(record)?;
      info!("{address}: provisional key stored");
      Ok(handle)
   }

   pub fn link_key(&self, handle: DeviceHandle) -> Result<LinkKey> {
      self.shared.ensure_attached()?;
      let inner = self.inner.lock();
      let record = inner.lookup(handle)?;
      record
         .key
         .clone()
         .ok_or(Error::KeyNotFound(record.info.address))
   }

   /// Registers a device with a pincode used to answer its PIN requests.
   pub fn register_device(
      &self,
      address: Address,
      name: &str,
      class: u32,
      pincode: &str,
   ) -> Result<DeviceHandle> {
      self.shared.ensure_attached()?;
      if name.len() > MAX_NAME_LEN {
         return Err(Error::InvalidArgument("name longer than 248 bytes"));
      }
      crate::pairing::validate_pincode(pincode, 0)?;
      let mut inner = self.inner.lock();
      let (handle, _) = inner.ensure(address);
      let record = inner.lookup_mut(handle)?;
      if record.info.paired {
         return Err(Error::AlreadyRegistered(address));
      }
      if !name.is_empty() {
         record.info.name = Some(SmolStr::new(name));
      }
      record.info.class = class;
      record.pincode = Some(SmolStr::new(pincode));
      self.persist(record)?;
      info!("{address}: registered");
      Ok(handle)
   }

   /// Removes the device and erases its key material before returning.
   pub fn forget(&self, handle: DeviceHandle) -> Result<()> {
      self.shared.ensure_attached()?;
      let record = {
         let mut inner = self.inner.lock();
         let address = inner.lookup(handle)?.info.address;
         // Memory is only touched once the stored key material is gone.
         if let Some(store) = &self.store {
            store.delete(address)?;
         }
         let record = inner.records.remove(&handle).ok_or(Error::InvalidHandle)?;
         inner.by_address.remove(&address);
         if let Some(id) = record.info.identifier {
            inner.by_identifier.remove(&id);
         }
         record
      };
      let address = record.info.address;
      info!("{address}: forgotten");
      if !record.info.connected.is_empty() {
         self.shared.transport.disconnect(address, record.info.connected)?;
      }
      if record.info.paired {
         self.shared.transport.remove_bond(address)?;
      }
      Ok(())
   }

   // ---- connections ----

   pub fn connect_services(&self, handle: DeviceHandle, services: ServiceMask) -> Result<()> {
      let (address, authorized) = self.read(handle, |r| (r.info.address, r.info.authorized))?;
      let denied = services - authorized;
      if !denied.is_empty() {
         return Err(Error::ServiceNotAuthorized(denied));
      }
      debug!("{address}: connecting {services}");
      self.shared.transport.connect(address, services)
   }

   pub fn disconnect_services(&self, handle: DeviceHandle, services: ServiceMask) -> Result<()> {
      let address = self.address(handle)?;
      debug!("{address}: disconnecting {services}");
      self.shared.transport.disconnect(address, services)
   }

   pub fn add_service_listener(
      &self,
      filter: ServiceMask,
      sink: Sink<ServiceEvent>,
   ) -> Subscription {
      self.listeners.add(filter, sink)
   }

   // ---- enumeration ----

   pub fn devices_into(&self, out: &mut [DeviceHandle]) -> Result<usize> {
      copy_into(&self.devices()?, out)
   }

   pub fn devices(&self) -> Result<Vec<DeviceHandle>> {
      self.shared.ensure_attached()?;
      Ok(self.inner.lock().handles(|_| true))
   }

   /// Paired devices that are not hidden.
   pub fn paired_devices_into(&self, out: &mut [DeviceHandle]) -> Result<usize> {
      copy_into(&self.paired_devices()?, out)
   }

   pub fn paired_devices(&self) -> Result<Vec<DeviceHandle>> {
      self.shared.ensure_attached()?;
      Ok(self.inner.lock().handles(|i| i.paired && !i.hidden))
   }

   pub fn connected_devices_into(&self, out: &mut [DeviceHandle]) -> Result<usize> {
      copy_into(&self.connected_devices()?, out)
   }

   pub fn connected_devices(&self) -> Result<Vec<DeviceHandle>> {
      self.shared.ensure_attached()?;
      Ok(self.inner.lock().handles(|i| !i.connected.is_empty()))
   }

   // ---- internal updates ----

   pub(crate) fn lookup_address(&self, address: Address) -> Option<DeviceHandle> {
      self.inner.lock().by_address.get(&address).copied()
   }

   pub(crate) fn ensure_device(&self, address: Address) -> DeviceHandle {
      self.inner.lock().ensure(address).0
   }

   pub(crate) fn snapshot(&self, handle: DeviceHandle) -> Option<DeviceInfo> {
      self.inner.lock().records.get(&handle).map(|r| r.info.clone())
   }

   pub(crate) fn pincode(&self, handle: DeviceHandle) -> Option<SmolStr> {
      self.inner.lock().records.get(&handle)?.pincode.clone()
   }

   /// Merges inquiry data. Never touches the user name.
   pub(crate) fn observe_inquiry(&self, result: &InquiryResult) -> (DeviceHandle, DeviceAttributes) {
      let mut inner = self.inner.lock();
      let (handle, _) = inner.ensure(result.address);
      let Ok(record) = inner.lookup_mut(handle) else {
         return (handle, DeviceAttributes::empty());
      };
      let info = &mut record.info;
      let mut changed = DeviceAttributes::empty();
      if result.class != 0 && result.class != info.class {
         let before = info.device_type();
         info.class = result.class;
         changed |= DeviceAttributes::DEVICE_TYPE;
         if info.device_type() != before {
            changed |= DeviceAttributes::DEFAULT_NAME;
         }
      }
      if let Some(name) = &result.name
         && info.name.as_ref() != Some(name)
      {
         info.name = Some(name.clone());
         changed |= DeviceAttributes::NAME;
      }
      changed |= merge_services(info, result.services);
      if result.device_id.is_some() && result.device_id != info.device_id {
         info.device_id = result.device_id;
         changed |= DeviceAttributes::CAPABILITIES;
      }
      info.rssi = result.rssi;
      (handle, changed)
   }

   /// Merges a completed name/service query.
   pub(crate) fn apply_query(
      &self,
      handle: DeviceHandle,
      name: Option<&SmolStr>,
      services: ServiceMask,
   ) -> DeviceAttributes {
      let mut inner = self.inner.lock();
      let Ok(record) = inner.lookup_mut(handle) else {
         return DeviceAttributes::empty();
      };
      let mut changed = merge_services(&mut record.info, services);
      if let Some(name) = name
         && record.info.name.as_ref() != Some(name)
      {
         record.info.name = Some(name.clone());
         changed |= DeviceAttributes::NAME;
      }
      if !changed.is_empty() && record.info.paired {
         let _ = self
            .persist(record)
            .inspect_err(|e| warn!("Failed to persist {}: {e}", record.info.address));
      }
      changed
   }

   /// Records live connections. Services outside the authorized set are refused.
   pub(crate) fn apply_connected(
      &self,
      address: Address,
      services: ServiceMask,
   ) -> (DeviceHandle, ServiceMask) {
      let (handle, accepted, refused) = {
         let mut inner = self.inner.lock();
         let (handle, _) = inner.ensure(address);
         match inner.lookup_mut(handle) {
            Ok(record) => {
               let info = &mut record.info;
               let accepted = services & info.authorized;
               let refused = services - info.authorized;
               info.supported |= services;
               info.connected |= accepted;
               (handle, accepted, refused)
            },
            Err(_) => (handle, ServiceMask::empty(), services),
         }
      };
      if !refused.is_empty() {
         warn!("{address}: refusing unauthorized services {refused}");
         self.post_service_event(ServiceEvent::Refused {
            device: handle,
            services: refused,
         });
         if let Err(e) = self.shared.transport.disconnect(address, refused) {
            warn!("{address}: failed to drop refused services: {e}");
         }
      }
      if !accepted.is_empty() {
         info!("{address}: connected {accepted}");
         self.post_service_event(ServiceEvent::Connected {
            device: handle,
            services: accepted,
         });
      }
      (handle, accepted)
   }

   pub(crate) fn apply_disconnected(
      &self,
      address: Address,
      services: ServiceMask,
   ) -> Option<(DeviceHandle, ServiceMask)> {
      let (handle, removed) = {
         let mut inner = self.inner.lock();
         let handle = *inner.by_address.get(&address)?;
         let record = inner.lookup_mut(handle).ok()?;
         let removed = record.info.connected & services;
         record.info.connected -= removed;
         (handle, removed)
      };
      if !removed.is_empty() {
         info!("{address}: disconnected {removed}");
         self.post_service_event(ServiceEvent::Disconnected {
            device: handle,
            services: removed,
         });
      }
      Some((handle, removed))
   }

   /// Marks the device paired. A `None` key keeps the provisional one.
   pub(crate) fn store_pairing(
      &self,
      handle: DeviceHandle,
      key: Option<LinkKey>,
      provenance: Provenance,
   ) -> Result<()> {
      let mut inner = self.inner.lock();
      let record = inner.lookup_mut(handle)?;
      if let Some(key) = key {
         record.key = Some(key);
      }
      let info = &mut record.info;
      info.paired = true;
      info.provenance = provenance;
      info.authorized |= info.supported;
      let new_identifier = match (provenance, info.identifier) {
         (Provenance::Cloud, None) => Some(Uuid::new_v4()),
         _ => None,
      };
      if let Some(id) = new_identifier {
         info.identifier = Some(id);
      }
      self.persist(record)?;
      if let Some(id) = new_identifier {
         inner.by_identifier.insert(id, handle);
      }
      Ok(())
   }

   /// Purges key material and pairing flags. No-op when not paired.
   pub(crate) fn unpair(&self, handle: DeviceHandle) -> Result<bool> {
      let mut inner = self.inner.lock();
      let record = inner.lookup_mut(handle)?;
      let was_paired = record.info.paired || record.key.is_some();
      record.key = None;
      record.info.paired = false;
      record.info.provenance = Provenance::Normal;
      self.persist(record)?;
      Ok(was_paired)
   }

   pub(crate) fn set_battery_level(&self, handle: DeviceHandle, level: Option<u8>) {
      if let Some(record) = self.inner.lock().records.get_mut(&handle) {
         record.info.battery_level = level;
      }
   }

   /// Adopts a name reported by the peer. Returns whether it changed.
   pub(crate) fn update_name_from_peer(&self, handle: DeviceHandle, name: &SmolStr) -> bool {
      let mut inner = self.inner.lock();
      let Some(record) = inner.records.get_mut(&handle) else {
         return false;
      };
      if record.info.name.as_ref() == Some(name) {
         return false;
      }
      record.info.name = Some(name.clone());
      if record.info.paired {
         let _ = self
            .persist(record)
            .inspect_err(|e| warn!("Failed to persist {}: {e}", record.info.address));
      }
      true
   }

   pub(crate) fn set_accessory(&self, handle: DeviceHandle, accessory: bool) -> Result<()> {
      let mut inner = self.inner.lock();
      let record = inner.lookup_mut(handle)?;
      if record.info.accessory != accessory {
         record.info.accessory = accessory;
         self.persist(record)?;
      }
      Ok(())
   }

   /// Adds `services` to both the supported and authorized sets.
   pub(crate) fn grant_services(&self, handle: DeviceHandle, services: ServiceMask) -> Result<()> {
      let mut inner = self.inner.lock();
      let record = inner.lookup_mut(handle)?;
      let info = &mut record.info;
      if info.authorized.contains(services) && info.supported.contains(services) {
         return Ok(());
      }
      info.supported |= services;
      info.authorized |= services;
      self.persist(record)
   }

   /// Drops live connection state after the transport went away.
   pub(crate) fn reset_connections(&self) {
      for record in self.inner.lock().records.values_mut() {
         record.info.connected = ServiceMask::empty();
         record.info.rssi = None;
      }
   }
}

fn merge_services(info: &mut DeviceInfo, services: ServiceMask) -> DeviceAttributes {
   if info.supported.contains(services) {
      return DeviceAttributes::empty();
   }
   info.supported |= services;
   if services.contains(ServiceMask::PHONEBOOK) {
      info.sync_settings |= SyncSettings::SUPPORTS_SYNC;
   }
   DeviceAttributes::CAPABILITIES | DeviceAttributes::ROLES
}
