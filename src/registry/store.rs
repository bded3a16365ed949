//! Persistent device store using heed (LMDB).
//!
//! Holds one record per known device, keyed by address: names, policy
//! masks, pairing state and the link key. Live connection state is never
//! written.

use std::{
   borrow::Cow,
   collections::HashMap,
   path::{Path, PathBuf},
   sync::{Arc, LazyLock},
};

use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

use super::device::{DeviceId, DeviceInfo, DeviceRecord, LinkKey, Provenance};
use crate::{
   address::Address,
   services::{ServiceMask, SyncSettings},
};

/// Errors that can occur in device store operations.
#[derive(Error, Debug)]
pub enum StoreError {
   #[error("Failed to create store directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[cfg(test)]
   #[error("Writes disabled")]
   WritesDisabled,
}

type Result<T> = std::result::Result<T, StoreError>;

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = Address;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = Address;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid address",
         )));
      };
      Ok(Address(s))
   }
}

/// On-disk form of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
   pub address: Address,
   pub identifier: Option<Uuid>,
   pub name: Option<SmolStr>,
   pub user_name: Option<SmolStr>,
   pub class: u32,
   pub device_id: Option<DeviceId>,
   pub supported: ServiceMask,
   pub authorized: ServiceMask,
   pub paired: bool,
   pub provenance: Provenance,
   pub accessory: bool,
   pub hidden: bool,
   pub sync_settings: SyncSettings,
   pub sync_groups: Vec<i32>,
   pub pincode: Option<SmolStr>,
   pub key: Option<LinkKey>,
}

impl From<&DeviceRecord> for StoredDevice {
   fn from(record: &DeviceRecord) -> Self {
      let info = &record.info;
      Self {
         address: info.address,
         identifier: info.identifier,
         name: info.name.clone(),
         user_name: info.user_name.clone(),
         class: info.class,
         device_id: info.device_id,
         supported: info.supported,
         authorized: info.authorized,
         paired: info.paired,
         provenance: info.provenance,
         accessory: info.accessory,
         hidden: info.hidden,
         sync_settings: info.sync_settings,
         sync_groups: info.sync_groups.clone(),
         pincode: record.pincode.clone(),
         key: record.key.clone(),
      }
   }
}

impl From<StoredDevice> for DeviceRecord {
   fn from(stored: StoredDevice) -> Self {
      let mut info = DeviceInfo::new(stored.address);
      info.identifier = stored.identifier;
      info.name = stored.name;
      info.user_name = stored.user_name;
      info.class = stored.class;
      info.device_id = stored.device_id;
      info.supported = stored.supported;
      info.authorized = stored.authorized;
      info.paired = stored.paired;
      info.provenance = stored.provenance;
      info.accessory = stored.accessory;
      info.hidden = stored.hidden;
      info.sync_settings = stored.sync_settings;
      info.sync_groups = stored.sync_groups;
      Self {
         info,
         key: stored.key,
         pincode: stored.pincode,
      }
   }
}

/// Database layout for the device store
#[derive(Debug)]
struct Db {
   env: Env,
   /// MAC address -> `StoredDevice`
   devices: Database<KeyCodec, SerdeBincode<StoredDevice>>,
   #[cfg(test)]
   writes_disabled: std::sync::atomic::AtomicBool,
}

/// LMDB environments may only be opened once per process.
static OPEN_STORES: LazyLock<Mutex<HashMap<PathBuf, DeviceStore>>> =
   LazyLock::new(|| Mutex::new(HashMap::new()));

/// Thread-safe handle to the device database.
#[derive(Clone, Debug)]
pub struct DeviceStore {
   db: Arc<Db>,
}

impl DeviceStore {
   /// Opens the store at `path`, reusing an environment already open in this process.
   pub fn open(path: &Path) -> Result<Self> {
      let mut stores = OPEN_STORES.lock();
      if let Some(store) = stores.get(path) {
         return Ok(store.clone());
      }

      std::fs::create_dir_all(path)?;
      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(10 * 1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(StoreError::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(StoreError::Transaction)?;
      let devices = env
         .create_database(&mut wtxn, Some("devices"))
         .map_err(StoreError::DatabaseOperation)?;
      wtxn.commit().map_err(StoreError::Transaction)?;

      info!("Opened device store at {}", path.display());
      let store = Self {
         db: Arc::new(Db {
            env,
            devices,
            #[cfg(test)]
            writes_disabled: Default::default(),
         }),
      };
      stores.insert(path.to_path_buf(), store.clone());
      Ok(store)
   }

   pub fn load_all(&self) -> Result<Vec<StoredDevice>> {
      let rtxn = self.db.env.read_txn().map_err(StoreError::Transaction)?;
      let iter = self
         .db
         .devices
         .iter(&rtxn)
         .map_err(StoreError::DatabaseOperation)?;
      let mut out = Vec::new();
      for entry in iter {
         let (_, device) = entry.map_err(StoreError::DatabaseOperation)?;
         out.push(device);
      }
      debug!("Loaded {} stored devices", out.len());
      Ok(out)
   }

   pub fn get(&self, address: Address) -> Result<Option<StoredDevice>> {
      let rtxn = self.db.env.read_txn().map_err(StoreError::Transaction)?;
      self
         .db
         .devices
         .get(&rtxn, &address)
         .map_err(StoreError::DatabaseOperation)
   }

   /// Makes every later `put` and `delete` fail.
   #[cfg(test)]
   pub(crate) fn disable_writes(&self, disabled: bool) {
      self
         .db
         .writes_disabled
         .store(disabled, std::sync::atomic::Ordering::Relaxed);
   }

   fn check_writable(&self) -> Result<()> {
      #[cfg(test)]
      if self.db.writes_disabled.load(std::sync::atomic::Ordering::Relaxed) {
         return Err(StoreError::WritesDisabled);
      }
      Ok(())
   }

   /// Writes `device` and commits before returning.
   pub fn put(&self, device: &StoredDevice) -> Result<()> {
      self.check_writable()?;
      let mut wtxn = self.db.env.write_txn().map_err(StoreError::Transaction)?;
      self
         .db
         .devices
         .put(&mut wtxn, &device.address, device)
         .map_err(StoreError::DatabaseOperation)?;
      wtxn.commit().map_err(StoreError::Transaction)?;
      Ok(())
   }

   /// Erases the record for `address`, key material included.
   pub fn delete(&self, address: Address) -> Result<bool> {
      self.check_writable()?;
      let mut wtxn = self.db.env.write_txn().map_err(StoreError::Transaction)?;
      let existed = self
         .db
         .devices
         .delete(&mut wtxn, &address)
         .map_err(StoreError::DatabaseOperation)?;
      wtxn.commit().map_err(StoreError::Transaction)?;
      Ok(existed)
   }
}
