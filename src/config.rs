//! Configuration management for the control plane.
//!
//! Loads and saves the TOML configuration, including accessories that are
//! always recognized and the timing parameters of every component.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   address::Address,
   error::{Error, Result},
};

/// Main configuration structure.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default)]
   pub known_accessories: Vec<KnownAccessory>,

   #[serde(default = "default_attach_retry_delay")]
   pub attach_retry_delay_ms: u64,

   #[serde(default = "default_attach_retry_count")]
   pub attach_retry_count: u32,

   #[serde(default = "default_tick_interval")]
   pub tick_interval_ms: u64,

   #[serde(default = "default_scan_window")]
   pub scan_window_ms: u64,

   #[serde(default = "default_periodic_scan_interval")]
   pub periodic_scan_interval_sec: u64,

   #[serde(default = "default_query_timeout")]
   pub query_timeout_ms: u64,

   #[serde(default = "default_pairing_user_timeout")]
   pub pairing_user_timeout_sec: u64,

   #[serde(default = "default_pairing_dhkey_timeout")]
   pub pairing_dhkey_timeout_sec: u64,

   #[serde(default = "default_pairing_overall_timeout")]
   pub pairing_overall_timeout_sec: u64,

   #[serde(default = "default_max_pairing_attempts")]
   pub max_pairing_attempts: u32,

   #[serde(default = "default_accessory_command_timeout")]
   pub accessory_command_timeout_ms: u64,

   #[serde(default = "default_accessory_connect_timeout")]
   pub accessory_connect_timeout_ms: u64,

   #[serde(default = "default_persist_devices")]
   pub persist_devices: bool,

   #[serde(default)]
   pub store_path: Option<PathBuf>,
}

/// An accessory recognized by address regardless of what it advertises.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnownAccessory {
   pub address: String,
   pub name: String,
}

const fn default_attach_retry_delay() -> u64 {
   500
}

const fn default_attach_retry_count() -> u32 {
   10
}

const fn default_tick_interval() -> u64 {
   250
}

const fn default_scan_window() -> u64 {
   10_240
}

const fn default_periodic_scan_interval() -> u64 {
   60
}

const fn default_query_timeout() -> u64 {
   10_000
}

const fn default_pairing_user_timeout() -> u64 {
   30
}

const fn default_pairing_dhkey_timeout() -> u64 {
   10
}

const fn default_pairing_overall_timeout() -> u64 {
   60
}

const fn default_max_pairing_attempts() -> u32 {
   3
}

const fn default_accessory_command_timeout() -> u64 {
   5_000
}

const fn default_accessory_connect_timeout() -> u64 {
   10_000
}

const fn default_persist_devices() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_accessories: vec![],
         attach_retry_delay_ms: default_attach_retry_delay(),
         attach_retry_count: default_attach_retry_count(),
         tick_interval_ms: default_tick_interval(),
         scan_window_ms: default_scan_window(),
         periodic_scan_interval_sec: default_periodic_scan_interval(),
         query_timeout_ms: default_query_timeout(),
         pairing_user_timeout_sec: default_pairing_user_timeout(),
         pairing_dhkey_timeout_sec: default_pairing_dhkey_timeout(),
         pairing_overall_timeout_sec: default_pairing_overall_timeout(),
         max_pairing_attempts: default_max_pairing_attempts(),
         accessory_command_timeout_ms: default_accessory_command_timeout(),
         accessory_connect_timeout_ms: default_accessory_connect_timeout(),
         persist_devices: default_persist_devices(),
         store_path: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTCTL_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("btctl").join("config.toml"))
   }

   /// Directory of the LMDB device store.
   pub fn store_dir(&self) -> Result<PathBuf> {
      if let Some(path) = &self.store_path {
         return Ok(path.clone());
      }
      if let Ok(path) = env::var("BTCTL_STORE_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/btctl/devices.db
      let base = dirs::data_local_dir().ok_or(Error::ConfigDirNotFound)?;
      Ok(base.join("btctl").join("devices.db"))
   }

   /// Checks if the given address is a configured accessory and returns its name.
   pub fn known_accessory(&self, address: Address) -> Option<&str> {
      self
         .known_accessories
         .iter()
         .find(|d| d.address.parse::<Address>().is_ok_and(|a| a == address))
         .map(|d| d.name.as_str())
   }

   pub const fn attach_retry_delay(&self) -> Duration {
      Duration::from_millis(self.attach_retry_delay_ms)
   }

   pub const fn tick_interval(&self) -> Duration {
      Duration::from_millis(self.tick_interval_ms)
   }

   pub const fn scan_window(&self) -> Duration {
      Duration::from_millis(self.scan_window_ms)
   }

   pub const fn periodic_scan_interval(&self) -> Duration {
      Duration::from_secs(self.periodic_scan_interval_sec)
   }

   pub const fn query_timeout(&self) -> Duration {
      Duration::from_millis(self.query_timeout_ms)
   }

   pub const fn pairing_user_timeout(&self) -> Duration {
      Duration::from_secs(self.pairing_user_timeout_sec)
   }

   pub const fn pairing_dhkey_timeout(&self) -> Duration {
      Duration::from_secs(self.pairing_dhkey_timeout_sec)
   }

   pub const fn pairing_overall_timeout(&self) -> Duration {
      Duration::from_secs(self.pairing_overall_timeout_sec)
   }

   pub const fn accessory_command_timeout(&self) -> Duration {
      Duration::from_millis(self.accessory_command_timeout_ms)
   }

   pub const fn accessory_connect_timeout(&self) -> Duration {
      Duration::from_millis(self.accessory_connect_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_partial_file_uses_defaults() {
      let config: Config = toml::from_str(
         r#"
            scan_window_ms = 1000

            [[known_accessories]]
            address = "AA:BB:CC:DD:EE:FF"
            name = "Headphones"
         "#,
      )
      .unwrap();
      assert_eq!(config.scan_window(), Duration::from_secs(1));
      assert_eq!(config.max_pairing_attempts, 3);
      assert!(config.persist_devices);
      let addr: Address = "aa:bb:cc:dd:ee:ff".parse().unwrap();
      assert_eq!(config.known_accessory(addr), Some("Headphones"));
      assert_eq!(config.known_accessory(Address::any()), None);
   }

   #[test]
   fn test_round_trip_through_toml() {
      let config = Config {
         pairing_user_timeout_sec: 5,
         store_path: Some(PathBuf::from("/tmp/btctl-store")),
         ..Default::default()
      };
      let text = toml::to_string_pretty(&config).unwrap();
      let back: Config = toml::from_str(&text).unwrap();
      assert_eq!(back.pairing_user_timeout(), Duration::from_secs(5));
      assert_eq!(back.store_dir().unwrap(), PathBuf::from("/tmp/btctl-store"));
   }
}
