//! Error types for the control plane.
//!
//! Every subsystem owns a tagged error enum; `Error` unifies them and maps
//! each variant onto a kind and onto the historical integer result codes
//! that D-Bus consumers still expect.

use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   accessory::{AccessoryError, parser::ProtoError},
   address::{Address, AddressParseError},
   discovery::DiscoveryError,
   pairing::PairingError,
   registry::store::StoreError,
   services::ServiceMask,
   session::SessionError,
};

/// Main error type of the crate.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Invalid address: {0}")]
   InvalidAddress(#[from] AddressParseError),

   #[error("Invalid argument: {0}")]
   InvalidArgument(&'static str),

   #[error("Invalid handle")]
   InvalidHandle,

   #[error("Buffer too small: {available} entries available")]
   BufferTooSmall { available: usize },

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("No link key stored for {0}")]
   KeyNotFound(Address),

   #[error("Device already registered: {0}")]
   AlreadyRegistered(Address),

   #[error("Services not authorized: {0}")]
   ServiceNotAuthorized(ServiceMask),

   #[error("Not supported: {0}")]
   NotSupported(&'static str),

   #[error("Transport daemon not running")]
   NoServerFound,

   #[error("Transport request rejected: {0}")]
   Transport(SmolStr),

   #[error(transparent)]
   Session(#[from] SessionError),

   #[error(transparent)]
   Discovery(#[from] DiscoveryError),

   #[error(transparent)]
   Pairing(#[from] PairingError),

   #[error(transparent)]
   Accessory(#[from] AccessoryError),

   #[error("Malformed frame: {0}")]
   Proto(#[from] ProtoError),

   #[error("Device store error: {0}")]
   Store(#[from] StoreError),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),
}

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
   /// Caller-fixable; never retried automatically.
   Argument,
   /// Conflicts with the current state; caller waits or cancels.
   State,
   /// Terminal for the current pairing attempt.
   Security,
   /// Reported, not retried; bucket carried by the variant.
   Timeout,
   /// Fatal to the operation; caller re-attaches the session.
   Resource,
   Unsupported,
}

impl Error {
   pub fn kind(&self) -> ErrorKind {
      match self {
         Self::InvalidAddress(_)
         | Self::InvalidArgument(_)
         | Self::InvalidHandle
         | Self::BufferTooSmall { .. }
         | Self::DeviceNotFound(_)
         | Self::KeyNotFound(_) => ErrorKind::Argument,
         Self::AlreadyRegistered(_) | Self::ServiceNotAuthorized(_) => ErrorKind::State,
         Self::NotSupported(_) => ErrorKind::Unsupported,
         Self::Session(e) => e.kind(),
         Self::Discovery(e) => e.kind(),
         Self::Pairing(e) => e.kind(),
         Self::Accessory(e) => e.kind(),
         Self::Proto(_) => ErrorKind::Argument,
         Self::NoServerFound
         | Self::Transport(_)
         | Self::Store(_)
         | Self::Io(_)
         | Self::ConfigDirNotFound
         | Self::TomlParse(_)
         | Self::TomlSerialize(_)
         | Self::DBus(_)
         | Self::DBusConnection(_) => ErrorKind::Resource,
         #[cfg(feature = "bluez")]
         Self::Bluetooth(_) => ErrorKind::Resource,
      }
   }

   /// Historical integer result code; 0 is reserved for success.
   pub fn code(&self) -> i32 {
      match self {
         Self::InvalidAddress(_) => 8,
         Self::InvalidArgument(_) | Self::Proto(_) => 3,
         Self::InvalidHandle => 7,
         Self::BufferTooSmall { .. } => 5,
         Self::DeviceNotFound(_) => 9,
         Self::KeyNotFound(_) => 150,
         Self::AlreadyRegistered(_) => 15,
         Self::ServiceNotAuthorized(_) => 107,
         Self::NotSupported(_) => 11,
         Self::NoServerFound => 9,
         Self::Session(e) => e.code(),
         Self::Discovery(e) => e.code(),
         Self::Pairing(e) => e.code(),
         Self::Accessory(e) => e.code(),
         Self::Store(_) | Self::Io(_) | Self::Transport(_) => 1,
         Self::ConfigDirNotFound | Self::TomlParse(_) | Self::TomlSerialize(_) => 1,
         Self::DBus(_) | Self::DBusConnection(_) => 1,
         #[cfg(feature = "bluez")]
         Self::Bluetooth(_) => 1,
      }
   }
}

/// Convenience type alias for Results with `Error`.
pub type Result<T> = std::result::Result<T, Error>;
