//! Device records kept by the registry.

use std::{fmt, num::NonZeroU32};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   address::Address,
   services::{ServiceMask, SyncSettings},
};

/// Longest user-assigned name, in bytes.
pub const MAX_NAME_LEN: usize = 248;

/// Opaque, session-scoped reference to a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceHandle(NonZeroU32);

impl DeviceHandle {
   pub(crate) const fn new(raw: NonZeroU32) -> Self {
      Self(raw)
   }

   pub const fn get(self) -> u32 {
      self.0.get()
   }

   pub fn from_raw(raw: u32) -> Option<Self> {
      NonZeroU32::new(raw).map(Self)
   }
}

impl fmt::Display for DeviceHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Vendor and product id reported by the device id record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
   pub vendor: u16,
   pub product: u16,
}

/// 16-byte link key. Zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkKey([u8; 16]);

impl LinkKey {
   pub const LEN: usize = 16;

   pub const fn from_bytes(bytes: [u8; 16]) -> Self {
      Self(bytes)
   }

   pub const fn as_bytes(&self) -> &[u8; 16] {
      &self.0
   }

   pub fn generate() -> Self {
      Self(rand::random())
   }
}

impl fmt::Debug for LinkKey {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("LinkKey(..)")
   }
}

impl Drop for LinkKey {
   fn drop(&mut self) {
      self.0.fill(0);
   }
}

/// How the pairing relationship came to exist.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum Provenance {
   #[default]
   Normal,
   Cloud,
   Magic,
   TemporaryGuest,
}

/// Likelihood that a device fills a service role.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityLevel {
   Unknown,
   Unsupported,
   Unlikely,
   Likely,
   Supported,
}

/// Device taxonomy derived from the class of device.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
   strum::EnumCount,
)]
#[strum(serialize_all = "title_case")]
pub enum DeviceType {
   #[strum(serialize = "Bluetooth Device")]
   Generic = 0,
   #[strum(serialize = "Computer")]
   GenericComputer,
   #[strum(serialize = "Phone")]
   GenericPhone,
   #[strum(serialize = "Audio/Video Device")]
   GenericAudioVideo,
   #[strum(serialize = "Peripheral")]
   GenericPeripheral,
   #[strum(serialize = "Imaging Device")]
   GenericImaging,
   #[strum(serialize = "Toy")]
   GenericToy,
   DesktopComputer,
   LaptopComputer,
   WearableComputer,
   Server,
   #[strum(serialize = "PDA")]
   Pda,
   MobilePhone,
   CordlessPhone,
   Modem,
   AccessPoint,
   Headset,
   #[strum(serialize = "Hands-Free Device")]
   Handsfree,
   Microphone,
   Speaker,
   Headphones,
   PortableAudio,
   CarStereo,
   #[strum(serialize = "Hi-Fi Stereo")]
   HifiStereo,
   Keyboard,
   Mouse,
   Gamepad,
   RemoteControl,
   Sensor,
   Tablet,
   CardReader,
   Printer,
   Scanner,
   Camera,
   VideoCamera,
   Display,
   VideoDisplay,
   VideoConferencing,
   SetTopBox,
   #[strum(serialize = "VCR")]
   Vcr,
   GamingConsole,
   ToyController,
   Watch,
   Pager,
   Jacket,
   Helmet,
   Glasses,
   #[strum(serialize = "Audio Device")]
   A2dp,
   #[strum(serialize = "Accessory")]
   LePeripheral,
}

const MAJOR_COMPUTER: u32 = 1;
const MAJOR_PHONE: u32 = 2;
const MAJOR_NETWORK: u32 = 3;
const MAJOR_AUDIO_VIDEO: u32 = 4;
const MAJOR_PERIPHERAL: u32 = 5;
const MAJOR_IMAGING: u32 = 6;
const MAJOR_WEARABLE: u32 = 7;
const MAJOR_TOY: u32 = 8;
const MAJOR_HEALTH: u32 = 9;

impl DeviceType {
   /// Classifies a device from its class of device, falling back to services.
   pub fn classify(class: u32, services: ServiceMask) -> Self {
      let major = (class >> 8) & 0x1F;
      let minor = (class >> 2) & 0x3F;
      match major {
         MAJOR_COMPUTER => match minor {
            1 => Self::DesktopComputer,
            2 => Self::Server,
            3 => Self::LaptopComputer,
            4 | 5 => Self::Pda,
            6 => Self::WearableComputer,
            7 => Self::Tablet,
            _ => Self::GenericComputer,
         },
         MAJOR_PHONE => match minor {
            1 | 3 => Self::MobilePhone,
            2 => Self::CordlessPhone,
            4 | 5 => Self::Modem,
            _ => Self::GenericPhone,
         },
         MAJOR_NETWORK => Self::AccessPoint,
         MAJOR_AUDIO_VIDEO => match minor {
            1 => Self::Headset,
            2 => Self::Handsfree,
            4 => Self::Microphone,
            5 => Self::Speaker,
            6 => Self::Headphones,
            7 => Self::PortableAudio,
            8 => Self::CarStereo,
            9 => Self::SetTopBox,
            10 => Self::HifiStereo,
            11 => Self::Vcr,
            12 | 13 => Self::VideoCamera,
            14 | 15 => Self::VideoDisplay,
            16 => Self::VideoConferencing,
            18 => Self::GamingConsole,
            _ => Self::GenericAudioVideo,
         },
         MAJOR_PERIPHERAL => match (minor >> 4, minor & 0x0F) {
            (_, 1 | 2) => Self::Gamepad,
            (_, 3) => Self::RemoteControl,
            (_, 4) => Self::Sensor,
            (_, 5) => Self::Tablet,
            (_, 6) => Self::CardReader,
            (1 | 3, _) => Self::Keyboard,
            (2, _) => Self::Mouse,
            _ => Self::GenericPeripheral,
         },
         MAJOR_IMAGING => {
            if minor & 0x20 != 0 {
               Self::Printer
            } else if minor & 0x10 != 0 {
               Self::Scanner
            } else if minor & 0x08 != 0 {
               Self::Camera
            } else if minor & 0x04 != 0 {
               Self::Display
            } else {
               Self::GenericImaging
            }
         },
         MAJOR_WEARABLE => match minor {
            1 => Self::Watch,
            2 => Self::Pager,
            3 => Self::Jacket,
            4 => Self::Helmet,
            5 => Self::Glasses,
            _ => Self::WearableComputer,
         },
         MAJOR_TOY => match minor {
            4 => Self::ToyController,
            _ => Self::GenericToy,
         },
         MAJOR_HEALTH => Self::Sensor,
         _ if services.contains(ServiceMask::A2DP) => Self::A2dp,
         _ if services.intersects(ServiceMask::GATT | ServiceMask::LE_GATT_CLIENT) => {
            Self::LePeripheral
         },
         _ => Self::Generic,
      }
   }

   /// Name shown until the peer reports one.
   pub fn default_name(self) -> &'static str {
      self.into()
   }

   const fn is_audio(self) -> bool {
      matches!(
         self,
         Self::GenericAudioVideo
            | Self::Headset
            | Self::Handsfree
            | Self::Speaker
            | Self::Headphones
            | Self::PortableAudio
            | Self::CarStereo
            | Self::HifiStereo
            | Self::A2dp
      )
   }

   const fn is_input(self) -> bool {
      matches!(
         self,
         Self::GenericPeripheral
            | Self::Keyboard
            | Self::Mouse
            | Self::Gamepad
            | Self::RemoteControl
            | Self::Tablet
      )
   }
}

/// Reserved sync group selectors.
pub mod sync_group {
   pub const ALL: i32 = -1;
   pub const NONE: i32 = -2;
}

/// Cached attributes of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
   pub address: Address,
   /// Present for cloud-paired and virtual devices.
   pub identifier: Option<Uuid>,
   /// Last name reported by the peer.
   pub name: Option<SmolStr>,
   /// Overrides `name`; never touched by scan data.
   pub user_name: Option<SmolStr>,
   pub class: u32,
   pub device_id: Option<DeviceId>,
   pub supported: ServiceMask,
   pub authorized: ServiceMask,
   pub connected: ServiceMask,
   pub paired: bool,
   pub provenance: Provenance,
   pub accessory: bool,
   pub hidden: bool,
   pub sync_settings: SyncSettings,
   pub sync_groups: Vec<i32>,
   pub battery_level: Option<u8>,
   pub color: Option<u32>,
   pub rssi: Option<i16>,
}

impl DeviceInfo {
   pub fn new(address: Address) -> Self {
      Self {
         address,
         identifier: None,
         name: None,
         user_name: None,
         class: 0,
         device_id: None,
         supported: ServiceMask::empty(),
         authorized: ServiceMask::empty(),
         connected: ServiceMask::empty(),
         paired: false,
         provenance: Provenance::Normal,
         accessory: false,
         hidden: false,
         sync_settings: SyncSettings::empty(),
         sync_groups: Vec::new(),
         battery_level: None,
         color: None,
         rssi: None,
      }
   }

   pub fn device_type(&self) -> DeviceType {
      DeviceType::classify(self.class, self.supported)
   }

   /// User name, else peer name, else the type's default name.
   pub fn display_name(&self) -> &str {
      self
         .user_name
         .as_deref()
         .or(self.name.as_deref())
         .unwrap_or_else(|| self.device_type().default_name())
   }

   /// How likely the device fills `role`, from services first and class second.
   pub fn capability(&self, role: ServiceMask) -> CapabilityLevel {
      if role.is_empty() {
         return CapabilityLevel::Unknown;
      }
      if self.supported.contains(role) {
         return CapabilityLevel::Supported;
      }
      if self.class == 0 && self.supported.is_empty() {
         return CapabilityLevel::Unknown;
      }
      let ty = self.device_type();
      let audio = ServiceMask::A2DP | ServiceMask::HANDSFREE | ServiceMask::REMOTE;
      let input = ServiceMask::HID;
      let likely = (ty.is_audio() && audio.contains(role)) || (ty.is_input() && input.contains(role));
      if likely {
         CapabilityLevel::Likely
      } else if self.supported.is_empty() {
         CapabilityLevel::Unlikely
      } else {
         CapabilityLevel::Unsupported
      }
   }

   pub fn is_cloud_paired(&self) -> bool {
      self.paired && self.provenance == Provenance::Cloud
   }

   pub fn is_magic_paired(&self) -> bool {
      self.paired && self.provenance == Provenance::Magic
   }

   pub fn is_temporary_paired(&self) -> bool {
      self.paired && self.provenance == Provenance::TemporaryGuest
   }
}

/// Registry entry: attributes plus security material.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
   pub info: DeviceInfo,
   pub key: Option<LinkKey>,
   pub pincode: Option<SmolStr>,
}

impl DeviceRecord {
   pub fn new(address: Address) -> Self {
      Self {
         info: DeviceInfo::new(address),
         key: None,
         pincode: None,
      }
   }
}

#[cfg(test)]
mod tests {
   use strum::EnumCount;

   use super::*;

   #[test]
   fn test_taxonomy_from_class() {
      assert_eq!(DeviceType::COUNT, 49);
      assert_eq!(DeviceType::classify(0x240418, ServiceMask::empty()), DeviceType::Headphones);
      assert_eq!(DeviceType::classify(0x5A020C, ServiceMask::empty()), DeviceType::MobilePhone);
      assert_eq!(DeviceType::classify(0x000540, ServiceMask::empty()), DeviceType::Keyboard);
      assert_eq!(DeviceType::classify(0x000580, ServiceMask::empty()), DeviceType::Mouse);
      assert_eq!(DeviceType::classify(0x000704, ServiceMask::empty()), DeviceType::Watch);
      assert_eq!(DeviceType::classify(0x000680, ServiceMask::empty()), DeviceType::Printer);
      assert_eq!(DeviceType::classify(0, ServiceMask::A2DP), DeviceType::A2dp);
      assert_eq!(DeviceType::classify(0, ServiceMask::empty()), DeviceType::Generic);
   }

   #[test]
   fn test_default_names() {
      assert_eq!(DeviceType::Headphones.default_name(), "Headphones");
      assert_eq!(DeviceType::MobilePhone.default_name(), "Mobile Phone");
      assert_eq!(DeviceType::Pda.default_name(), "PDA");
   }

   #[test]
   fn test_display_name_precedence() {
      let mut info = DeviceInfo::new(Address::any());
      info.class = 0x240418;
      assert_eq!(info.display_name(), "Headphones");
      info.name = Some("Buds".into());
      assert_eq!(info.display_name(), "Buds");
      info.user_name = Some("Mine".into());
      assert_eq!(info.display_name(), "Mine");
   }

   #[test]
   fn test_capability_levels() {
      let mut info = DeviceInfo::new(Address::any());
      assert_eq!(info.capability(ServiceMask::A2DP), CapabilityLevel::Unknown);
      info.class = 0x240418;
      assert_eq!(info.capability(ServiceMask::A2DP), CapabilityLevel::Likely);
      assert_eq!(info.capability(ServiceMask::HID), CapabilityLevel::Unlikely);
      info.supported = ServiceMask::A2DP;
      assert_eq!(info.capability(ServiceMask::A2DP), CapabilityLevel::Supported);
      assert_eq!(info.capability(ServiceMask::MAP), CapabilityLevel::Unsupported);
   }

   #[test]
   fn test_link_key_is_redacted() {
      let key = LinkKey::from_bytes([0xAB; 16]);
      assert_eq!(format!("{key:?}"), "LinkKey(..)");
      assert_ne!(LinkKey::generate(), LinkKey::generate());
   }
}
