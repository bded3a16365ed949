//! Service, attribute and sync-setting masks.
//!
//! Supported, authorized and connected services are three independent
//! `ServiceMask` values per device; they share a type but never a field.

use uuid::Uuid;

use crate::bits::bitset;

bitset! {
   /// Logical services that apply to a device.
   pub struct ServiceMask(u32) {
      const HANDSFREE = 1 << 0, "handsfree";
      const PHONEBOOK = 1 << 1, "phonebook";
      const REMOTE = 1 << 3, "remote";
      const A2DP = 1 << 4, "a2dp";
      const HID = 1 << 5, "hid";
      const SENSOR = 1 << 6, "sensor";
      const WIRELESS_IAP = 1 << 7, "wireless_iap";
      const NET_SHARING = 1 << 8, "net_sharing";
      const MAP = 1 << 9, "map";
      const PASSTHROUGH = 1 << 10, "passthrough";
      const GAMING = 1 << 11, "gaming";
      const NETWORK_CONSUMER = 1 << 12, "network_consumer";
      const BRAILLE = 1 << 13, "braille";
      const PASSIVE_MULTI_STREAM = 1 << 14, "passive_multi_stream";
      const LE_GATT_CLIENT = 1 << 15, "le_gatt_client";
      const LEA = 1 << 16, "lea";
      const WIRELESS_IAP_SINK = 1 << 17, "wireless_iap_sink";
      const WIRELESS_CARPLAY = 1 << 18, "wireless_carplay";
      /// Accessory control protocol channel.
      const AACP = 1 << 19, "aacp";
      const GATT = 1 << 20, "gatt";
   }
}

bitset! {
   /// Device attributes reported by discovery found/changed events.
   pub struct DeviceAttributes(u8) {
      const DEVICE_TYPE = 1 << 0, "device_type";
      const DEFAULT_NAME = 1 << 1, "default_name";
      const CAPABILITIES = 1 << 2, "capabilities";
      const NAME = 1 << 3, "name";
      const ROLES = 1 << 4, "roles";
   }
}

bitset! {
   /// Contact/message synchronization policy of a device.
   pub struct SyncSettings(u32) {
      const SUPPORTS_SYNC = 1 << 0, "supports_sync";
      const SYNC_ENABLED = 1 << 1, "sync_enabled";
      const SYNC_RECENTS = 1 << 2, "sync_recents";
      const SYNC_FAVORITES = 1 << 3, "sync_favorites";
      const PERMISSION_GRANTED = 1 << 4, "permission_granted";
      const MAP_ENABLED = 1 << 5, "map_enabled";
   }
}

/// Bluetooth SIG base UUID with the 16/32-bit alias zeroed.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const BASE_MASK: u128 = (1u128 << 96) - 1;

/// Accessory control protocol service record.
pub const AACP_UUID: Uuid = Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a);
/// iAP2 over RFCOMM.
pub const IAP2_UUID: Uuid = Uuid::from_u128(0x00000000_deca_fade_deca_deafdecacaff);

const SHORT_UUIDS: &[(u32, ServiceMask)] = &[
   (0x1108, ServiceMask::HANDSFREE),
   (0x110A, ServiceMask::A2DP),
   (0x110B, ServiceMask::A2DP),
   (0x110C, ServiceMask::REMOTE),
   (0x110D, ServiceMask::A2DP),
   (0x110E, ServiceMask::REMOTE),
   (0x110F, ServiceMask::REMOTE),
   (0x1112, ServiceMask::HANDSFREE),
   (0x1115, ServiceMask::NET_SHARING),
   (0x1116, ServiceMask::NET_SHARING),
   (0x1117, ServiceMask::NET_SHARING),
   (0x111E, ServiceMask::HANDSFREE),
   (0x111F, ServiceMask::HANDSFREE),
   (0x1124, ServiceMask::HID),
   (0x112E, ServiceMask::PHONEBOOK),
   (0x112F, ServiceMask::PHONEBOOK),
   (0x1130, ServiceMask::PHONEBOOK),
   (0x1132, ServiceMask::MAP),
   (0x1133, ServiceMask::MAP),
   (0x1134, ServiceMask::MAP),
   (0x1801, ServiceMask::GATT),
   (0x1812, ServiceMask::HID),
   (0x184E, ServiceMask::LEA),
   (0x1850, ServiceMask::LEA),
];

impl ServiceMask {
   pub const ALL: Self = Self::from_bits(u32::MAX);

   /// Maps a service record UUID onto its service bit.
   pub fn from_uuid(uuid: &Uuid) -> Self {
      if *uuid == AACP_UUID {
         return Self::AACP;
      }
      if *uuid == IAP2_UUID {
         return Self::WIRELESS_IAP;
      }
      let raw = uuid.as_u128();
      if raw & BASE_MASK != BASE_UUID {
         return Self::empty();
      }
      let short = (raw >> 96) as u32;
      SHORT_UUIDS
         .iter()
         .find(|(alias, _)| *alias == short)
         .map_or(Self::empty(), |(_, mask)| *mask)
   }

   pub fn from_uuids<'a>(uuids: impl IntoIterator<Item = &'a Uuid>) -> Self {
      uuids
         .into_iter()
         .fold(Self::empty(), |acc, uuid| acc | Self::from_uuid(uuid))
   }

   /// Whether an inquiry filter accepts this advertised set; an empty filter accepts anything.
   pub const fn matches_filter(self, filter: Self) -> bool {
      filter.is_empty() || self.intersects(filter)
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_mask_algebra() {
      let audio = ServiceMask::A2DP | ServiceMask::HANDSFREE;
      assert!(audio.contains(ServiceMask::A2DP));
      assert!(!audio.contains(ServiceMask::A2DP | ServiceMask::HID));
      assert!(audio.intersects(ServiceMask::HANDSFREE | ServiceMask::HID));
      assert_eq!(audio - ServiceMask::A2DP, ServiceMask::HANDSFREE);
      assert_eq!(audio & ServiceMask::HID, ServiceMask::empty());
      assert_eq!(audio.bits(), 0b1_0001);
   }

   #[test]
   fn test_mask_text_form() {
      let mask = ServiceMask::A2DP | ServiceMask::AACP;
      assert_eq!(mask.to_string(), "a2dp|aacp");
      assert_eq!(ServiceMask::from_str("a2dp|aacp").unwrap(), mask);
      assert_eq!(ServiceMask::from_str("none").unwrap(), ServiceMask::empty());
      assert_eq!(ServiceMask::empty().to_string(), "none");
      assert_eq!(ServiceMask::from_bits(1 << 2).to_string(), "0x4");
      assert!(ServiceMask::from_str("bogus").is_err());
   }

   #[test]
   fn test_filter_matching() {
      let advertised = ServiceMask::A2DP | ServiceMask::HANDSFREE;
      assert!(advertised.matches_filter(ServiceMask::A2DP));
      assert!(advertised.matches_filter(ServiceMask::empty()));
      assert!(!advertised.matches_filter(ServiceMask::HID));
   }

   #[test]
   fn test_uuid_mapping() {
      let a2dp_sink = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
      let hfp = Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb);
      let vendor = Uuid::from_u128(0x12345678_0000_1000_8000_00805f9b34fb);
      assert_eq!(ServiceMask::from_uuid(&a2dp_sink), ServiceMask::A2DP);
      assert_eq!(ServiceMask::from_uuid(&AACP_UUID), ServiceMask::AACP);
      assert_eq!(ServiceMask::from_uuid(&vendor), ServiceMask::empty());
      assert_eq!(
         ServiceMask::from_uuids([&a2dp_sink, &hfp]),
         ServiceMask::A2DP | ServiceMask::HANDSFREE
      );
   }
}
