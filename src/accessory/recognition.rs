//! Accessory recognition.
//!
//! Decides whether a device speaks the accessory control protocol based on
//! explicit registration, configuration, service records, device id,
//! manufacturer data and name patterns.

use log::debug;

use crate::{config::Config, registry::DeviceInfo, services::ServiceMask};

/// Patterns to match accessory names (case-insensitive)
const NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple vendor ID
pub const APPLE_VID: u16 = 0x004C;

/// Proximity-pairing message type in manufacturer data
const PP_TYPE: u8 = 0x07;

/// Offset of the product-id byte inside the manufacturer data TLV
const PID_OFFSET: usize = 6;

/// Product ids of W1 chip accessories
const W1_PIDS: std::ops::RangeInclusive<u16> = 0x2002..=0x2009;
/// Product ids of H1 chip accessories
const H1_PIDS: std::ops::RangeInclusive<u16> = 0x200A..=0x200F;
/// Later products seen in the field
const EXTRA_PIDS: &[u16] = &[
   0x2012, // PowerBeats Pro
   0x2013, // AirPods Max
   0x2014, // AirPods Pro (2nd gen)
   0x2024, // AirPods Pro (1st gen)
];

/// Why a device was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Recognition {
   Registered,
   Configured,
   ServiceRecord,
   VendorProduct,
   ManufacturerData,
   NamePattern,
}

/// Chip family implied by a product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ChipFamily {
   W1,
   H1,
   Other,
}

pub fn is_accessory_product(product: u16) -> bool {
   W1_PIDS.contains(&product) || H1_PIDS.contains(&product) || EXTRA_PIDS.contains(&product)
}

pub fn chip_family(product: u16) -> Option<ChipFamily> {
   if W1_PIDS.contains(&product) {
      Some(ChipFamily::W1)
   } else if H1_PIDS.contains(&product) {
      Some(ChipFamily::H1)
   } else if EXTRA_PIDS.contains(&product) {
      Some(ChipFamily::Other)
   } else {
      None
   }
}

/// Checks a vendor manufacturer payload (company id already stripped).
pub fn check_manufacturer_data(data: &[u8]) -> bool {
   // TLV format: [0] type, [1] len, [2..5] ?, [6] product_id, ...
   if data.len() > PID_OFFSET && data[0] == PP_TYPE {
      let product_id = data[PID_OFFSET];
      return W1_PIDS
         .chain(H1_PIDS)
         .chain(EXTRA_PIDS.iter().copied())
         .any(|x| (x & 0xFF) as u8 == product_id);
   }
   false
}

fn name_matches(name: &str) -> Option<&'static str> {
   let name = name.to_ascii_lowercase();
   NAME_PATTERNS.iter().copied().find(|p| name.contains(p))
}

/// Returns the first rule that recognizes `info` as an accessory.
pub fn recognize(
   info: &DeviceInfo,
   config: &Config,
   manufacturer: Option<&[u8]>,
) -> Option<Recognition> {
   let address = info.address;
   if info.accessory {
      return Some(Recognition::Registered);
   }
   if config.known_accessory(address).is_some() {
      debug!("{address}: accessory via configuration");
      return Some(Recognition::Configured);
   }
   if info.supported.contains(ServiceMask::AACP) {
      debug!("{address}: accessory via service record");
      return Some(Recognition::ServiceRecord);
   }
   if let Some(id) = info.device_id
      && id.vendor == APPLE_VID
      && is_accessory_product(id.product)
   {
      debug!(
         "{address}: accessory via device id vendor={:#06x}, product={:#06x}",
         id.vendor, id.product
      );
      return Some(Recognition::VendorProduct);
   }
   if manufacturer.is_some_and(check_manufacturer_data) {
      debug!("{address}: accessory via manufacturer data");
      return Some(Recognition::ManufacturerData);
   }
   for name in [info.name.as_deref(), info.user_name.as_deref()].into_iter().flatten() {
      if let Some(pattern) = name_matches(name) {
         debug!("{address}: accessory via name pattern: {name} => {pattern}");
         return Some(Recognition::NamePattern);
      }
   }
   None
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{address::Address, config::KnownAccessory, registry::DeviceId};

   fn info() -> DeviceInfo {
      DeviceInfo::new(Address::new([1, 2, 3, 4, 5, 6]))
   }

   #[test]
   fn test_recognition_rules() {
      let config = Config::default();
      assert_eq!(recognize(&info(), &config, None), None);

      let mut by_id = info();
      by_id.device_id = Some(DeviceId {
         vendor: APPLE_VID,
         product: 0x200E,
      });
      assert_eq!(recognize(&by_id, &config, None), Some(Recognition::VendorProduct));
      assert_eq!(chip_family(0x200E), Some(ChipFamily::H1));
      assert_eq!(chip_family(0x2003), Some(ChipFamily::W1));

      let mut by_name = info();
      by_name.name = Some("Jane's PowerBeats".into());
      assert_eq!(recognize(&by_name, &config, None), Some(Recognition::NamePattern));

      let mut by_service = info();
      by_service.supported = ServiceMask::AACP;
      assert_eq!(recognize(&by_service, &config, None), Some(Recognition::ServiceRecord));

      let pp = [0x07, 0x19, 0x01, 0x0E, 0x20, 0x00, 0x0E];
      assert_eq!(recognize(&info(), &config, Some(&pp)), Some(Recognition::ManufacturerData));
      assert!(!check_manufacturer_data(&[0x10, 0x05, 0, 0, 0, 0, 0x0E]));
   }

   #[test]
   fn test_configured_accessory() {
      let config = Config {
         known_accessories: vec![KnownAccessory {
            address: "01:02:03:04:05:06".into(),
            name: "Buds".into(),
         }],
         ..Config::default()
      };
      assert_eq!(recognize(&info(), &config, None), Some(Recognition::Configured));
   }
}
