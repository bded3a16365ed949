//! Hardware addresses and their canonical text form.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing the `XX:XX:XX:XX:XX:XX` text form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
   #[error("Expected 6 octets, got {0}")]
   OctetCount(usize),

   #[error("Octet {index} is not two hex digits")]
   InvalidOctet { index: usize },
}

/// 6-byte device hardware address, most significant octet first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Address(pub [u8; 6]);

impl Address {
   pub const fn new(octets: [u8; 6]) -> Self {
      Self(octets)
   }

   pub const fn any() -> Self {
      Self([0; 6])
   }

   pub const fn octets(self) -> [u8; 6] {
      self.0
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl fmt::Debug for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(self, f)
   }
}

impl FromStr for Address {
   type Err = AddressParseError;

   /// Accepts either hex case; formatting always produces uppercase.
   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let count = s.split(':').count();
      if count != 6 {
         return Err(AddressParseError::OctetCount(count));
      }
      let mut octets = [0u8; 6];
      for (index, part) in s.split(':').enumerate() {
         if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AddressParseError::InvalidOctet { index });
         }
         octets[index] = u8::from_str_radix(part, 16)
            .map_err(|_| AddressParseError::InvalidOctet { index })?;
      }
      Ok(Self(octets))
   }
}

impl From<[u8; 6]> for Address {
   fn from(octets: [u8; 6]) -> Self {
      Self(octets)
   }
}

#[cfg(feature = "bluez")]
impl From<bluer::Address> for Address {
   fn from(addr: bluer::Address) -> Self {
      Self(addr.0)
   }
}

#[cfg(feature = "bluez")]
impl From<Address> for bluer::Address {
   fn from(addr: Address) -> Self {
      Self(addr.0)
   }
}

#[cfg(test)]
mod tests {
   use rand::Rng;

   use super::*;

   #[test]
   fn test_format_is_uppercase() {
      let addr = Address([0xaa, 0xbb, 0x0c, 0xdd, 0xee, 0x01]);
      assert_eq!(addr.to_string(), "AA:BB:0C:DD:EE:01");
   }

   #[test]
   fn test_parse_accepts_lowercase() {
      let addr: Address = "aa:bb:cc:dd:ee:ff".parse().unwrap();
      assert_eq!(addr, Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
   }

   #[test]
   fn test_round_trip() {
      let mut rng = rand::thread_rng();
      for _ in 0..512 {
         let addr = Address(rng.r#gen());
         let text = addr.to_string();
         let parsed: Address = text.parse().unwrap();
         assert_eq!(parsed, addr);
         assert_eq!(parsed.to_string(), text);
      }
      for edge in [Address::any(), Address([0xFF; 6])] {
         assert_eq!(edge.to_string().parse::<Address>().unwrap(), edge);
      }
   }

   #[test]
   fn test_rejects_malformed() {
      assert_eq!(
         "AA:BB:CC:DD:EE".parse::<Address>(),
         Err(AddressParseError::OctetCount(5))
      );
      assert_eq!(
         "AA:BB:CC:DD:EE:FF:00".parse::<Address>(),
         Err(AddressParseError::OctetCount(7))
      );
      assert_eq!(
         "AA:BB:CC:DD:EE:F".parse::<Address>(),
         Err(AddressParseError::InvalidOctet { index: 5 })
      );
      assert_eq!(
         "AA:BB:CC:DD:EE:+F".parse::<Address>(),
         Err(AddressParseError::InvalidOctet { index: 5 })
      );
      assert_eq!(
         "GG:BB:CC:DD:EE:FF".parse::<Address>(),
         Err(AddressParseError::InvalidOctet { index: 0 })
      );
   }
}
