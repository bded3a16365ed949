//! Extended inquiry response parsing.
//!
//! An EIR blob is a run of `[len, type, data[len - 1]]` structures; a zero
//! length ends the significant part.

use sha2::{Digest, Sha256};

/// Shortened local name.
pub const TYPE_SHORT_NAME: u8 = 0x08;
/// Complete local name.
pub const TYPE_COMPLETE_NAME: u8 = 0x09;
/// Manufacturer specific data, prefixed by a little-endian company id.
pub const TYPE_MANUFACTURER: u8 = 0xFF;

/// Length of an advertised key digest.
pub const KEY_HASH_LEN: usize = 16;

pub type KeyHash = [u8; KEY_HASH_LEN];

/// One EIR structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
   pub ty: u8,
   pub data: &'a [u8],
}

/// Iterator over the structures of an EIR blob. Stops at the first
/// truncated or zero-length entry.
pub struct Fields<'a> {
   rest: &'a [u8],
}

impl<'a> Iterator for Fields<'a> {
   type Item = Field<'a>;

   fn next(&mut self) -> Option<Self::Item> {
      let (&len, tail) = self.rest.split_first()?;
      let len = len as usize;
      if len == 0 || tail.len() < len {
         self.rest = &[];
         return None;
      }
      let (entry, rest) = tail.split_at(len);
      self.rest = rest;
      Some(Field {
         ty: entry[0],
         data: &entry[1..],
      })
   }
}

pub fn fields(eir: &[u8]) -> Fields<'_> {
   Fields { rest: eir }
}

/// Complete name if present, else the shortened one.
pub fn local_name(eir: &[u8]) -> Option<&str> {
   let mut short = None;
   for field in fields(eir) {
      match field.ty {
         TYPE_COMPLETE_NAME => return std::str::from_utf8(field.data).ok(),
         TYPE_SHORT_NAME => short = std::str::from_utf8(field.data).ok(),
         _ => {},
      }
   }
   short
}

/// First manufacturer-specific structure as `(company, payload)`.
pub fn manufacturer_data(eir: &[u8]) -> Option<(u16, &[u8])> {
   fields(eir)
      .filter(|f| f.ty == TYPE_MANUFACTURER && f.data.len() >= 2)
      .map(|f| (u16::from_le_bytes([f.data[0], f.data[1]]), &f.data[2..]))
      .next()
}

/// Digest a scanning agent compares against advertised data.
pub fn key_hash(key: &[u8]) -> KeyHash {
   let digest = Sha256::digest(key);
   let mut out = [0u8; KEY_HASH_LEN];
   out.copy_from_slice(&digest[..KEY_HASH_LEN]);
   out
}

/// Key digests carried in the manufacturer payload, one per 16 bytes.
pub fn advertised_hashes(eir: &[u8]) -> impl Iterator<Item = &[u8]> {
   manufacturer_data(eir)
      .map(|(_, payload)| payload)
      .unwrap_or_default()
      .chunks_exact(KEY_HASH_LEN)
}

/// Builds the manufacturer structure a peer advertises for `keys`.
pub fn encode_advertisement(company: u16, keys: &[&[u8]]) -> Vec<u8> {
   let mut body = company.to_le_bytes().to_vec();
   for key in keys {
      body.extend_from_slice(&key_hash(key));
   }
   let mut out = Vec::with_capacity(body.len() + 2);
   out.push((body.len() + 1) as u8);
   out.push(TYPE_MANUFACTURER);
   out.extend_from_slice(&body);
   out
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_fields_and_names() {
      let eir = [
         0x05, TYPE_SHORT_NAME, b'B', b'u', b'd', b's', //
         0x03, 0x03, 0x0B, 0x11, //
         0x06, TYPE_COMPLETE_NAME, b'B', b'u', b'd', b's', b'!', //
         0x00, 0xAA, 0xBB,
      ];
      assert_eq!(fields(&eir).count(), 3);
      assert_eq!(local_name(&eir), Some("Buds!"));
      assert_eq!(local_name(&eir[..10]), Some("Buds"));
      // Length runs past the end.
      assert_eq!(fields(&[0x09, 0x09, b'x']).count(), 0);
   }

   #[test]
   fn test_manufacturer_hashes() {
      let eir = encode_advertisement(0x004C, &[b"alpha", b"beta"]);
      let (company, payload) = manufacturer_data(&eir).unwrap();
      assert_eq!(company, 0x004C);
      assert_eq!(payload.len(), 2 * KEY_HASH_LEN);
      let hashes: Vec<_> = advertised_hashes(&eir).collect();
      assert_eq!(hashes, vec![&key_hash(b"alpha")[..], &key_hash(b"beta")[..]]);
      assert_ne!(key_hash(b"alpha"), key_hash(b"beta"));
      assert_eq!(advertised_hashes(&[]).count(), 0);
   }
}
