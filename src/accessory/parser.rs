//! Frame parsing for the accessory control protocol.
//!
//! Parsers take the payload that follows the opcode; `split_frame` strips
//! the header first.

use std::str;

use log::{debug, warn};
use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   accessory::protocol::{
      BatteryInfo, BatteryState, BatteryStatus, CapabilityBit, CapabilityInteger, CommandRequest,
      Component, ControlType, CustomMessageType, HDR_FRAME, InEarState, InEarStatus, Opcode,
      RelayType, SetupType,
   },
   address::Address,
};

/// Error type for protocol parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Frame does not start with the control header
   #[error("Missing frame header")]
   MissingHeader,

   /// Frame is too short for the expected format
   #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
   TooShort { expected: usize, actual: usize },

   /// Declared length doesn't match the payload
   #[error("Frame size mismatch: expected {expected} bytes, got {actual} bytes")]
   SizeMismatch { expected: usize, actual: usize },

   /// Invalid battery count in battery status frame
   #[error("Invalid battery count: {count} (must be 0-4)")]
   InvalidBatteryCount { count: u8 },

   #[error("Unknown {what}: 0x{value:02x}")]
   UnknownValue { what: &'static str, value: u32 },
}

type Result<T> = std::result::Result<T, ProtoError>;

const fn ensure_len(data: &[u8], expected: usize) -> Result<()> {
   if data.len() < expected {
      Err(ProtoError::TooShort {
         expected,
         actual: data.len(),
      })
   } else {
      Ok(())
   }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
   u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
   u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Splits a raw frame into opcode and payload.
pub fn split_frame(data: &[u8]) -> Result<(Opcode, &[u8])> {
   let rest = data.strip_prefix(HDR_FRAME).ok_or(ProtoError::MissingHeader)?;
   ensure_len(rest, 2)?;
   Ok((Opcode::from_raw(read_u16(rest, 0)), &rest[2..]))
}

/// `[type, value u32]`
pub fn parse_control(payload: &[u8]) -> Result<(ControlType, u32)> {
   ensure_len(payload, 5)?;
   Ok((ControlType::from_raw(payload[0]), read_u32(payload, 1)))
}

/// `[type, subtype u16]`
pub fn parse_control_query(payload: &[u8]) -> Result<(ControlType, u16)> {
   ensure_len(payload, 3)?;
   Ok((ControlType::from_raw(payload[0]), read_u16(payload, 1)))
}

/// `[count, (component, pad, level, status, pad) * count]`
pub fn parse_battery(payload: &[u8]) -> Result<BatteryInfo> {
   ensure_len(payload, 1)?;
   let count = payload[0];
   if count > 4 {
      return Err(ProtoError::InvalidBatteryCount { count });
   }
   let expected = 1 + 5 * count as usize;
   if payload.len() != expected {
      return Err(ProtoError::SizeMismatch {
         expected,
         actual: payload.len(),
      });
   }

   let mut info = BatteryInfo::new();
   for entry in payload[1..].chunks_exact(5) {
      let (id, level, status) = (entry[0], entry[2], entry[3]);
      let Some(component) = Component::from_repr(id) else {
         warn!("Unknown component type 0x{id:02x}");
         continue;
      };
      let status = BatteryStatus::from_repr(status).unwrap_or_else(|| {
         warn!("Unknown battery status 0x{status:02x} for {component}, treating as Normal");
         BatteryStatus::Normal
      });
      debug!("Battery {component} = {level}% ({status})");
      if status != BatteryStatus::Disconnected {
         *info.component_mut(component) = BatteryState { level, status };
      }
   }
   Ok(info)
}

/// `[primary, secondary]`
pub fn parse_in_ear(payload: &[u8]) -> Result<InEarStatus> {
   ensure_len(payload, 2)?;
   let state = |b: u8| InEarState::from_repr(b).unwrap_or(InEarState::Unknown);
   Ok(InEarStatus {
      primary: state(payload[0]),
      secondary: state(payload[1]),
   })
}

#[derive(Debug, Default)]
pub struct Metadata {
   pub name_candidate: Option<SmolStr>,
}

/// Scans the metadata blob for the first printable run that looks like a name.
pub fn parse_metadata(payload: &[u8]) -> Result<Metadata> {
   ensure_len(payload, 4)?;
   let name_candidate = payload
      .split(|b| *b == 0)
      .filter_map(|run| str::from_utf8(run).ok())
      .map(str::trim)
      .filter(|text| !text.chars().any(char::is_control))
      .find(|text| text.len() > 2 && text.chars().any(char::is_alphabetic))
      .map(SmolStr::new);
   Ok(Metadata { name_candidate })
}

/// Capability vector as sent by the peer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Capabilities {
   pub bits: Vec<CapabilityBit>,
   pub integers: Vec<(CapabilityInteger, u32)>,
}

/// `[n_bits, index * n_bits, n_ints, (index, value u32) * n_ints]`
pub fn parse_capabilities(payload: &[u8]) -> Result<Capabilities> {
   ensure_len(payload, 1)?;
   let n_bits = payload[0] as usize;
   ensure_len(payload, 2 + n_bits)?;
   let bits = payload[1..=n_bits]
      .iter()
      .map(|&b| CapabilityBit::from_index(b))
      .collect();

   let rest = &payload[1 + n_bits..];
   let n_ints = rest[0] as usize;
   let expected = 1 + 5 * n_ints;
   if rest.len() != expected {
      return Err(ProtoError::SizeMismatch {
         expected,
         actual: rest.len(),
      });
   }
   let integers = rest[1..]
      .chunks_exact(5)
      .map(|c| (CapabilityInteger::from_index(c[0]), read_u32(c, 1)))
      .collect();
   Ok(Capabilities { bits, integers })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupMessage {
   pub ty: SetupType,
   pub op: u8,
   pub payload: Vec<u8>,
}

/// `[type, op, len u16, payload]`
pub fn parse_setup(payload: &[u8]) -> Result<SetupMessage> {
   ensure_len(payload, 4)?;
   let ty = SetupType::from_repr(payload[0]).ok_or(ProtoError::UnknownValue {
      what: "setup type",
      value: u32::from(payload[0]),
   })?;
   let body = sized_body(&payload[2..])?;
   Ok(SetupMessage {
      ty,
      op: payload[1],
      payload: body.to_vec(),
   })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
   pub source: Address,
   pub ty: RelayType,
   pub payload: Vec<u8>,
}

/// `[address, type, len u16, payload]`
pub fn parse_relay(payload: &[u8]) -> Result<RelayMessage> {
   ensure_len(payload, 9)?;
   let mut octets = [0u8; 6];
   octets.copy_from_slice(&payload[..6]);
   let ty = RelayType::from_repr(payload[6]).ok_or(ProtoError::UnknownValue {
      what: "relay type",
      value: u32::from(payload[6]),
   })?;
   let body = sized_body(&payload[7..])?;
   Ok(RelayMessage {
      source: Address::new(octets),
      ty,
      payload: body.to_vec(),
   })
}

/// `[len u16, body]` with an exact length.
fn sized_body(data: &[u8]) -> Result<&[u8]> {
   let len = read_u16(data, 0) as usize;
   let body = &data[2..];
   if body.len() != len {
      return Err(ProtoError::SizeMismatch {
         expected: len,
         actual: body.len(),
      });
   }
   Ok(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
   pub request: CommandRequest,
   pub result: u16,
   pub reason: u16,
}

/// `[request, result u16, reason u16]`
pub fn parse_command_status(payload: &[u8]) -> Result<CommandStatus> {
   ensure_len(payload, 5)?;
   let request = CommandRequest::from_repr(payload[0]).ok_or(ProtoError::UnknownValue {
      what: "command request",
      value: u32::from(payload[0]),
   })?;
   Ok(CommandStatus {
      request,
      result: read_u16(payload, 1),
      reason: read_u16(payload, 3),
   })
}

/// `[type u32, payload]`; the type carries exactly one channel bit.
pub fn parse_custom(payload: &[u8]) -> Result<(CustomMessageType, &[u8])> {
   ensure_len(payload, 4)?;
   Ok((
      CustomMessageType::from_bits(read_u32(payload, 0)),
      &payload[4..],
   ))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::accessory::protocol;

   #[test]
   fn test_split_rejects_foreign_frames() {
      assert_eq!(split_frame(&[0x01, 0x00, 0x04, 0x00]), Err(ProtoError::MissingHeader));
      assert!(matches!(
         split_frame(&[0x04, 0x00, 0x04, 0x00, 0x09]),
         Err(ProtoError::TooShort { .. })
      ));
      let pkt = protocol::control_frame(ControlType::CHIME_VOLUME, 55);
      let (op, payload) = split_frame(&pkt).unwrap();
      assert_eq!(op, Opcode::CONTROL);
      assert_eq!(parse_control(payload).unwrap(), (ControlType::CHIME_VOLUME, 55));
   }

   #[test]
   fn test_parse_battery() {
      let payload = [
         0x03, 0x02, 0x01, 0x50, 0x02, 0x01, 0x04, 0x01, 0x4b, 0x01, 0x01, 0x08, 0x01, 0x00,
         0x04, 0x01,
      ];
      let info = parse_battery(&payload).unwrap();
      assert_eq!(info.right.level, 0x50);
      assert!(info.left.is_charging());
      assert!(!info.case.is_available());
      assert!(matches!(
         parse_battery(&payload[..10]),
         Err(ProtoError::SizeMismatch { .. })
      ));
   }

   #[test]
   fn test_parse_capabilities() {
      let payload = [
         0x02, 0x0F, 0x50, 0x01, 0x07, 0x2A, 0x00, 0x00, 0x00,
      ];
      let caps = parse_capabilities(&payload).unwrap();
      assert_eq!(
         caps.bits,
         vec![CapabilityBit::VOLUME_SWIPE, CapabilityBit::CALL_MANAGEMENT_CONFIG]
      );
      assert_eq!(caps.integers, vec![(CapabilityInteger::CHIME_VOLUME, 42)]);
      assert!(parse_capabilities(&payload[..8]).is_err());
   }

   #[test]
   fn test_parse_relay_and_status() {
      let dest = Address::new([6, 5, 4, 3, 2, 1]);
      let pkt = protocol::relay_frame(dest, RelayType::AudioArbitration, &[1, 2, 3]);
      let (op, payload) = split_frame(&pkt).unwrap();
      assert_eq!(op, Opcode::RELAY);
      let msg = parse_relay(payload).unwrap();
      assert_eq!(msg.source, dest);
      assert_eq!(msg.payload, vec![1, 2, 3]);

      let status = parse_command_status(&[0x01, 0x00, 0x00, 0x05, 0x00]).unwrap();
      assert_eq!(status.request, CommandRequest::PriorityListTiPi);
      assert_eq!(status.reason, 5);
   }

   #[test]
   fn test_parse_metadata_name() {
      let mut payload = vec![0x01, 0x07, 0x00];
      payload.extend_from_slice(b"Studio Buds\0\x10");
      let meta = parse_metadata(&payload).unwrap();
      assert_eq!(meta.name_candidate.as_deref(), Some("Studio Buds"));
   }
}
