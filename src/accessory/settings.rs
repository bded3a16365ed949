//! Typed values carried by control settings.
//!
//! Each setting travels as one little-endian `u32`; these types encode and
//! decode that integer with explicit bit positions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bits::bitset;

/// Listening mode (`ControlType::LISTENING_MODE`).
#[repr(u32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum ListeningMode {
   #[strum(serialize = "normal", serialize = "off")]
   Normal = 0x01,
   #[strum(serialize = "anc", serialize = "nc")]
   Anc = 0x02,
   #[strum(serialize = "transparency", serialize = "trans")]
   Transparency = 0x03,
   #[strum(serialize = "adaptive", serialize = "adapt")]
   Adaptive = 0x04,
}

impl ListeningMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

bitset! {
   /// Listening modes the user cycles through (`ControlType::LISTENING_MODE_CONFIGS`).
   pub struct ListeningModeConfigs(u32) {
      const NORMAL = 1 << 0, "normal";
      const ANC = 1 << 1, "anc";
      const TRANSPARENCY = 1 << 2, "transparency";
      const ADAPTIVE = 1 << 3, "adaptive";
   }
}

/// On/off settings such as auto answer and one-bud ANC.
#[repr(u32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ConfigMode {
   Enabled = 0x01,
   Disabled = 0x02,
}

impl From<bool> for ConfigMode {
   fn from(on: bool) -> Self {
      if on { Self::Enabled } else { Self::Disabled }
   }
}

#[repr(u32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum CrownRotation {
   Unknown = 0,
   BackToFront = 1,
   FrontToBack = 2,
}

#[repr(u32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum MicMode {
   Auto = 0,
   FixedRight = 1,
   FixedLeft = 2,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum DoubleTapAction {
   #[default]
   Off = 0,
   Siri = 1,
   Media = 2,
   Forward = 3,
   Backward = 4,
}

/// Per-bud double-tap actions: left in bits 0-7, right in bits 8-15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DoubleTapActions {
   pub left: DoubleTapAction,
   pub right: DoubleTapAction,
}

impl DoubleTapActions {
   pub const fn encode(self) -> u32 {
      (self.left as u32) | ((self.right as u32) << 8)
   }

   pub fn decode(value: u32) -> Self {
      let action = |b: u32| DoubleTapAction::from_repr(b as u8).unwrap_or_default();
      Self {
         left: action(value & 0xFF),
         right: action((value >> 8) & 0xFF),
      }
   }
}

/// Action bound to a click-hold gesture.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum GestureMode {
   #[default]
   Unknown = 0x00,
   Siri = 0x01,
   Media = 0x02,
   Forward = 0x03,
   Backward = 0x04,
   NoiseManagement = 0x05,
   VolumeUp = 0x06,
   VolumeDown = 0x07,
}

/// Click-hold bindings, one byte per field from the least significant.
///
/// The `prev_*` bytes are only meaningful on products that report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GestureModes {
   pub right: GestureMode,
   pub left: GestureMode,
   pub prev_right: GestureMode,
   pub prev_left: GestureMode,
}

impl GestureModes {
   pub const fn encode(self) -> u32 {
      u32::from_le_bytes([
         self.right as u8,
         self.left as u8,
         self.prev_right as u8,
         self.prev_left as u8,
      ])
   }

   pub fn decode(value: u32) -> Self {
      let [right, left, prev_right, prev_left] =
         value.to_le_bytes().map(|b| GestureMode::from_repr(b).unwrap_or_default());
      Self {
         right,
         left,
         prev_right,
         prev_left,
      }
   }
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum CallManagementStatus {
   #[default]
   Unknown = 0,
   Disabled = 1,
   EndCallSet = 2,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum EndCallConfig {
   #[default]
   Unknown = 0,
   Disabled = 1,
   SingleTap = 2,
   DoubleTap = 3,
}

/// Call management configuration (`ControlType::CALL_CONFIG`).
///
/// Nibble 0 is the version, nibble 1 the status, nibble 2 the end-call
/// gesture. Nibbles 3-7 are reserved and carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallManagementConfig {
   pub version: u8,
   pub status: CallManagementStatus,
   pub end_call: EndCallConfig,
   reserved: u32,
}

const NIBBLE_VERSION: u32 = 0;
const NIBBLE_STATUS: u32 = 4;
const NIBBLE_END_CALL: u32 = 8;
const RESERVED_MASK: u32 = 0xFFFF_F000;

impl CallManagementConfig {
   /// Only version 0 (end call configuration) is defined.
   pub const VERSION: u8 = 0;

   pub const fn new(status: CallManagementStatus, end_call: EndCallConfig) -> Self {
      Self {
         version: Self::VERSION,
         status,
         end_call,
         reserved: 0,
      }
   }

   /// Raw reserved nibbles, still in their wire positions.
   pub const fn reserved(&self) -> u32 {
      self.reserved
   }

   pub const fn encode(self) -> u32 {
      (self.version as u32 & 0xF) << NIBBLE_VERSION
         | (self.status as u32 & 0xF) << NIBBLE_STATUS
         | (self.end_call as u32 & 0xF) << NIBBLE_END_CALL
         | (self.reserved & RESERVED_MASK)
   }

   pub fn decode(value: u32) -> Self {
      let nibble = |shift: u32| ((value >> shift) & 0xF) as u8;
      Self {
         version: nibble(NIBBLE_VERSION),
         status: CallManagementStatus::from_repr(nibble(NIBBLE_STATUS)).unwrap_or_default(),
         end_call: EndCallConfig::from_repr(nibble(NIBBLE_END_CALL)).unwrap_or_default(),
         reserved: value & RESERVED_MASK,
      }
   }
}

/// Value carried by one control type, encoded as the wire `u32`.
pub trait ControlValue: Sized {
   fn encode(self) -> u32;
   fn decode(value: u32) -> Option<Self>;
}

impl ControlValue for u32 {
   fn encode(self) -> u32 {
      self
   }

   fn decode(value: u32) -> Option<Self> {
      Some(value)
   }
}

/// Chime volume, percent.
impl ControlValue for u8 {
   fn encode(self) -> u32 {
      u32::from(self)
   }

   fn decode(value: u32) -> Option<Self> {
      u8::try_from(value).ok().filter(|v| *v <= 100)
   }
}

impl ControlValue for bool {
   fn encode(self) -> u32 {
      ConfigMode::from(self) as u32
   }

   fn decode(value: u32) -> Option<Self> {
      ConfigMode::from_repr(value).map(|m| m == ConfigMode::Enabled)
   }
}

/// Intervals travel as milliseconds.
impl ControlValue for Duration {
   fn encode(self) -> u32 {
      u32::try_from(self.as_millis()).unwrap_or(u32::MAX)
   }

   fn decode(value: u32) -> Option<Self> {
      Some(Self::from_millis(u64::from(value)))
   }
}

macro_rules! repr_control_value {
   ($($ty:ty),* $(,)?) => {$(
      impl ControlValue for $ty {
         fn encode(self) -> u32 {
            self as u32
         }

         fn decode(value: u32) -> Option<Self> {
            Self::from_repr(value)
         }
      }
   )*};
}

repr_control_value!(ListeningMode, ConfigMode, CrownRotation, MicMode);

impl ControlValue for ListeningModeConfigs {
   fn encode(self) -> u32 {
      self.bits()
   }

   fn decode(value: u32) -> Option<Self> {
      Some(Self::from_bits(value))
   }
}

impl ControlValue for DoubleTapActions {
   fn encode(self) -> u32 {
      Self::encode(self)
   }

   fn decode(value: u32) -> Option<Self> {
      Some(Self::decode(value))
   }
}

impl ControlValue for GestureModes {
   fn encode(self) -> u32 {
      Self::encode(self)
   }

   fn decode(value: u32) -> Option<Self> {
      Some(Self::decode(value))
   }
}

impl ControlValue for CallManagementConfig {
   fn encode(self) -> u32 {
      Self::encode(self)
   }

   fn decode(value: u32) -> Option<Self> {
      Some(Self::decode(value))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_call_management_nibbles() {
      let config = CallManagementConfig::new(
         CallManagementStatus::EndCallSet,
         EndCallConfig::DoubleTap,
      );
      assert_eq!(config.encode(), 0x0000_0320);

      let decoded = CallManagementConfig::decode(0xABCD_E321);
      assert_eq!(decoded.version, 1);
      assert_eq!(decoded.status, CallManagementStatus::EndCallSet);
      assert_eq!(decoded.end_call, EndCallConfig::DoubleTap);
      assert_eq!(decoded.reserved(), 0xABCD_E000);
      assert_eq!(decoded.encode(), 0xABCD_E321);
   }

   #[test]
   fn test_gesture_modes_bytes() {
      let modes = GestureModes {
         right: GestureMode::Siri,
         left: GestureMode::NoiseManagement,
         ..Default::default()
      };
      assert_eq!(modes.encode(), 0x0000_0501);
      assert_eq!(GestureModes::decode(0x0706_0501).prev_left, GestureMode::VolumeDown);
      assert_eq!(GestureModes::decode(0xFF), GestureModes::default());
   }

   #[test]
   fn test_listening_mode_names() {
      assert_eq!("nc".parse::<ListeningMode>().unwrap(), ListeningMode::Anc);
      assert_eq!(ListeningMode::Transparency.to_str(), "transparency");
      assert_eq!(ListeningMode::from_repr(2), Some(ListeningMode::Anc));
      assert_eq!(ListeningMode::from_repr(0), None);
   }

   #[test]
   fn test_double_tap_actions() {
      let actions = DoubleTapActions {
         left: DoubleTapAction::Siri,
         right: DoubleTapAction::Forward,
      };
      assert_eq!(DoubleTapActions::decode(actions.encode()), actions);
   }

   #[test]
   fn test_control_value_codecs() {
      assert_eq!(ControlValue::encode(true), 1);
      assert_eq!(<bool as ControlValue>::decode(2), Some(false));
      assert_eq!(<bool as ControlValue>::decode(7), None);
      assert_eq!(<u8 as ControlValue>::decode(101), None);
      assert_eq!(ControlValue::encode(Duration::from_millis(450)), 450);
      assert_eq!(<ListeningMode as ControlValue>::decode(4), Some(ListeningMode::Adaptive));
   }
}
