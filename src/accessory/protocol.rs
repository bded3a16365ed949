//! Accessory control protocol definitions.
//!
//! Every frame starts with `04 00 04 00`, followed by a little-endian
//! opcode and an opcode-specific payload.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{address::Address, bits::bitset, transport::Packet};

pub const HDR_FRAME: &[u8] = &[0x04, 0x00, 0x04, 0x00];

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Largest frame the control channel carries.
pub const MAX_FRAME: usize = 672;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Opcode(u16);

const KNOWN_OPCODES: &[(Opcode, &str)] = &[
   (Opcode::BATTERY, "battery"),
   (Opcode::IN_EAR, "in_ear"),
   (Opcode::CONTROL, "control"),
   (Opcode::CONTROL_QUERY, "control_query"),
   (Opcode::METADATA, "metadata"),
   (Opcode::CAPABILITIES, "capabilities"),
   (Opcode::SETUP, "setup"),
   (Opcode::RELAY, "relay"),
   (Opcode::PRIORITY_LIST, "priority_list"),
   (Opcode::COMMAND_STATUS, "command_status"),
   (Opcode::CUSTOM, "custom"),
];

impl Opcode {
   pub const BATTERY: Self = Self(0x04);
   pub const IN_EAR: Self = Self(0x06);
   pub const CONTROL: Self = Self(0x09);
   pub const CONTROL_QUERY: Self = Self(0x0A);
   pub const METADATA: Self = Self(0x1D);
   pub const CAPABILITIES: Self = Self(0x2B);
   pub const SETUP: Self = Self(0x30);
   pub const RELAY: Self = Self(0x31);
   pub const PRIORITY_LIST: Self = Self(0x32);
   pub const COMMAND_STATUS: Self = Self(0x33);
   pub const CUSTOM: Self = Self(0x34);

   pub const fn from_raw(raw: u16) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u16 {
      self.0
   }
}

impl fmt::Display for Opcode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match KNOWN_OPCODES.iter().find(|(op, _)| op == self) {
         Some((_, name)) => f.write_str(name),
         None => write!(f, "{:#06x}", self.0),
      }
   }
}

/// One-byte control setting selector.
///
/// Append-only: a retired value is never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ControlType(u8);

pub const KNOWN_CONTROLS: &[(ControlType, &str)] = &[
   (ControlType::LISTENING_MODE, "listening_mode"),
   (ControlType::SWITCH_CONTROL, "switch_control"),
   (ControlType::SINGLE_CLICK, "single_click"),
   (ControlType::DOUBLE_CLICK, "double_click"),
   (ControlType::CLICK_HOLD, "click_hold"),
   (ControlType::DOUBLE_CLICK_INTERVAL, "double_click_interval"),
   (ControlType::CLICK_HOLD_INTERVAL, "click_hold_interval"),
   (ControlType::LISTENING_MODE_CONFIGS, "listening_mode_configs"),
   (ControlType::ONE_BUD_ANC, "one_bud_anc"),
   (ControlType::CROWN_ROTATION, "crown_rotation"),
   (ControlType::LIVE_LISTEN_VERSION, "live_listen_version"),
   (ControlType::AUTO_ANSWER, "auto_answer"),
   (ControlType::CHIME_VOLUME, "chime_volume"),
   (ControlType::MIC_MODE, "mic_mode"),
   (ControlType::IN_EAR_DETECTION, "in_ear_detection"),
   (ControlType::DOUBLE_TAP, "double_tap"),
   (ControlType::VOLUME_SWIPE_INTERVAL, "volume_swipe_interval"),
   (ControlType::CALL_CONFIG, "call_config"),
   (ControlType::VOLUME_SWIPE_MODE, "volume_swipe_mode"),
];

impl ControlType {
   pub const LISTENING_MODE: Self = Self(0x0D);
   pub const SWITCH_CONTROL: Self = Self(0x11);
   pub const SINGLE_CLICK: Self = Self(0x14);
   pub const DOUBLE_CLICK: Self = Self(0x15);
   pub const CLICK_HOLD: Self = Self(0x16);
   pub const DOUBLE_CLICK_INTERVAL: Self = Self(0x17);
   pub const CLICK_HOLD_INTERVAL: Self = Self(0x18);
   pub const LISTENING_MODE_CONFIGS: Self = Self(0x1A);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const CROWN_ROTATION: Self = Self(0x1C);
   pub const LIVE_LISTEN_VERSION: Self = Self(0x1D);
   pub const AUTO_ANSWER: Self = Self(0x1E);
   pub const CHIME_VOLUME: Self = Self(0x1F);
   // 0x20-0x22 fill the platform-specific gap.
   pub const MIC_MODE: Self = Self(0x20);
   pub const IN_EAR_DETECTION: Self = Self(0x21);
   pub const DOUBLE_TAP: Self = Self(0x22);
   pub const VOLUME_SWIPE_INTERVAL: Self = Self(0x23);
   pub const CALL_CONFIG: Self = Self(0x24);
   pub const VOLUME_SWIPE_MODE: Self = Self(0x25);

   /// Sensor detection, EQ and the first volume swipe mode.
   pub const RETIRED: [Self; 3] = [Self(0x0E), Self(0x0F), Self(0x19)];

   pub const fn from_raw(raw: u8) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u8 {
      self.0
   }

   pub fn is_retired(self) -> bool {
      Self::RETIRED.contains(&self)
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      KNOWN_CONTROLS
         .iter()
         .find(|(ty, _)| *ty == self)
         .map(|(_, name)| *name)
   }
}

impl fmt::Display for ControlType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.try_to_str() {
         Some(name) => f.write_str(name),
         None => write!(f, "{:#04x}", self.0),
      }
   }
}

impl FromStr for ControlType {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      if let Some(hex) = s.strip_prefix("0x") {
         return u8::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| strum::ParseError::VariantNotFound);
      }
      KNOWN_CONTROLS
         .iter()
         .find(|(_, name)| name.eq_ignore_ascii_case(s))
         .map(|(ty, _)| *ty)
         .ok_or(strum::ParseError::VariantNotFound)
   }
}

/// Index into the peer's capability bit vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CapabilityBit(u8);

impl CapabilityBit {
   pub const AUTHENTICATION: Self = Self(0x08);
   pub const CERTIFICATES: Self = Self(0x09);
   pub const SWITCH_VOLUME: Self = Self(0x0A);
   pub const EXTENDED_HFP_VOLUME_LIMIT: Self = Self(0x0B);
   pub const VOLUME_CONTROL_BUTTON_CONFIG: Self = Self(0x0C);
   pub const PADDED_PACKETS: Self = Self(0x0D);
   pub const VOLUME_SWIPE: Self = Self(0x0F);
   pub const CASE_INFO_RELAY: Self = Self(0x10);
   pub const CROWN_VOLUME: Self = Self(0x20);
   pub const SPATIAL_AUDIO: Self = Self(0x40);
   pub const CALL_MANAGEMENT_CONFIG: Self = Self(0x50);
   pub const INTERVAL_SETTING: Self = Self(0x80);

   pub const fn from_index(index: u8) -> Self {
      Self(index)
   }

   pub const fn index(self) -> u8 {
      self.0
   }

   /// Word and mask inside a 256-bit vector.
   pub const fn bitpos(self) -> (usize, u64) {
      let idx = self.0 as usize >> 6;
      let mask = 1 << (self.0 as usize & 0x3f);
      (idx, mask)
   }
}

/// Index into the peer's capability integers; independent of `CapabilityBit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CapabilityInteger(u8);

impl CapabilityInteger {
   pub const LIVE_LISTEN_VERSION: Self = Self(0x03);
   pub const SWITCH_CONTROL_VERSION: Self = Self(0x05);
   pub const ENHANCED_TRANSPARENCY_VERSION: Self = Self(0x06);
   pub const CHIME_VOLUME: Self = Self(0x07);
   pub const HP_VERSION: Self = Self(0x30);

   pub const fn from_index(index: u8) -> Self {
      Self(index)
   }

   pub const fn index(self) -> u8 {
      self.0
   }
}

bitset! {
   /// Custom message channels a client can subscribe to.
   pub struct CustomMessageType(u32) {
      const ACOUSTIC = 1 << 0, "acoustic";
      const SCP = 1 << 1, "scp";
      const BUDDY = 1 << 2, "buddy";
      const VIRTUAL_CLI_PRIMARY = 1 << 3, "virtual_cli_primary";
      const VIRTUAL_CLI_SECONDARY = 1 << 4, "virtual_cli_secondary";
      const APP_DIAGNOSTICS = 1 << 5, "app_diagnostics";
      const LOGGING_TRIGGER = 1 << 6, "logging_trigger";
      const DEBUG_DATA = 1 << 7, "debug_data";
      const TOUCH = 1 << 8, "touch";
      const LOG_CONFIG = 1 << 9, "log_config";
      const LOG_MSG = 1 << 10, "log_msg";
      const SENSOR = 1 << 11, "sensor";
      const SWITCH_CONTROL = 1 << 12, "switch_control";
      const MISMATCHED_BUDS = 1 << 13, "mismatched_buds";
      const B2P = 1 << 15, "b2p";
      const CONTINUITY = 1 << 16, "continuity";
      const BATTERY_HEALTH = 1 << 17, "battery_health";
      const SENSOR_V2 = 1 << 18, "sensor_v2";
      const OBC_V2 = 1 << 19, "obc_v2";
      const SENSOR_WX = 1 << 20, "sensor_wx";
   }
}

#[repr(u8)]
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
pub enum SetupType {
   Seal = 0x01,
}

#[repr(u8)]
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
pub enum SetupOp {
   Start = 0x01,
   StartResponse = 0x02,
   Stop = 0x03,
   StopResponse = 0x04,
}

#[repr(u8)]
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
pub enum RelayType {
   AudioArbitration = 0x01,
}

/// Kind of connection-priority-list update.
#[repr(u8)]
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
pub enum PriorityListKind {
   /// Single outstanding; acknowledged by a command-status frame.
   TiPi = 0x01,
   /// Fire and forget.
   LegacyTriangle = 0x02,
}

/// Request types echoed back in command-status frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display)]
pub enum CommandRequest {
   PriorityListTiPi = 0x01,
}

/// Battery-bearing parts of an accessory.
#[repr(u8)]
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
pub enum Component {
   Single = 0x01,
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

#[repr(u8)]
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
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Battery state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

impl Default for BatteryState {
   fn default() -> Self {
      Self::new()
   }
}

/// Battery information for every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub single: BatteryState,
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         single: BatteryState::new(),
         left: BatteryState::new(),
         right: BatteryState::new(),
         case: BatteryState::new(),
      }
   }

   pub fn component_mut(&mut self, component: Component) -> &mut BatteryState {
      match component {
         Component::Single => &mut self.single,
         Component::Left => &mut self.left,
         Component::Right => &mut self.right,
         Component::Case => &mut self.case,
      }
   }

   /// Level the registry reports: the single unit, else the lowest bud.
   pub fn summary_level(&self) -> Option<u8> {
      if self.single.is_available() {
         return Some(self.single.level);
      }
      [self.left, self.right]
         .iter()
         .filter(|s| s.is_available())
         .map(|s| s.level)
         .min()
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
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum InEarState {
   InEar = 0,
   OutOfEar = 1,
   InCase = 2,
   #[default]
   Unknown = 3,
}

/// In-ear state of the primary and secondary bud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InEarStatus {
   pub primary: InEarState,
   pub secondary: InEarState,
}

fn frame(opcode: Opcode, payload: impl IntoIterator<Item = u8>) -> Packet {
   HDR_FRAME
      .iter()
      .copied()
      .chain(opcode.raw().to_le_bytes())
      .chain(payload)
      .collect()
}

pub fn control_frame(ty: ControlType, value: u32) -> Packet {
   frame(Opcode::CONTROL, [ty.raw()].into_iter().chain(value.to_le_bytes()))
}

pub fn control_query_frame(ty: ControlType, subtype: u16) -> Packet {
   frame(
      Opcode::CONTROL_QUERY,
      [ty.raw()].into_iter().chain(subtype.to_le_bytes()),
   )
}

pub fn setup_frame(ty: SetupType, op: u8, payload: &[u8]) -> Packet {
   let len = payload.len() as u16;
   frame(
      Opcode::SETUP,
      [ty as u8, op]
         .into_iter()
         .chain(len.to_le_bytes())
         .chain(payload.iter().copied()),
   )
}

pub fn relay_frame(dest: Address, ty: RelayType, payload: &[u8]) -> Packet {
   let len = payload.len() as u16;
   frame(
      Opcode::RELAY,
      dest
         .octets()
         .into_iter()
         .chain([ty as u8])
         .chain(len.to_le_bytes())
         .chain(payload.iter().copied()),
   )
}

pub fn priority_list_frame(kind: PriorityListKind, list: &[Address]) -> Packet {
   frame(
      Opcode::PRIORITY_LIST,
      [kind as u8, list.len() as u8]
         .into_iter()
         .chain(list.iter().flat_map(|a| a.octets())),
   )
}

pub fn custom_frame(ty: CustomMessageType, payload: &[u8]) -> Packet {
   frame(
      Opcode::CUSTOM,
      ty.bits().to_le_bytes().into_iter().chain(payload.iter().copied()),
   )
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_control_frame_layout() {
      let pkt = control_frame(ControlType::LISTENING_MODE, 2);
      assert_eq!(
         &pkt[..],
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x02, 0x00, 0x00, 0x00]
      );
      let pkt = control_query_frame(ControlType::CHIME_VOLUME, 0x0102);
      assert_eq!(&pkt[4..], &[0x0A, 0x00, 0x1F, 0x02, 0x01]);
   }

   #[test]
   fn test_control_type_names() {
      assert_eq!(ControlType::SWITCH_CONTROL.to_string(), "switch_control");
      assert_eq!(ControlType::from_raw(0x30).to_string(), "0x30");
      assert_eq!(
         "call_config".parse::<ControlType>().unwrap(),
         ControlType::CALL_CONFIG
      );
      assert_eq!("0x0e".parse::<ControlType>().unwrap(), ControlType::RETIRED[0]);
      for (ty, _) in KNOWN_CONTROLS {
         assert!(!ty.is_retired(), "{ty} reuses a retired value");
      }
   }

   #[test]
   fn test_setup_and_relay_frames() {
      let pkt = setup_frame(SetupType::Seal, SetupOp::Start as u8, &[9, 8]);
      assert_eq!(&pkt[6..], &[0x01, 0x01, 0x02, 0x00, 9, 8]);
      let dest = Address::new([1, 2, 3, 4, 5, 6]);
      let pkt = relay_frame(dest, RelayType::AudioArbitration, &[7]);
      assert_eq!(&pkt[6..], &[1, 2, 3, 4, 5, 6, 0x01, 0x01, 0x00, 7]);
   }

   #[test]
   fn test_battery_summary() {
      let mut info = BatteryInfo::new();
      assert_eq!(info.summary_level(), None);
      *info.component_mut(Component::Left) = BatteryState {
         level: 70,
         status: BatteryStatus::Discharging,
      };
      *info.component_mut(Component::Right) = BatteryState {
         level: 40,
         status: BatteryStatus::Normal,
      };
      assert_eq!(info.summary_level(), Some(40));
   }
}
