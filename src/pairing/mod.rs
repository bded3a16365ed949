//! Pairing agents.
//!
//! An agent answers incoming pairing requests while started and drives
//! outgoing ones through `pair`. Each attempt walks one negotiation (PIN,
//! numeric comparison, passkey display or out-of-band data) to exactly one
//! `AttemptComplete`. Key material lands in the registry before that event
//! is delivered.

use std::{
   collections::{BTreeMap, HashMap},
   sync::{Arc, Weak},
   time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   address::Address,
   error::{ErrorKind, Result},
   event::Sink,
   registry::{DeviceHandle, LinkKey, Provenance, Registry},
   services::ServiceMask,
   session::Shared,
   transport::{PairingFailure, PairingParams, PairingReply, PairingRequest},
};

/// Longest accepted pincode, in bytes.
pub const MAX_PINCODE_LEN: usize = 16;

/// Local input/output capability offered during negotiation.
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
#[serde(rename_all = "snake_case")]
pub enum IoCapability {
   DisplayOnly = 0x00,
   #[default]
   DisplayYesNo = 0x01,
   KeyboardOnly = 0x02,
   NoInputNoOutput = 0x03,
}

/// Confirm and random values for one curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobPair {
   pub confirm: [u8; 16],
   pub random: [u8; 16],
}

/// Remote out-of-band data seeded before pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OobData {
   pub p192: Option<OobPair>,
   pub p256: Option<OobPair>,
}

impl OobData {
   pub const fn is_empty(&self) -> bool {
      self.p192.is_none() && self.p256.is_none()
   }
}

/// Locally generated out-of-band data for both curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOobData {
   pub p192: OobPair,
   pub p256: OobPair,
}

/// Caller answer to a confirmation or passkey display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SspResponse {
   Accept,
   Reject,
}

/// Negotiation phase a timeout is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PairingPhase {
   /// Waiting for the user to confirm or enter a value.
   Confirmation,
   /// Waiting for the peer to finish the DHKey check.
   DhKeyCheck,
   Overall,
}

/// Terminal result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PairingResult {
   Success,
   UserDenied,
   Timeout(PairingPhase),
   ConfirmValueMismatch,
   CryptoFailure,
   TooManyAttempts,
   Cancelled,
   AuthenticationFailure,
   PeerRemovedPairing,
}

impl PairingResult {
   pub const fn is_success(self) -> bool {
      matches!(self, Self::Success)
   }

   /// Historical result code; 0 for success.
   pub const fn code(self) -> i32 {
      match self {
         Self::Success => 0,
         Self::UserDenied => 154,
         Self::Timeout(PairingPhase::Confirmation) => 172,
         Self::Timeout(PairingPhase::DhKeyCheck) => 173,
         Self::Timeout(PairingPhase::Overall) => 171,
         Self::ConfirmValueMismatch => 170,
         Self::CryptoFailure => 176,
         Self::TooManyAttempts => 166,
         Self::Cancelled => 161,
         Self::AuthenticationFailure => 158,
         Self::PeerRemovedPairing => 179,
      }
   }

   /// Whether the result counts toward the consecutive failure limit.
   const fn counts_as_failure(self) -> bool {
      !matches!(self, Self::Success | Self::UserDenied | Self::Cancelled)
   }

   fn from_failure(failure: PairingFailure, phase: PairingPhase) -> Self {
      match failure {
         PairingFailure::UserDenied => Self::UserDenied,
         PairingFailure::Timeout => Self::Timeout(phase),
         PairingFailure::ConfirmValueMismatch => Self::ConfirmValueMismatch,
         PairingFailure::CryptoFailure => Self::CryptoFailure,
         PairingFailure::AuthenticationFailure => Self::AuthenticationFailure,
         PairingFailure::PeerRemovedPairing => Self::PeerRemovedPairing,
         PairingFailure::Cancelled => Self::Cancelled,
      }
   }
}

/// Agent state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AgentState {
   Stopped,
   Idle,
   Negotiating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
   AgentStarted,
   AgentStopped,
   AttemptStarted(DeviceHandle),
   AttemptComplete {
      device: DeviceHandle,
      result: PairingResult,
   },
   PincodeRequest {
      device: DeviceHandle,
      min_length: u8,
   },
   /// `mitm` set means the user must compare `value` with the peer's display.
   UserConfirmation {
      device: DeviceHandle,
      value: u32,
      mitm: bool,
   },
   PasskeyDisplay {
      device: DeviceHandle,
      value: u32,
   },
   AuthorizationRequest {
      device: DeviceHandle,
      services: ServiceMask,
   },
   /// `None` when the controller could not produce the data.
   LocalOobDataReady(Option<LocalOobData>),
}

/// Error type for pairing operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
   #[error("A pairing agent is already started")]
   AgentAlreadyStarted,

   #[error("Pairing agent not started")]
   AgentNotStarted,

   #[error("Pairing already in progress")]
   AlreadyInProgress,

   #[error("Device already paired")]
   AlreadyPaired,

   #[error("No pairing attempt for this device")]
   NoAttempt,

   #[error("Attempt is not waiting for this response")]
   UnexpectedResponse,

   #[error("Pincode shorter than {min} bytes")]
   PincodeSize { min: u8 },

   #[error("Invalid pincode")]
   InvalidPincode,

   #[error("OOB data already set for this device")]
   OobDataAlreadyExists,

   #[error("Too many failed pairing attempts")]
   TooManyAttempts,

   #[error("A request is already pending")]
   ResponsePending,
}

impl PairingError {
   pub const fn kind(&self) -> ErrorKind {
      match self {
         Self::PincodeSize { .. } | Self::InvalidPincode => ErrorKind::Argument,
         Self::TooManyAttempts => ErrorKind::Security,
         _ => ErrorKind::State,
      }
   }

   pub const fn code(&self) -> i32 {
      match self {
         Self::AgentAlreadyStarted => 160,
         Self::AgentNotStarted => 162,
         Self::AlreadyInProgress => 164,
         Self::AlreadyPaired => 168,
         Self::NoAttempt => 165,
         Self::UnexpectedResponse => 3,
         Self::PincodeSize { .. } => 159,
         Self::InvalidPincode => 156,
         Self::OobDataAlreadyExists => 177,
         Self::TooManyAttempts => 166,
         Self::ResponsePending => 10,
      }
   }
}

/// Empty means "no PIN"; otherwise at least `min_len` and at most 16 bytes.
pub(crate) fn validate_pincode(pin: &str, min_len: usize) -> std::result::Result<(), PairingError> {
   if pin.len() > MAX_PINCODE_LEN {
      return Err(PairingError::InvalidPincode);
   }
   if !pin.is_empty() && pin.len() < min_len {
      return Err(PairingError::PincodeSize {
         min: min_len.min(MAX_PINCODE_LEN) as u8,
      });
   }
   Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
   /// Negotiation running without local input.
   Negotiating,
   AwaitingPin { min_len: u8 },
   AwaitingConfirmation,
   DhKeyCheck,
}

struct Attempt {
   address: Address,
   stage: Stage,
   phase: PairingPhase,
   deadline: Instant,
   overall: Instant,
   /// PIN supplied for this attempt, held until the peer asks for one.
   pincode: Option<SmolStr>,
}

impl Attempt {
   fn new(address: Address, now: Instant, overall: Duration) -> Self {
      Self {
         address,
         stage: Stage::Negotiating,
         phase: PairingPhase::Overall,
         deadline: now + overall,
         overall: now + overall,
         pincode: None,
      }
   }

   /// Moves to `stage`, bounded by the overall deadline.
   fn arm(&mut self, stage: Stage, phase: PairingPhase, timeout: Duration, now: Instant) {
      self.stage = stage;
      let deadline = now + timeout;
      if deadline >= self.overall {
         self.deadline = self.overall;
         self.phase = PairingPhase::Overall;
      } else {
         self.deadline = deadline;
         self.phase = phase;
      }
   }
}

struct Authorization {
   address: Address,
   services: ServiceMask,
   deadline: Instant,
}

#[derive(Default)]
struct CoreState {
   started: bool,
   io_capability: IoCapability,
   oob: HashMap<DeviceHandle, OobData>,
   attempts: BTreeMap<DeviceHandle, Attempt>,
   authorizations: HashMap<DeviceHandle, Authorization>,
   local_oob_pending: bool,
}

struct PairingCore {
   sink: Sink<PairingEvent>,
   state: Mutex<CoreState>,
}

/// Session-wide pairing state shared by all agents.
pub(crate) struct PairingHub {
   shared: Arc<Shared>,
   registry: Arc<Registry>,
   agents: Mutex<Vec<Weak<PairingCore>>>,
   failures: Mutex<HashMap<DeviceHandle, u32>>,
}

impl PairingHub {
   pub(crate) fn new(shared: Arc<Shared>, registry: Arc<Registry>) -> Self {
      Self {
         shared,
         registry,
         agents: Mutex::new(Vec::new()),
         failures: Mutex::new(HashMap::new()),
      }
   }

   fn agents(&self) -> Vec<Arc<PairingCore>> {
      let mut agents = self.agents.lock();
      agents.retain(|a| a.strong_count() > 0);
      agents.iter().filter_map(Weak::upgrade).collect()
   }

   fn post(&self, core: &PairingCore, event: PairingEvent) {
      self.shared.queue.post(&core.sink, event);
   }

   fn started(&self) -> Option<Arc<PairingCore>> {
      self.agents().into_iter().find(|a| a.state.lock().started)
   }

   /// Agent running an attempt against `device`.
   fn owner(&self, device: DeviceHandle) -> Option<Arc<PairingCore>> {
      self
         .agents()
         .into_iter()
         .find(|a| a.state.lock().attempts.contains_key(&device))
   }

   fn too_many_failures(&self, device: DeviceHandle) -> bool {
      let failures = self.failures.lock().get(&device).copied().unwrap_or(0);
      failures >= self.shared.config.max_pairing_attempts
   }

   fn record_result(&self, device: DeviceHandle, result: PairingResult) {
      let mut failures = self.failures.lock();
      if result.is_success() {
         failures.remove(&device);
      } else if result.counts_as_failure() {
         *failures.entry(device).or_default() += 1;
      }
   }

   /// Removes the attempt and reports its result.
   fn finish(&self, core: &PairingCore, state: &mut CoreState, device: DeviceHandle, result: PairingResult) {
      let Some(attempt) = state.attempts.remove(&device) else {
         return;
      };
      self.record_result(device, result);
      info!("{}: pairing attempt complete: {result}", attempt.address);
      self.post(core, PairingEvent::AttemptComplete { device, result });
   }

   fn reply(&self, address: Address, reply: PairingReply) {
      if let Err(e) = self.shared.transport.reply(address, reply) {
         warn!("{address}: failed to answer pairing request: {e}");
      }
   }

   pub(crate) fn on_pairing_requested(&self, address: Address) {
      let device = self.registry.ensure_device(address);
      let Some(core) = self.started() else {
         debug!("{address}: no pairing agent started, rejecting");
         self.reply(address, PairingReply::Reject);
         return;
      };
      if self.owner(device).is_some() {
         warn!("{address}: pairing already in progress, rejecting second request");
         self.reply(address, PairingReply::Reject);
         return;
      }

      let mut state = core.state.lock();
      // A local `pair` may have started between the owner check and the lock.
      if state.attempts.contains_key(&device) {
         warn!("{address}: pairing already in progress, rejecting second request");
         self.reply(address, PairingReply::Reject);
         return;
      }
      if self.too_many_failures(device) {
         warn!("{address}: too many failed attempts, rejecting");
         self.reply(address, PairingReply::Reject);
         self.post(&core, PairingEvent::AttemptStarted(device));
         self.post(&core, PairingEvent::AttemptComplete {
            device,
            result: PairingResult::TooManyAttempts,
         });
         return;
      }
      let params = PairingParams {
         io_capability: state.io_capability,
         oob: state.oob.get(&device).copied(),
      };
      self.reply(address, PairingReply::Accept(params));
      let attempt = Attempt::new(address, Instant::now(), self.shared.config.pairing_overall_timeout());
      state.attempts.insert(device, attempt);
      info!("{address}: incoming pairing attempt started");
      self.post(&core, PairingEvent::AttemptStarted(device));
   }

   pub(crate) fn on_pairing(&self, address: Address, request: PairingRequest) {
      let Some(device) = self.registry.lookup_address(address) else {
         debug!("{address}: pairing request for unknown device");
         return;
      };
      let now = Instant::now();
      let config = &self.shared.config;

      if let PairingRequest::Authorization { services } = request {
         let Some(core) = self.owner(device).or_else(|| self.started()) else {
            debug!("{address}: no pairing agent for authorization, denying");
            self.reply(address, PairingReply::Authorize(ServiceMask::empty()));
            return;
         };
         let mut state = core.state.lock();
         state.authorizations.insert(device, Authorization {
            address,
            services,
            deadline: now + config.pairing_user_timeout(),
         });
         self.post(&core, PairingEvent::AuthorizationRequest { device, services });
         return;
      }

      let Some(core) = self.owner(device) else {
         debug!("{address}: ignoring {request:?} outside an attempt");
         return;
      };
      let mut state = core.state.lock();
      let Some(attempt) = state.attempts.get_mut(&device) else {
         return;
      };
      match request {
         PairingRequest::PinCode { min_len } => {
            let supplied = attempt
               .pincode
               .clone()
               .or_else(|| self.registry.pincode(device));
            if let Some(pin) = supplied
               && validate_pincode(&pin, min_len.into()).is_ok()
            {
               debug!("{address}: answering PIN request with supplied pincode");
               attempt.arm(Stage::Negotiating, PairingPhase::Overall, config.pairing_overall_timeout(), now);
               attempt.pincode = Some(pin.clone());
               self.reply(address, PairingReply::PinCode(pin));
               return;
            }
            attempt.pincode = None;
            attempt.arm(
               Stage::AwaitingPin { min_len },
               PairingPhase::Confirmation,
               config.pairing_user_timeout(),
               now,
            );
            self.post(&core, PairingEvent::PincodeRequest {
               device,
               min_length: min_len,
            });
         },
         PairingRequest::Confirmation { value, mitm } => {
            attempt.arm(
               Stage::AwaitingConfirmation,
               PairingPhase::Confirmation,
               config.pairing_user_timeout(),
               now,
            );
            self.post(&core, PairingEvent::UserConfirmation { device, value, mitm });
         },
         PairingRequest::PasskeyDisplay { value } => {
            attempt.arm(
               Stage::AwaitingConfirmation,
               PairingPhase::Confirmation,
               config.pairing_user_timeout(),
               now,
            );
            self.post(&core, PairingEvent::PasskeyDisplay { device, value });
         },
         PairingRequest::Authorization { .. } => {},
      }
   }

   /// Returns the device and whether pairing succeeded.
   pub(crate) fn on_pairing_complete(
      &self,
      address: Address,
      status: std::result::Result<Option<LinkKey>, PairingFailure>,
   ) -> Option<(DeviceHandle, bool)> {
      let device = self.registry.lookup_address(address)?;
      let Some(core) = self.owner(device) else {
         debug!("{address}: completion for no attempt ignored");
         return None;
      };
      let mut state = core.state.lock();
      let phase = state.attempts.get(&device)?.phase;
      let result = match status {
         Ok(key) => {
            if let Err(e) = self.registry.store_pairing(device, key, Provenance::Normal) {
               warn!("{address}: failed to persist pairing: {e}");
            }
            state.oob.remove(&device);
            PairingResult::Success
         },
         Err(failure) => PairingResult::from_failure(failure, phase),
      };
      self.finish(&core, &mut state, device, result);
      Some((device, result.is_success()))
   }

   pub(crate) fn on_local_oob(&self, data: Option<LocalOobData>) {
      for core in self.agents() {
         let mut state = core.state.lock();
         if state.local_oob_pending {
            state.local_oob_pending = false;
            self.post(&core, PairingEvent::LocalOobDataReady(data));
         }
      }
   }

   pub(crate) fn tick(&self, now: Instant) {
      for core in self.agents() {
         let mut state = core.state.lock();
         let expired: Vec<_> = state
            .attempts
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(d, a)| (*d, a.address, a.phase))
            .collect();
         for (device, address, phase) in expired {
            warn!("{address}: pairing timed out ({phase})");
            if let Err(e) = self.shared.transport.cancel_pairing(address) {
               warn!("{address}: failed to cancel timed out pairing: {e}");
            }
            self.finish(&core, &mut state, device, PairingResult::Timeout(phase));
         }

         let denied: Vec<_> = state
            .authorizations
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(d, a)| (*d, a.address))
            .collect();
         for (device, address) in denied {
            warn!("{address}: authorization request timed out, denying");
            state.authorizations.remove(&device);
            self.reply(address, PairingReply::Authorize(ServiceMask::empty()));
         }
      }
   }

   /// Drops every attempt after the transport went away.
   pub(crate) fn shutdown(&self) {
      for core in self.agents() {
         let mut state = core.state.lock();
         let devices: Vec<_> = state.attempts.keys().copied().collect();
         for device in devices {
            self.finish(&core, &mut state, device, PairingResult::Cancelled);
         }
         state.authorizations.clear();
         state.local_oob_pending = false;
      }
   }
}

/// Pairing agent. Dropping a started agent stops it.
pub struct PairingAgent {
   hub: Arc<PairingHub>,
   core: Arc<PairingCore>,
}

impl PairingAgent {
   pub(crate) fn new(hub: Arc<PairingHub>, sink: Sink<PairingEvent>) -> Self {
      let core = Arc::new(PairingCore {
         sink,
         state: Mutex::new(CoreState::default()),
      });
      hub.agents.lock().push(Arc::downgrade(&core));
      Self { hub, core }
   }

   pub fn state(&self) -> AgentState {
      let state = self.core.state.lock();
      if !state.started {
         AgentState::Stopped
      } else if state.attempts.is_empty() {
         AgentState::Idle
      } else {
         AgentState::Negotiating
      }
   }

   /// Starts accepting incoming pairing requests. One started agent per session.
   pub fn start(&self) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      if self.hub.started().is_some() {
         return Err(PairingError::AgentAlreadyStarted.into());
      }
      let mut state = self.core.state.lock();
      state.started = true;
      info!("Pairing agent started");
      self.hub.post(&self.core, PairingEvent::AgentStarted);
      Ok(())
   }

   /// Stops the agent, cancelling attempts in flight.
   pub fn stop(&self) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      if !state.started {
         return Err(PairingError::AgentNotStarted.into());
      }
      self.cancel_all(&mut state);
      state.started = false;
      info!("Pairing agent stopped");
      self.hub.post(&self.core, PairingEvent::AgentStopped);
      Ok(())
   }

   fn cancel_all(&self, state: &mut CoreState) {
      let attempts: Vec<_> = state.attempts.iter().map(|(d, a)| (*d, a.address)).collect();
      for (device, address) in attempts {
         if let Err(e) = self.hub.shared.transport.cancel_pairing(address) {
            warn!("{address}: failed to cancel pairing: {e}");
         }
         self.hub.finish(&self.core, state, device, PairingResult::Cancelled);
      }
      for (_, auth) in state.authorizations.drain() {
         self
            .hub
            .reply(auth.address, PairingReply::Authorize(ServiceMask::empty()));
      }
   }

   /// Applies to attempts that begin after this call.
   pub fn set_io_capability(&self, capability: IoCapability) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      self.core.state.lock().io_capability = capability;
      Ok(())
   }

   pub fn io_capability(&self) -> IoCapability {
      self.core.state.lock().io_capability
   }

   /// Starts an outgoing attempt.
   pub fn pair(&self, device: DeviceHandle) -> Result<()> {
      let address = self.hub.registry.address(device)?;
      if self.hub.registry.pairing_status(device)? {
         return Err(PairingError::AlreadyPaired.into());
      }
      if self.hub.owner(device).is_some() {
         return Err(PairingError::AlreadyInProgress.into());
      }
      if self.hub.too_many_failures(device) {
         return Err(PairingError::TooManyAttempts.into());
      }
      let mut state = self.core.state.lock();
      if !state.started {
         return Err(PairingError::AgentNotStarted.into());
      }
      if state.attempts.contains_key(&device) {
         return Err(PairingError::AlreadyInProgress.into());
      }
      let params = PairingParams {
         io_capability: state.io_capability,
         oob: state.oob.get(&device).copied(),
      };
      self.hub.shared.transport.pair(address, params)?;
      let attempt = Attempt::new(
         address,
         Instant::now(),
         self.hub.shared.config.pairing_overall_timeout(),
      );
      state.attempts.insert(device, attempt);
      info!("{address}: outgoing pairing attempt started");
      self.hub.post(&self.core, PairingEvent::AttemptStarted(device));
      Ok(())
   }

   /// Cancels the attempt against `device`. Nothing else is reported for it.
   pub fn cancel_pairing(&self, device: DeviceHandle) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      let address = state
         .attempts
         .get(&device)
         .map(|a| a.address)
         .ok_or(PairingError::NoAttempt)?;
      self.hub.finish(&self.core, &mut state, device, PairingResult::Cancelled);
      self.hub.shared.transport.cancel_pairing(address)
   }

   /// Answers a pincode request. The empty string means "no PIN".
   ///
   /// Called before the peer asks, the PIN is held by the attempt and sent
   /// once the request arrives, provided it meets the requested length.
   pub fn set_pincode(&self, device: DeviceHandle, pincode: &str) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      let attempt = state.attempts.get_mut(&device).ok_or(PairingError::NoAttempt)?;
      let min_len = match attempt.stage {
         Stage::AwaitingPin { min_len } => min_len,
         Stage::Negotiating if attempt.pincode.is_none() => {
            validate_pincode(pincode, 0)?;
            debug!("{}: pincode held until requested", attempt.address);
            attempt.pincode = Some(SmolStr::new(pincode));
            return Ok(());
         },
         _ => return Err(PairingError::UnexpectedResponse.into()),
      };
      validate_pincode(pincode, min_len.into())?;
      let pincode = SmolStr::new(pincode);
      self
         .hub
         .shared
         .transport
         .reply(attempt.address, PairingReply::PinCode(pincode.clone()))?;
      let timeout = self.hub.shared.config.pairing_overall_timeout();
      attempt.arm(Stage::Negotiating, PairingPhase::Overall, timeout, Instant::now());
      attempt.pincode = Some(pincode);
      Ok(())
   }

   /// Answers a user confirmation or passkey display.
   pub fn accept_ssp(&self, device: DeviceHandle, response: SspResponse) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      let attempt = state.attempts.get_mut(&device).ok_or(PairingError::NoAttempt)?;
      if attempt.stage != Stage::AwaitingConfirmation {
         return Err(PairingError::UnexpectedResponse.into());
      }
      let address = attempt.address;
      let accepted = response == SspResponse::Accept;
      self
         .hub
         .shared
         .transport
         .reply(address, PairingReply::Confirm(accepted))?;
      if accepted {
         let timeout = self.hub.shared.config.pairing_dhkey_timeout();
         attempt.arm(Stage::DhKeyCheck, PairingPhase::DhKeyCheck, timeout, Instant::now());
      } else {
         self.hub.finish(&self.core, &mut state, device, PairingResult::UserDenied);
      }
      Ok(())
   }

   /// Answers an authorization request; granted services become authorized.
   pub fn reply_authorization(&self, device: DeviceHandle, granted: bool) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let auth = self
         .core
         .state
         .lock()
         .authorizations
         .remove(&device)
         .ok_or(PairingError::NoAttempt)?;
      let services = if granted {
         auth.services
      } else {
         ServiceMask::empty()
      };
      if granted {
         self.hub.registry.grant_services(device, services)?;
      }
      let verdict = if granted { "granted" } else { "denied" };
      info!("{}: authorization for {} {verdict}", auth.address, auth.services);
      self
         .hub
         .shared
         .transport
         .reply(auth.address, PairingReply::Authorize(services))
   }

   /// Seeds remote OOB data used by the next attempt against `device`.
   pub fn set_oob_data(&self, device: DeviceHandle, data: OobData) -> Result<()> {
      self.hub.registry.address(device)?;
      if data.is_empty() {
         return Err(crate::error::Error::InvalidArgument("empty OOB data"));
      }
      let mut state = self.core.state.lock();
      if state.oob.contains_key(&device) {
         return Err(PairingError::OobDataAlreadyExists.into());
      }
      state.oob.insert(device, data);
      Ok(())
   }

   pub fn clear_oob_data(&self, device: DeviceHandle) -> Result<()> {
      self.hub.registry.address(device)?;
      self.core.state.lock().oob.remove(&device);
      Ok(())
   }

   /// Requests local OOB data, delivered as `LocalOobDataReady`.
   pub fn read_local_oob_data(&self) -> Result<()> {
      self.hub.shared.ensure_attached()?;
      let mut state = self.core.state.lock();
      if state.local_oob_pending {
         return Err(PairingError::ResponsePending.into());
      }
      self.hub.shared.transport.read_local_oob()?;
      state.local_oob_pending = true;
      Ok(())
   }

   /// Purges key material and pairing flags. Idempotent.
   pub fn delete_paired_device(&self, device: DeviceHandle) -> Result<()> {
      let address = self.hub.registry.address(device)?;
      let was_paired = self.hub.registry.unpair(device)?;
      self.hub.failures.lock().remove(&device);
      self.core.state.lock().oob.remove(&device);
      if was_paired {
         info!("{address}: pairing deleted");
         self.hub.shared.transport.remove_bond(address)?;
      }
      Ok(())
   }
}

impl Drop for PairingAgent {
   fn drop(&mut self) {
      let mut state = self.core.state.lock();
      if state.started && self.hub.shared.ensure_attached().is_ok() {
         self.cancel_all(&mut state);
      }
      state.started = false;
      drop(state);
      self
         .hub
         .agents
         .lock()
         .retain(|a| !std::ptr::eq(a.as_ptr(), Arc::as_ptr(&self.core)));
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc::UnboundedReceiver;

   use super::*;
   use crate::{
      error::Error,
      session::Session,
      testing,
      transport::{MemoryTransport, Request, TransportEvent},
   };

   const SENSOR: Address = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   struct Rig {
      session: Session,
      transport: Arc<MemoryTransport>,
      agent: PairingAgent,
      rx: UnboundedReceiver<PairingEvent>,
   }

   async fn rig(name: &str) -> Rig {
      let (session, transport, _events) = testing::attach_memory(name).await;
      let (sink, mut rx) = testing::collector();
      let agent = session.create_pairing_agent(sink);
      agent.start().unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AgentStarted);
      Rig {
         session,
         transport,
         agent,
         rx,
      }
   }

   fn request(transport: &MemoryTransport, request: PairingRequest) {
      transport.inject(TransportEvent::Pairing {
         address: SENSOR,
         request,
      });
   }

   fn complete(transport: &MemoryTransport, status: std::result::Result<Option<LinkKey>, PairingFailure>) {
      transport.inject(TransportEvent::PairingComplete {
         address: SENSOR,
         status,
      });
   }

   #[test]
   fn test_validate_pincode() {
      assert!(validate_pincode("", 4).is_ok());
      assert!(validate_pincode("0000", 4).is_ok());
      assert_eq!(validate_pincode("12", 4), Err(PairingError::PincodeSize { min: 4 }));
      assert_eq!(
         validate_pincode("12345678901234567", 0),
         Err(PairingError::InvalidPincode)
      );
   }

   #[tokio::test]
   async fn test_registered_pincode_and_key_readback() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-pin-auto").await;
      let registry = session.registry();
      let device = registry.register_device(SENSOR, "Sensor", 0, "0000").unwrap();
      assert!(!registry.pairing_status(device).unwrap());

      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      assert_eq!(agent.state(), AgentState::Negotiating);
      assert!(transport.requests().contains(&Request::Pair(SENSOR, PairingParams {
         io_capability: IoCapability::DisplayYesNo,
         oob: None,
      })));

      request(&transport, PairingRequest::PinCode { min_len: 4 });
      let key = LinkKey::from_bytes([0x5A; 16]);
      complete(&transport, Ok(Some(key.clone())));
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Success
         }
      );
      assert!(
         transport
            .requests()
            .contains(&Request::Reply(SENSOR, PairingReply::PinCode("0000".into())))
      );
      assert!(registry.pairing_status(device).unwrap());
      assert_eq!(registry.link_key(device).unwrap(), key);
      assert_eq!(agent.state(), AgentState::Idle);
   }

   #[tokio::test]
   async fn test_provisional_key_survives_pairing() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-provisional").await;
      let registry = session.registry();
      let key = registry.generate_key(SENSOR).unwrap();
      let device = registry
         .set_key(SENSOR, "Sensor", 0, ServiceMask::SENSOR, key.clone())
         .unwrap();
      agent.pair(device).unwrap();
      complete(&transport, Ok(None));
      loop {
         if let PairingEvent::AttemptComplete { result, .. } = testing::recv(&mut rx).await {
            assert_eq!(result, PairingResult::Success);
            break;
         }
      }
      assert_eq!(registry.link_key(device).unwrap().as_bytes(), key.as_bytes());
   }

   #[tokio::test]
   async fn test_manual_pincode_flow() {
      let Rig {
         session: _session,
         transport,
         agent,
         mut rx,
      } = rig("pair-pin-manual").await;
      transport.inject(TransportEvent::PairingRequested { address: SENSOR });
      let PairingEvent::AttemptStarted(device) = testing::recv(&mut rx).await else {
         panic!("expected attempt");
      };
      request(&transport, PairingRequest::PinCode { min_len: 6 });
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::PincodeRequest {
            device,
            min_length: 6
         }
      );
      assert!(matches!(
         agent.set_pincode(device, "123"),
         Err(Error::Pairing(PairingError::PincodeSize { min: 6 }))
      ));
      assert!(matches!(
         agent.set_pincode(device, "12345678901234567"),
         Err(Error::Pairing(PairingError::InvalidPincode))
      ));
      agent.set_pincode(device, "123456").unwrap();
      assert!(matches!(
         agent.set_pincode(device, "123456"),
         Err(Error::Pairing(PairingError::UnexpectedResponse))
      ));
      complete(&transport, Err(PairingFailure::AuthenticationFailure));
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::AuthenticationFailure
         }
      );
   }

   #[tokio::test]
   async fn test_pincode_supplied_before_request() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-pin-early").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      assert!(matches!(
         agent.set_pincode(device, "12345678901234567"),
         Err(Error::Pairing(PairingError::InvalidPincode))
      ));
      agent.set_pincode(device, "4321").unwrap();
      assert!(matches!(
         agent.set_pincode(device, "8765"),
         Err(Error::Pairing(PairingError::UnexpectedResponse))
      ));

      request(&transport, PairingRequest::PinCode { min_len: 4 });
      complete(&transport, Ok(None));
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Success
         }
      );
      assert!(
         transport
            .requests()
            .contains(&Request::Reply(SENSOR, PairingReply::PinCode("4321".into())))
      );
   }

   #[tokio::test]
   async fn test_short_early_pincode_falls_back_to_request() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-pin-short").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      agent.set_pincode(device, "12").unwrap();
      request(&transport, PairingRequest::PinCode { min_len: 4 });
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::PincodeRequest {
            device,
            min_length: 4
         }
      );
      agent.set_pincode(device, "1234").unwrap();
      assert!(
         !transport
            .requests()
            .contains(&Request::Reply(SENSOR, PairingReply::PinCode("12".into())))
      );
   }

   #[tokio::test]
   async fn test_just_works_confirmation_is_reported() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-just-works").await;
      agent.set_io_capability(IoCapability::NoInputNoOutput).unwrap();
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      request(&transport, PairingRequest::Confirmation {
         value: 0,
         mitm: false,
      });
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::UserConfirmation {
            device,
            value: 0,
            mitm: false
         }
      );
      assert!(
         transport
            .requests()
            .iter()
            .all(|r| !matches!(r, Request::Reply(_, PairingReply::Confirm(_))))
      );
      agent.accept_ssp(device, SspResponse::Accept).unwrap();
      assert!(
         transport
            .requests()
            .contains(&Request::Reply(SENSOR, PairingReply::Confirm(true)))
      );
   }

   #[tokio::test]
   async fn test_incoming_request_during_local_attempt() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-incoming-dup").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      transport.inject(TransportEvent::PairingRequested { address: SENSOR });
      complete(&transport, Ok(None));
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Success
         }
      );
      assert!(
         transport
            .requests()
            .contains(&Request::Reply(SENSOR, PairingReply::Reject))
      );
   }

   #[tokio::test]
   async fn test_confirmation_then_dhkey_timeout() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-ssp").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      request(&transport, PairingRequest::Confirmation {
         value: 123_456,
         mitm: true,
      });
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::UserConfirmation {
            device,
            value: 123_456,
            mitm: true
         }
      );
      agent.accept_ssp(device, SspResponse::Accept).unwrap();
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Timeout(PairingPhase::DhKeyCheck)
         }
      );
      let requests = transport.requests();
      assert!(requests.contains(&Request::Reply(SENSOR, PairingReply::Confirm(true))));
      assert!(requests.contains(&Request::CancelPairing(SENSOR)));
   }

   #[tokio::test]
   async fn test_passkey_display_rejected() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-passkey").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      request(&transport, PairingRequest::PasskeyDisplay { value: 42 });
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::PasskeyDisplay { device, value: 42 }
      );
      agent.accept_ssp(device, SspResponse::Reject).unwrap();
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::UserDenied
         }
      );
      // The late failure report from the link layer is swallowed.
      complete(&transport, Err(PairingFailure::UserDenied));
      testing::settle().await;
      assert!(rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_oob_and_io_capability_snapshot() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-oob").await;
      let device = session.registry().ensure_device(SENSOR);
      let data = OobData {
         p192: None,
         p256: Some(OobPair {
            confirm: [1; 16],
            random: [2; 16],
         }),
      };
      agent.set_oob_data(device, data).unwrap();
      assert!(matches!(
         agent.set_oob_data(device, data),
         Err(Error::Pairing(PairingError::OobDataAlreadyExists))
      ));
      agent.set_io_capability(IoCapability::NoInputNoOutput).unwrap();
      agent.pair(device).unwrap();
      agent.set_io_capability(IoCapability::KeyboardOnly).unwrap();
      assert!(transport.requests().contains(&Request::Pair(SENSOR, PairingParams {
         io_capability: IoCapability::NoInputNoOutput,
         oob: Some(data),
      })));

      agent.read_local_oob_data().unwrap();
      assert!(matches!(
         agent.read_local_oob_data(),
         Err(Error::Pairing(PairingError::ResponsePending))
      ));
      let local = LocalOobData {
         p192: OobPair {
            confirm: [3; 16],
            random: [4; 16],
         },
         p256: OobPair {
            confirm: [5; 16],
            random: [6; 16],
         },
      };
      transport.inject(TransportEvent::LocalOobData(Some(local)));
      loop {
         if let PairingEvent::LocalOobDataReady(ready) = testing::recv(&mut rx).await {
            assert_eq!(ready, Some(local));
            break;
         }
      }
      agent.clear_oob_data(device).unwrap();
      agent.set_oob_data(device, data).unwrap();
   }

   #[tokio::test]
   async fn test_authorization_request() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-authz").await;
      let registry = session.registry();
      let device = registry.ensure_device(SENSOR);
      request(&transport, PairingRequest::Authorization {
         services: ServiceMask::HID,
      });
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AuthorizationRequest {
            device,
            services: ServiceMask::HID
         }
      );
      agent.reply_authorization(device, true).unwrap();
      assert!(registry.authorized_services(device).unwrap().contains(ServiceMask::HID));
      assert!(
         transport
            .requests()
            .contains(&Request::Reply(SENSOR, PairingReply::Authorize(ServiceMask::HID)))
      );
      assert!(matches!(
         agent.reply_authorization(device, true),
         Err(Error::Pairing(PairingError::NoAttempt))
      ));
   }

   #[tokio::test]
   async fn test_cancel_silences_attempt() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-cancel").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      agent.cancel_pairing(device).unwrap();
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Cancelled
         }
      );
      request(&transport, PairingRequest::PinCode { min_len: 4 });
      complete(&transport, Err(PairingFailure::Cancelled));
      testing::settle().await;
      assert!(rx.try_recv().is_err());
      assert!(transport.requests().contains(&Request::CancelPairing(SENSOR)));
   }

   #[tokio::test]
   async fn test_second_attempt_rejected() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-twice").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert!(matches!(
         agent.pair(device),
         Err(Error::Pairing(PairingError::AlreadyInProgress))
      ));

      let (sink, _other_rx) = testing::collector();
      let other = session.create_pairing_agent(sink);
      assert!(matches!(
         other.start(),
         Err(Error::Pairing(PairingError::AgentAlreadyStarted))
      ));

      // An incoming request for the same device is turned away too.
      transport.inject(TransportEvent::PairingRequested { address: SENSOR });
      complete(&transport, Ok(None));
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Success
         }
      );
      assert!(transport.requests().contains(&Request::Reply(SENSOR, PairingReply::Reject)));
   }

   #[tokio::test]
   async fn test_too_many_attempts_and_delete() {
      let Rig {
         session,
         transport,
         agent,
         mut rx,
      } = rig("pair-limit").await;
      let registry = session.registry();
      let device = registry.ensure_device(SENSOR);
      for _ in 0..session.config().max_pairing_attempts {
         agent.pair(device).unwrap();
         complete(&transport, Err(PairingFailure::ConfirmValueMismatch));
         loop {
            if let PairingEvent::AttemptComplete { result, .. } = testing::recv(&mut rx).await {
               assert_eq!(result, PairingResult::ConfirmValueMismatch);
               break;
            }
         }
      }
      assert!(matches!(
         agent.pair(device),
         Err(Error::Pairing(PairingError::TooManyAttempts))
      ));

      agent.delete_paired_device(device).unwrap();
      agent.delete_paired_device(device).unwrap();
      agent.pair(device).unwrap();
      assert!(!transport.requests().contains(&Request::RemoveBond(SENSOR)));
   }

   #[tokio::test]
   async fn test_stop_cancels_attempts() {
      let Rig {
         session,
         transport: _transport,
         agent,
         mut rx,
      } = rig("pair-stop").await;
      let device = session.registry().ensure_device(SENSOR);
      agent.pair(device).unwrap();
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AttemptStarted(device));
      agent.stop().unwrap();
      assert_eq!(
         testing::recv(&mut rx).await,
         PairingEvent::AttemptComplete {
            device,
            result: PairingResult::Cancelled
         }
      );
      assert_eq!(testing::recv(&mut rx).await, PairingEvent::AgentStopped);
      assert_eq!(agent.state(), AgentState::Stopped);
   }
}
