//! Boundary to the underlying transport daemon.
//!
//! Every request is accepted or rejected synchronously; the real outcome
//! arrives later as a `TransportEvent` on the channel handed to `open`.

use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::{
   address::Address,
   error::Result,
   pairing::{IoCapability, LocalOobData, OobData},
   registry::{DeviceId, LinkKey},
   services::ServiceMask,
};

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod memory;

pub use memory::{MemoryTransport, Request};

pub type Packet = SmallVec<[u8; 32]>;

/// Sender half on which the transport reports events.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Parameters the local side offers for one pairing negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingParams {
   pub io_capability: IoCapability,
   pub oob: Option<OobData>,
}

/// Answer to a request previously reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingReply {
   Accept(PairingParams),
   Reject,
   PinCode(SmolStr),
   Confirm(bool),
   /// Empty mask denies the authorization.
   Authorize(ServiceMask),
}

/// User interaction the peer's negotiation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRequest {
   PinCode { min_len: u8 },
   Confirmation { value: u32, mitm: bool },
   PasskeyDisplay { value: u32 },
   Authorization { services: ServiceMask },
}

/// Failure reported by the link layer for a pairing negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PairingFailure {
   UserDenied,
   Timeout,
   ConfirmValueMismatch,
   CryptoFailure,
   AuthenticationFailure,
   PeerRemovedPairing,
   Cancelled,
}

/// One inquiry response.
#[derive(Debug, Clone, Default)]
pub struct InquiryResult {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub class: u32,
   pub services: ServiceMask,
   pub rssi: Option<i16>,
   /// Raw extended inquiry response, empty when the peer sent none.
   pub eir: Vec<u8>,
   pub device_id: Option<DeviceId>,
}

#[derive(Debug)]
pub enum TransportEvent {
   /// The daemon went away; the session is no longer usable.
   Terminated,
   NetworkAssociation(bool),
   InquiryResult(InquiryResult),
   InquiryLost(Address),
   InquiryWindowComplete,
   QueryComplete {
      address: Address,
      name: Option<SmolStr>,
      services: ServiceMask,
      success: bool,
   },
   ServicesConnected {
      address: Address,
      services: ServiceMask,
   },
   ServicesDisconnected {
      address: Address,
      services: ServiceMask,
   },
   /// Peer initiated pairing; answered with `PairingReply::Accept` or `Reject`.
   PairingRequested {
      address: Address,
   },
   Pairing {
      address: Address,
      request: PairingRequest,
   },
   PairingComplete {
      address: Address,
      status: std::result::Result<Option<LinkKey>, PairingFailure>,
   },
   LocalOobData(Option<LocalOobData>),
   Frame {
      address: Address,
      data: Packet,
   },
   SendFailed {
      address: Address,
      timed_out: bool,
   },
}

/// The transport daemon as seen by a session.
pub trait Transport: Send + Sync + 'static {
   /// Attaches `client`; fails with `Error::NoServerFound` while the daemon is down.
   fn open(&self, client: &str, events: TransportEvents) -> Result<()>;
   fn close(&self);

   fn start_inquiry(&self, filter: ServiceMask) -> Result<()>;
   fn stop_inquiry(&self) -> Result<()>;
   /// Name/service query answered by `QueryComplete`.
   fn query(&self, address: Address) -> Result<()>;

   fn connect(&self, address: Address, services: ServiceMask) -> Result<()>;
   fn disconnect(&self, address: Address, services: ServiceMask) -> Result<()>;

   fn pair(&self, address: Address, params: PairingParams) -> Result<()>;
   fn reply(&self, address: Address, reply: PairingReply) -> Result<()>;
   fn cancel_pairing(&self, address: Address) -> Result<()>;
   fn remove_bond(&self, address: Address) -> Result<()>;
   /// Answered by `TransportEvent::LocalOobData`.
   fn read_local_oob(&self) -> Result<()>;

   /// Queues one accessory frame on the control channel.
   fn send(&self, address: Address, data: &[u8]) -> Result<()>;
}
