//! In-process transport daemon.
//!
//! Records every request, lets callers inject events as if they came from
//! the daemon, and optionally answers connections and accessory control
//! frames on its own.

use std::{collections::HashMap, sync::Arc};

use log::{debug, info};
use parking_lot::Mutex;
use smol_str::SmolStr;

use super::{
   InquiryResult, Packet, PairingParams, PairingReply, Transport, TransportEvent, TransportEvents,
};
use crate::{
   accessory::{
      parser,
      protocol::{self, ControlType, Opcode},
   },
   address::Address,
   error::{Error, Result},
   services::ServiceMask,
};

/// A request received from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
   Open(SmolStr),
   Close,
   StartInquiry(ServiceMask),
   StopInquiry,
   Query(Address),
   Connect(Address, ServiceMask),
   Disconnect(Address, ServiceMask),
   Pair(Address, PairingParams),
   Reply(Address, PairingReply),
   CancelPairing(Address),
   RemoveBond(Address),
   ReadLocalOob,
   Send(Address, Vec<u8>),
}

struct State {
   available: bool,
   respond: bool,
   refuse_sends: bool,
   events: Option<TransportEvents>,
   requests: Vec<Request>,
   peers: HashMap<Address, InquiryResult>,
   controls: HashMap<(Address, ControlType), u32>,
}

pub struct MemoryTransport {
   state: Mutex<State>,
}

impl MemoryTransport {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         state: Mutex::new(State {
            available: true,
            respond: false,
            refuse_sends: false,
            events: None,
            requests: Vec::new(),
            peers: HashMap::new(),
            controls: HashMap::new(),
         }),
      })
   }

   /// While unavailable, `open` fails as if the daemon were not running.
   pub fn set_available(&self, available: bool) {
      self.state.lock().available = available;
   }

   /// Answers connections, queries and control frames automatically.
   pub fn respond(&self, on: bool) {
      self.state.lock().respond = on;
   }

   /// While set, accessory frames are refused as if the channel were full.
   pub fn refuse_sends(&self, refuse: bool) {
      self.state.lock().refuse_sends = refuse;
   }

   /// Registers a peer that queries can resolve.
   pub fn add_peer(&self, peer: InquiryResult) {
      self.state.lock().peers.insert(peer.address, peer);
   }

   pub fn is_open(&self) -> bool {
      self.state.lock().events.is_some()
   }

   /// Delivers `event` as if the daemon produced it. False when no client is attached.
   pub fn inject(&self, event: TransportEvent) -> bool {
      self
         .state
         .lock()
         .events
         .as_ref()
         .is_some_and(|tx| tx.send(event).is_ok())
   }

   /// Simulates the daemon dying.
   pub fn crash(&self) {
      let mut state = self.state.lock();
      if let Some(tx) = state.events.take() {
         info!("Simulated transport crash");
         let _ = tx.send(TransportEvent::Terminated);
      }
      state.available = false;
   }

   pub fn requests(&self) -> Vec<Request> {
      self.state.lock().requests.clone()
   }

   pub fn take_requests(&self) -> Vec<Request> {
      std::mem::take(&mut self.state.lock().requests)
   }

   /// Frames sent to `address`, in order.
   pub fn sent_frames(&self, address: Address) -> Vec<Vec<u8>> {
      self
         .state
         .lock()
         .requests
         .iter()
         .filter_map(|r| match r {
            Request::Send(a, data) if *a == address => Some(data.clone()),
            _ => None,
         })
         .collect()
   }

   fn record(&self, request: Request) -> Result<()> {
      let mut state = self.state.lock();
      if state.events.is_none() {
         return Err(Error::Transport(SmolStr::new_static("not attached")));
      }
      let replies = if state.respond {
         Self::answer(&mut state, &request)
      } else {
         Vec::new()
      };
      state.requests.push(request);
      if let Some(tx) = &state.events {
         for event in replies {
            let _ = tx.send(event);
         }
      }
      Ok(())
   }

   fn answer(state: &mut State, request: &Request) -> Vec<TransportEvent> {
      match *request {
         Request::Connect(address, services) => {
            vec![TransportEvent::ServicesConnected { address, services }]
         },
         Request::Disconnect(address, services) => {
            vec![TransportEvent::ServicesDisconnected { address, services }]
         },
         Request::Query(address) => {
            let event = match state.peers.get(&address) {
               Some(peer) => TransportEvent::QueryComplete {
                  address,
                  name: peer.name.clone(),
                  services: peer.services,
                  success: true,
               },
               None => TransportEvent::QueryComplete {
                  address,
                  name: None,
                  services: ServiceMask::empty(),
                  success: false,
               },
            };
            vec![event]
         },
         Request::Send(address, ref data) => Self::answer_frame(state, address, data),
         _ => Vec::new(),
      }
   }

   fn answer_frame(state: &mut State, address: Address, data: &[u8]) -> Vec<TransportEvent> {
      let Ok((opcode, payload)) = parser::split_frame(data) else {
         return Vec::new();
      };
      let reply: Option<Packet> = match opcode {
         Opcode::CONTROL => parser::parse_control(payload).ok().map(|(ty, value)| {
            state.controls.insert((address, ty), value);
            protocol::control_frame(ty, value)
         }),
         Opcode::CONTROL_QUERY => parser::parse_control_query(payload).ok().map(|(ty, _)| {
            let value = state.controls.get(&(address, ty)).copied().unwrap_or(0);
            protocol::control_frame(ty, value)
         }),
         _ => None,
      };
      reply
         .map(|data| {
            debug!("Echoing {opcode} to {address}");
            vec![TransportEvent::Frame { address, data }]
         })
         .unwrap_or_default()
   }
}

impl Transport for MemoryTransport {
   fn open(&self, client: &str, events: TransportEvents) -> Result<()> {
      let mut state = self.state.lock();
      if !state.available {
         return Err(Error::NoServerFound);
      }
      state.events = Some(events);
      state.requests.push(Request::Open(SmolStr::new(client)));
      Ok(())
   }

   fn close(&self) {
      let mut state = self.state.lock();
      state.events = None;
      state.requests.push(Request::Close);
   }

   fn start_inquiry(&self, filter: ServiceMask) -> Result<()> {
      self.record(Request::StartInquiry(filter))
   }

   fn stop_inquiry(&self) -> Result<()> {
      self.record(Request::StopInquiry)
   }

   fn query(&self, address: Address) -> Result<()> {
      self.record(Request::Query(address))
   }

   fn connect(&self, address: Address, services: ServiceMask) -> Result<()> {
      self.record(Request::Connect(address, services))
   }

   fn disconnect(&self, address: Address, services: ServiceMask) -> Result<()> {
      self.record(Request::Disconnect(address, services))
   }

   fn pair(&self, address: Address, params: PairingParams) -> Result<()> {
      self.record(Request::Pair(address, params))
   }

   fn reply(&self, address: Address, reply: PairingReply) -> Result<()> {
      self.record(Request::Reply(address, reply))
   }

   fn cancel_pairing(&self, address: Address) -> Result<()> {
      self.record(Request::CancelPairing(address))
   }

   fn remove_bond(&self, address: Address) -> Result<()> {
      self.record(Request::RemoveBond(address))
   }

   fn read_local_oob(&self) -> Result<()> {
      self.record(Request::ReadLocalOob)
   }

   fn send(&self, address: Address, data: &[u8]) -> Result<()> {
      if self.state.lock().refuse_sends {
         return Err(Error::Transport(SmolStr::new_static("send queue full")));
      }
      self.record(Request::Send(address, data.to_vec()))
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc;

   use super::*;

   #[test]
   fn test_open_requires_daemon() {
      let transport = MemoryTransport::new();
      transport.set_available(false);
      let (tx, _rx) = mpsc::unbounded_channel();
      assert!(matches!(transport.open("a", tx.clone()), Err(Error::NoServerFound)));
      transport.set_available(true);
      transport.open("a", tx).unwrap();
      assert!(transport.is_open());
   }

   #[test]
   fn test_responder_echoes_controls() {
      let transport = MemoryTransport::new();
      let (tx, mut rx) = mpsc::unbounded_channel();
      transport.open("a", tx).unwrap();
      transport.respond(true);
      let addr = Address::new([1, 2, 3, 4, 5, 6]);

      let set = protocol::control_frame(ControlType::CHIME_VOLUME, 40);
      transport.send(addr, &set).unwrap();
      let Ok(TransportEvent::Frame { data, .. }) = rx.try_recv() else {
         panic!("expected echo");
      };
      assert_eq!(&data[..], &set[..]);

      let query = protocol::control_query_frame(ControlType::CHIME_VOLUME, 0);
      transport.send(addr, &query).unwrap();
      let Ok(TransportEvent::Frame { data, .. }) = rx.try_recv() else {
         panic!("expected answer");
      };
      assert_eq!(&data[..], &set[..]);
      assert_eq!(transport.sent_frames(addr).len(), 2);
   }

   #[test]
   fn test_crash_reports_termination() {
      let transport = MemoryTransport::new();
      let (tx, mut rx) = mpsc::unbounded_channel();
      transport.open("a", tx).unwrap();
      transport.crash();
      assert!(matches!(rx.try_recv(), Ok(TransportEvent::Terminated)));
      assert!(!transport.is_open());
      assert!(transport.query(Address::any()).is_err());
   }
}
