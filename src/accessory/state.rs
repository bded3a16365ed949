//! Per-accessory state.
//!
//! Last-known settings, battery, in-ear status and the capability vectors
//! received from the peer, plus the requests still waiting for an answer.

use std::{
   collections::{BTreeMap, HashMap},
   mem,
   sync::atomic::{AtomicBool, AtomicU64, Ordering},
   time::Instant,
};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;

use super::{
   AccessoryError, AccessoryState,
   parser::Capabilities,
   protocol::{BatteryInfo, CapabilityBit, CapabilityInteger, ControlType, InEarStatus},
};
use crate::{address::Address, registry::DeviceHandle};

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: Option<T>) -> Self
   where
      T: Copy,
   {
      Self::new(dst.swap(new), new)
   }

   fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

pub(crate) type Reply = oneshot::Sender<Result<u32, AccessoryError>>;

struct PendingGet {
   reply: Reply,
   deadline: Instant,
}

/// State of one accessory. Capability vectors survive reconnects.
pub(crate) struct AccessoryDevice {
   pub handle: DeviceHandle,
   pub address: Address,
   state: AtomicCell<AccessoryState>,
   connect_deadline: AtomicCell<Option<Instant>>,
   battery: AtomicCell<Option<BatteryInfo>>,
   in_ear: AtomicCell<Option<InEarStatus>>,
   name: Mutex<Option<SmolStr>>,
   controls: Mutex<BTreeMap<ControlType, u32>>,
   capabilities: [AtomicU64; 256 / 64],
   capabilities_received: AtomicBool,
   integers: Mutex<HashMap<CapabilityInteger, u32>>,
   pending: Mutex<HashMap<ControlType, Vec<PendingGet>>>,
   tipi_deadline: AtomicCell<Option<Instant>>,
}

impl AccessoryDevice {
   pub fn new(handle: DeviceHandle, address: Address) -> Self {
      Self {
         handle,
         address,
         state: AtomicCell::new(AccessoryState::Unknown),
         connect_deadline: AtomicCell::new(None),
         battery: AtomicCell::new(None),
         in_ear: AtomicCell::new(None),
         name: Mutex::new(None),
         controls: Mutex::new(BTreeMap::new()),
         capabilities: Default::default(),
         capabilities_received: AtomicBool::new(false),
         integers: Mutex::new(HashMap::new()),
         pending: Mutex::new(HashMap::new()),
         tipi_deadline: AtomicCell::new(None),
      }
   }

   pub fn state(&self) -> AccessoryState {
      self.state.load()
   }

   /// Returns the previous state.
   pub fn set_state(&self, state: AccessoryState) -> AccessoryState {
      self.state.swap(state)
   }

   pub fn is_plugged_in(&self) -> bool {
      self.state() == AccessoryState::PluggedIn
   }

   pub fn arm_connect(&self, deadline: Instant) {
      self.connect_deadline.store(Some(deadline));
   }

   pub fn disarm_connect(&self) -> bool {
      self.connect_deadline.take().is_some()
   }

   pub fn connect_expired(&self, now: Instant) -> bool {
      match self.connect_deadline.load() {
         Some(deadline) if deadline <= now => {
            self.connect_deadline.store(None);
            true
         },
         _ => false,
      }
   }

   pub fn battery(&self) -> Option<BatteryInfo> {
      self.battery.load()
   }

   pub fn update_battery(&self, battery: impl Into<Option<BatteryInfo>>) -> UpdateOp<BatteryInfo> {
      UpdateOp::apply_atomic(&self.battery, battery.into())
   }

   pub fn in_ear(&self) -> Option<InEarStatus> {
      self.in_ear.load()
   }

   pub fn update_in_ear(&self, status: impl Into<Option<InEarStatus>>) -> UpdateOp<InEarStatus> {
      UpdateOp::apply_atomic(&self.in_ear, status.into())
   }

   pub fn update_name(&self, name: SmolStr) -> UpdateOp<SmolStr> {
      let mut lock = self.name.lock();
      if lock.as_ref() == Some(&name) {
         return UpdateOp::Noop;
      }
      match mem::replace(&mut *lock, Some(name)) {
         Some(prev) => UpdateOp::Updated(prev),
         None => UpdateOp::Inserted,
      }
   }

   pub fn control(&self, ty: ControlType) -> Option<u32> {
      self.controls.lock().get(&ty).copied()
   }

   pub fn controls(&self) -> Vec<(ControlType, u32)> {
      self.controls.lock().iter().map(|(k, v)| (*k, *v)).collect()
   }

   pub fn update_control(&self, ty: ControlType, value: u32) -> UpdateOp<u32> {
      UpdateOp::new(self.controls.lock().insert(ty, value), Some(value))
   }

   pub fn capability_bit(&self, bit: CapabilityBit) -> bool {
      let (idx, mask) = bit.bitpos();
      self.capabilities[idx].load(Ordering::Relaxed) & mask != 0
   }

   pub fn capability_integer(&self, integer: CapabilityInteger) -> u32 {
      self.integers.lock().get(&integer).copied().unwrap_or(0)
   }

   pub fn capabilities_received(&self) -> bool {
      self.capabilities_received.load(Ordering::Relaxed)
   }

   /// Replaces both capability vectors with what the peer just sent.
   pub fn set_capabilities(&self, caps: &Capabilities) {
      let mut words = [0u64; 256 / 64];
      for bit in &caps.bits {
         let (idx, mask) = bit.bitpos();
         words[idx] |= mask;
      }
      for (slot, word) in self.capabilities.iter().zip(words) {
         slot.store(word, Ordering::Relaxed);
      }
      *self.integers.lock() = caps.integers.iter().copied().collect();
      self.capabilities_received.store(true, Ordering::Relaxed);
   }

   pub fn add_pending(&self, ty: ControlType, reply: Reply, deadline: Instant) {
      self
         .pending
         .lock()
         .entry(ty)
         .or_default()
         .push(PendingGet { reply, deadline });
   }

   /// Drops gets of `ty` whose caller has gone away.
   pub fn discard_abandoned(&self, ty: ControlType) {
      let mut pending = self.pending.lock();
      if let Some(waiters) = pending.get_mut(&ty) {
         waiters.retain(|w| !w.reply.is_closed());
         if waiters.is_empty() {
            pending.remove(&ty);
         }
      }
   }

   #[cfg(test)]
   pub fn pending_gets(&self) -> usize {
      self.pending.lock().values().map(Vec::len).sum()
   }

   /// Answers every outstanding get of `ty`.
   pub fn resolve(&self, ty: ControlType, value: u32) -> usize {
      let waiters = self.pending.lock().remove(&ty).unwrap_or_default();
      let n = waiters.len();
      for waiter in waiters {
         let _ = waiter.reply.send(Ok(value));
      }
      n
   }

   /// Fails gets whose deadline passed.
   pub fn expire(&self, now: Instant) -> usize {
      let mut expired = Vec::new();
      {
         let mut pending = self.pending.lock();
         for waiters in pending.values_mut() {
            let (gone, keep): (Vec<_>, Vec<_>) =
               mem::take(waiters).into_iter().partition(|w| w.deadline <= now);
            *waiters = keep;
            expired.extend(gone);
         }
         pending.retain(|_, waiters| !waiters.is_empty());
      }
      let n = expired.len();
      for waiter in expired {
         let _ = waiter
            .reply
            .send(Err(AccessoryError::Timeout(super::TimeoutLayer::Command)));
      }
      n
   }

   pub fn fail_all(&self, error: &AccessoryError) {
      let pending = mem::take(&mut *self.pending.lock());
      for waiter in pending.into_values().flatten() {
         let _ = waiter.reply.send(Err(error.clone()));
      }
      self.tipi_deadline.store(None);
   }

   /// False when a TiPi update is already outstanding.
   pub fn begin_tipi(&self, deadline: Instant) -> bool {
      self
         .tipi_deadline
         .compare_exchange(None, Some(deadline))
         .is_ok()
   }

   pub fn end_tipi(&self) -> bool {
      self.tipi_deadline.take().is_some()
   }

   pub fn tipi_expired(&self, now: Instant) -> bool {
      match self.tipi_deadline.load() {
         Some(deadline) if deadline <= now => self.end_tipi(),
         _ => false,
      }
   }

   /// Drops per-connection state; capability vectors stay cached.
   pub fn on_disconnect(&self) {
      self.battery.store(None);
      self.in_ear.store(None);
      self.controls.lock().clear();
      self.connect_deadline.store(None);
      self.fail_all(&AccessoryError::ConnectionLost);
   }
}
