//! Event delivery for sessions and their components.
//!
//! Every component posts its events onto the session's `EventQueue`, which
//! runs listener callbacks one at a time on a single dispatcher task, in
//! the order they were posted.

use std::{
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use crossbeam::queue::SegQueue;
use log::{error, trace};
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle, time};

/// Receiver of one category of events.
pub trait EventSink<E>: Send + Sync + 'static {
   fn emit(&self, event: E);
}

impl<E, F> EventSink<E> for F
where
   F: Fn(E) + Send + Sync + 'static,
{
   fn emit(&self, event: E) {
      self(event);
   }
}

/// Type alias for a shared event sink.
pub type Sink<E> = Arc<dyn EventSink<E>>;

type Job = Box<dyn FnOnce() + Send>;

/// Serial delivery queue owned by one session.
pub(crate) struct EventQueue {
   queue: SegQueue<Job>,
   notifier: Notify,
   closed: AtomicBool,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         closed: AtomicBool::new(false),
      })
   }

   /// Queues `event` for `sink`. Dropped once the queue is closed.
   pub fn post<E: Send + 'static>(&self, sink: &Sink<E>, event: E) {
      let sink = sink.clone();
      self.push(Box::new(move || sink.emit(event)));
   }

   /// Queues `event` once per sink, preserving sink order.
   pub fn post_all<E: Clone + Send + 'static>(&self, sinks: Vec<Sink<E>>, event: E) {
      if sinks.is_empty() {
         return;
      }
      self.push(Box::new(move || {
         for sink in sinks {
            sink.emit(event.clone());
         }
      }));
   }

   fn push(&self, job: Job) {
      if self.closed.load(Ordering::Acquire) {
         trace!("Event dropped after queue close");
         return;
      }
      self.queue.push(job);
      self.notifier.notify_waiters();
   }

   /// Stops accepting events; already queued ones are still delivered.
   pub fn close(&self) {
      self.closed.store(true, Ordering::Release);
      self.notifier.notify_waiters();
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   async fn recv(&self) -> Option<Job> {
      loop {
         if let Some(job) = self.queue.pop() {
            return Some(job);
         }
         let notify = self.notifier.notified();
         if let Some(job) = self.queue.pop() {
            return Some(job);
         }
         if self.is_closed() {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
      let this = self.clone();
      tokio::spawn(async move {
         while let Some(job) = this.recv().await {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
               error!("Event listener panicked");
            }
         }
      })
   }
}

type Entry<K, E> = (u64, K, Sink<E>);

/// Listener registrations keyed by a filter value.
pub(crate) struct Registrations<K, E> {
   entries: Arc<Mutex<Vec<Entry<K, E>>>>,
   next_id: AtomicU64,
}

impl<K, E> Registrations<K, E>
where
   K: Copy + Send + 'static,
   E: 'static,
{
   pub fn new() -> Self {
      Self {
         entries: Arc::new(Mutex::new(Vec::new())),
         next_id: AtomicU64::new(1),
      }
   }

   pub fn add(&self, key: K, sink: Sink<E>) -> Subscription {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.entries.lock().push((id, key, sink));
      let weak: Weak<Mutex<Vec<Entry<K, E>>>> = Arc::downgrade(&self.entries);
      Subscription {
         cancel: Some(Box::new(move || {
            if let Some(entries) = weak.upgrade() {
               entries.lock().retain(|(eid, ..)| *eid != id);
            }
         })),
      }
   }

   /// Sinks whose key satisfies `filter`, in registration order.
   pub fn matching(&self, filter: impl Fn(&K) -> bool) -> Vec<Sink<E>> {
      self
         .entries
         .lock()
         .iter()
         .filter(|(_, key, _)| filter(key))
         .map(|(_, _, sink)| sink.clone())
         .collect()
   }

   pub fn all(&self) -> Vec<Sink<E>> {
      self.matching(|_| true)
   }

   pub fn clear(&self) {
      self.entries.lock().clear();
   }

   pub fn len(&self) -> usize {
      self.entries.lock().len()
   }
}

/// Keeps a listener registered until dropped.
#[must_use = "dropping a subscription unregisters the listener"]
pub struct Subscription {
   cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
   pub fn unsubscribe(mut self) {
      if let Some(cancel) = self.cancel.take() {
         cancel();
      }
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      if let Some(cancel) = self.cancel.take() {
         cancel();
      }
   }
}

impl std::fmt::Debug for Subscription {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Subscription")
         .field("active", &self.cancel.is_some())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc;

   use super::*;

   #[tokio::test]
   async fn test_queue_preserves_order_and_closes() {
      let queue = EventQueue::new();
      let (tx, mut rx) = mpsc::unbounded_channel();
      let sink: Sink<u32> = Arc::new(move |n: u32| {
         let _ = tx.send(n);
      });
      let dispatcher = queue.spawn_dispatcher();
      for n in 0..100 {
         queue.post(&sink, n);
      }
      queue.close();
      queue.post(&sink, 1000);
      dispatcher.await.unwrap();
      let mut got = Vec::new();
      while let Ok(n) = rx.try_recv() {
         got.push(n);
      }
      assert_eq!(got, (0..100).collect::<Vec<_>>());
   }

   #[tokio::test]
   async fn test_listener_panic_does_not_stop_dispatch() {
      let queue = EventQueue::new();
      let (tx, mut rx) = mpsc::unbounded_channel();
      let sink: Sink<u32> = Arc::new(move |n: u32| {
         if n == 1 {
            panic!("listener failure");
         }
         let _ = tx.send(n);
      });
      let dispatcher = queue.spawn_dispatcher();
      queue.post(&sink, 0);
      queue.post(&sink, 1);
      queue.post(&sink, 2);
      queue.close();
      dispatcher.await.unwrap();
      assert_eq!(rx.try_recv().unwrap(), 0);
      assert_eq!(rx.try_recv().unwrap(), 2);
   }

   #[test]
   fn test_subscription_drop_unregisters() {
      let regs: Registrations<u32, u32> = Registrations::new();
      let a = regs.add(1, Arc::new(|_: u32| {}));
      let b = regs.add(3, Arc::new(|_: u32| {}));
      assert_eq!(regs.matching(|k| k & 1 != 0).len(), 2);
      assert_eq!(regs.matching(|k| k & 2 != 0).len(), 1);
      drop(a);
      assert_eq!(regs.len(), 1);
      b.unsubscribe();
      assert_eq!(regs.len(), 0);
   }
}
