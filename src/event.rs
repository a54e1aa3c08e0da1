//! Event fan-out for connection and volume updates.
//!
//! This module provides the listener registry the orchestrator notifies,
//! plus [`EventQueue`], a buffering listener with an async receive side.

use std::{
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::warn;
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::{sync::Notify, time};

use crate::{stack::native::VolumeTarget, vcp::protocol::ConnectionState};

/// Events emitted by the volume control core.
#[derive(Debug, Clone, PartialEq)]
pub enum VcpEvent {
   ConnectionStateChanged {
      device: Address,
      state: ConnectionState,
      previous: ConnectionState,
   },
   VolumeChanged {
      target: VolumeTarget,
      volume: u8,
      mute: bool,
   },
   VolumeOffsetChanged {
      device: Address,
      output_id: u8,
      offset: i16,
   },
   LocationChanged {
      device: Address,
      output_id: u8,
      location: u32,
   },
   DescriptionChanged {
      device: Address,
      output_id: u8,
      description: SmolStr,
   },
}

/// Trait for implementing event reception.
pub trait EventBus: Send + Sync {
   /// Called once per event, in emission order for any single device.
   fn emit(&self, event: &VcpEvent);
}

/// Type alias for a thread-safe event listener.
pub type EventSender = Arc<dyn EventBus>;

/// Handle returned by [`Listeners::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners.
///
/// Every emission iterates a snapshot taken under a short read lock, so
/// registering or unregistering during a fan-out never yields a partial
/// delivery.
#[derive(Default)]
pub struct Listeners {
   next_id: AtomicU64,
   entries: RwLock<Vec<(ListenerId, EventSender)>>,
   silenced: AtomicBool,
}

impl Listeners {
   pub fn register(&self, listener: EventSender) -> ListenerId {
      let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
      self.entries.write().push((id, listener));
      id
   }

   pub fn unregister(&self, id: ListenerId) -> bool {
      let mut entries = self.entries.write();
      let before = entries.len();
      entries.retain(|(entry, _)| *entry != id);
      entries.len() != before
   }

   pub fn len(&self) -> usize {
      self.entries.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Stops all further deliveries.
   pub(crate) fn silence(&self) {
      self.silenced.store(true, Ordering::Release);
      self.entries.write().clear();
   }

   pub fn emit(&self, event: VcpEvent) {
      if self.silenced.load(Ordering::Acquire) {
         return;
      }
      let snapshot: Vec<EventSender> = self
         .entries
         .read()
         .iter()
         .map(|(_, listener)| listener.clone())
         .collect();

      for listener in snapshot {
         if panic::catch_unwind(AssertUnwindSafe(|| listener.emit(&event))).is_err() {
            warn!("Listener panicked while handling {event:?}");
         }
      }
   }
}

/// Listener that buffers events for asynchronous consumption.
pub struct EventQueue {
   queue: SegQueue<VcpEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Waits for the next event.
   ///
   /// Returns `None` once the queue is empty and no one else holds it.
   pub async fn recv(self: &Arc<Self>) -> Option<VcpEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   pub fn try_recv(&self) -> Option<VcpEvent> {
      self.queue.pop()
   }

   /// Takes every buffered event.
   pub fn drain(&self) -> Vec<VcpEvent> {
      let mut events = Vec::with_capacity(self.queue.len());
      while let Some(event) = self.queue.pop() {
         events.push(event);
      }
      events
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: &VcpEvent) {
      self.queue.push(event.clone());
      self.notifier.notify_waiters();
   }
}
