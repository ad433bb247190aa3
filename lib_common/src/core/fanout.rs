//! # Local Fan-Out Registry
//!
//! Converts one locally-dispatched [`BroadcastEvent`] into deliveries across
//! all live subscriber queues in this process — one bounded queue per client
//! connection.
//!
//! ## Core Design Principles:
//!
//! 1.  **Slow consumers never block anyone.** Delivery uses a non-blocking
//!     enqueue against a snapshot of the live set taken under the lock, with
//!     the sends themselves happening outside the lock. A full queue drops
//!     the event for that subscriber only.
//!
//! 2.  **Guaranteed cleanup.** A [`Subscriber`] removes itself from the
//!     registry when dropped, so a disconnecting client is deregistered on
//!     every exit path, including errors.
//!
//! 3.  **FIFO per subscriber.** Within one subscriber, delivery order matches
//!     dispatch order. No ordering is guaranteed across subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::pubsub::EventHandler;
use crate::models::BroadcastEvent;

/// Maximum pending events per subscriber before new events are dropped
/// for that subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// # Fan-Out Registry
///
/// The per-process set of subscriber queues. Registered with [`crate::core::pubsub::PubSub`]
/// as an [`EventHandler`], so every event received on the broadcast channel
/// is delivered to all live local subscribers.
pub struct FanOut {
    /// Live subscriber senders, keyed by subscriber id.
    subscribers: Mutex<HashMap<u64, mpsc::Sender<BroadcastEvent>>>,
    /// Monotonic id source for subscriber handles.
    next_id: AtomicU64,
}

impl FanOut {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// # Register
    ///
    /// Creates a bounded queue for a new client connection, adds it to the
    /// live set, and returns the receiving handle. The handle deregisters
    /// itself on drop.
    pub fn register(self: &Arc<Self>) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

        let count = {
            let mut subscribers = self.subscribers.lock().expect("FanOut lock poisoned");
            subscribers.insert(id, tx);
            subscribers.len()
        };
        debug!("Subscriber {} registered ({} live)", id, count);

        Subscriber {
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Removes a subscriber from the live set. Safe to call repeatedly or
    /// after the subscriber is already gone.
    pub fn unregister(&self, subscriber: &Subscriber) {
        self.remove(subscriber.id);
    }

    /// # Dispatch
    ///
    /// Delivers `event` to every live subscriber. The live set is snapshotted
    /// under the lock; the non-blocking sends happen outside it so a stalled
    /// consumer cannot block registration or the publisher.
    pub fn dispatch(&self, event: &BroadcastEvent) {
        let targets: Vec<(u64, mpsc::Sender<BroadcastEvent>)> = {
            let subscribers = self.subscribers.lock().expect("FanOut lock poisoned");
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} queue full; dropping event", id);
                }
                Err(TrySendError::Closed(_)) => {
                    self.remove(id);
                }
            }
        }
    }

    /// Number of currently live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("FanOut lock poisoned").len()
    }

    fn remove(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().expect("FanOut lock poisoned");
        if subscribers.remove(&id).is_some() {
            debug!("Subscriber {} removed ({} live)", id, subscribers.len());
        }
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for FanOut {
    fn handle(&self, event: &BroadcastEvent) {
        self.dispatch(event);
    }
}

/// # Subscriber
///
/// The receiving half of one client connection's queue. Owned exclusively by
/// the streaming adapter for the lifetime of the connection; dropping it
/// removes the subscriber from the registry.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<BroadcastEvent>,
    registry: Arc<FanOut>,
}

impl Subscriber {
    /// Waits for the next queued event; `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.recv().await
    }

    /// The registry id of this subscriber.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(kind: &str) -> BroadcastEvent {
        BroadcastEvent::new(kind, Some(Uuid::new_v4()), None)
    }

    #[tokio::test]
    async fn dispatch_reaches_every_subscriber_in_order() {
        let fanout = Arc::new(FanOut::new());
        let mut subs = vec![fanout.register(), fanout.register(), fanout.register()];
        assert_eq!(fanout.subscriber_count(), 3);

        fanout.dispatch(&event("first"));
        fanout.dispatch(&event("second"));

        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap().kind, "first");
            assert_eq!(sub.recv().await.unwrap().kind, "second");
            assert!(sub.rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_subscriber_only() {
        let fanout = Arc::new(FanOut::new());
        let mut slow = fanout.register();
        let mut healthy = fanout.register();

        for i in 0..SUBSCRIBER_QUEUE_CAPACITY {
            fanout.dispatch(&event(&format!("event-{}", i)));
        }
        // The healthy subscriber drains; the slow one stays full.
        for _ in 0..SUBSCRIBER_QUEUE_CAPACITY {
            healthy.recv().await.unwrap();
        }

        fanout.dispatch(&event("overflow"));

        // Dropped for the stalled subscriber, delivered to the healthy one.
        assert_eq!(healthy.recv().await.unwrap().kind, "overflow");
        for _ in 0..SUBSCRIBER_QUEUE_CAPACITY {
            assert_ne!(slow.recv().await.unwrap().kind, "overflow");
        }
        assert!(slow.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_a_subscriber_deregisters_it() {
        let fanout = Arc::new(FanOut::new());
        let sub = fanout.register();
        let _other = fanout.register();
        assert_eq!(fanout.subscriber_count(), 2);

        drop(sub);
        assert_eq!(fanout.subscriber_count(), 1);

        // Dispatch after the drop must not resurrect or panic.
        fanout.dispatch(&event("after-drop"));
        assert_eq!(fanout.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let fanout = Arc::new(FanOut::new());
        let sub = fanout.register();

        fanout.unregister(&sub);
        fanout.unregister(&sub);
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
