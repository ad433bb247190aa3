//! # Core Engine Module
//!
//! The event-distribution heart of the service. Three components cooperate
//! to move a notification from any worker process to every connected client:
//!
//! - **`pubsub`**: the cross-process broadcast channel, built on PostgreSQL
//!   LISTEN/NOTIFY. Any worker can publish; every worker (including the
//!   publisher) receives the event through its registered handlers.
//!
//! - **`fanout`**: the per-process fan-out registry. One bounded queue per
//!   live client connection; a single dispatched event is delivered to all
//!   of them without letting a slow consumer block the rest.
//!
//! - **`scheduler`**: the periodic reminder scan loop. Computes due times,
//!   suppresses duplicate alerts, and feeds due-notifications back into
//!   `pubsub` (and the push capability).

/// Cross-process broadcast channel over PostgreSQL LISTEN/NOTIFY.
pub mod pubsub;
/// Per-process subscriber registry and event fan-out.
pub mod fanout;
/// Periodic reminder due-scan loop.
pub mod scheduler;

// --- Public API Re-exports ---
pub use fanout::{FanOut, Subscriber, SUBSCRIBER_QUEUE_CAPACITY};
pub use pubsub::{EventHandler, ListenError, PubSub, CHANNEL_NAME, MAX_NOTIFY_BYTES};
pub use scheduler::ReminderScheduler;
