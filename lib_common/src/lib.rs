// Declare the modules to re-export
pub mod core;
pub mod models;
pub mod reminders;
pub mod store;

// Re-export the primary types
pub use crate::core::fanout::{FanOut, Subscriber, SUBSCRIBER_QUEUE_CAPACITY};
pub use crate::core::pubsub::{EventHandler, ListenError, PubSub, CHANNEL_NAME, MAX_NOTIFY_BYTES};
pub use crate::core::scheduler::ReminderScheduler;
pub use crate::models::*;
pub use crate::reminders::due::{classify, next_due, DueStatus, WarningLevel};
pub use crate::store::{PushDelivery, ReminderStore, SettingsStore};
