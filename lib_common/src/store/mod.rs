//! # Storage & Delivery Capabilities
//!
//! The async trait seams between the engine and the outside world. The scan
//! loop and the settings lookup depend only on these traits; the PostgreSQL
//! implementation and the HTTP push relay live in the submodules. Tests
//! substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{PushEndpoint, ReminderWithSubject};

/// PostgreSQL-backed implementation of the store traits.
pub mod postgres;
/// HTTP relay implementing [`PushDelivery`].
pub mod push_relay;

pub use postgres::PgStore;
pub use push_relay::HttpPushRelay;

/// Reminder persistence as seen by the scan loop.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// All enabled reminders, each joined with its subject.
    async fn enabled_reminders(&self) -> anyhow::Result<Vec<ReminderWithSubject>>;

    /// Persists `last_notified_at` stamps for the given reminders in one
    /// batch. Called only with a non-empty slice.
    async fn mark_notified(&self, updates: &[(Uuid, DateTime<Utc>)]) -> anyhow::Result<()>;

    /// Push subscriptions belonging to active users.
    async fn active_push_subscriptions(&self) -> anyhow::Result<Vec<PushEndpoint>>;
}

/// Key-value application settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The raw persisted value for `key`, if any.
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Outbound push-notification delivery.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    /// Delivers one payload to one endpoint.
    async fn deliver(&self, endpoint: &PushEndpoint, payload: &[u8]) -> anyhow::Result<()>;
}
