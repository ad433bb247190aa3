//! # Domain Data Model
//!
//! The shared types that flow between the due-time engine, the pub/sub
//! broadcaster, and the fan-out layer. Storage of these entities lives behind
//! the traits in [`crate::store`]; nothing in this module performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// # Reminder
///
/// A recurring obligation (e.g., a medication dose for a care recipient).
/// The next due time is derived from `last_completed_at` (preferred) or
/// `start_time` plus the effective interval; if neither anchor exists the
/// reminder has no defined schedule.
#[derive(Debug, Clone)]
pub struct Reminder {
    /// Unique identifier of the reminder.
    pub id: Uuid,
    /// The care recipient this reminder belongs to.
    pub recipient_id: Uuid,
    /// The subject (e.g., medication) the reminder is about.
    pub subject_id: Uuid,
    /// Anchor instant for the first occurrence, if set.
    pub start_time: Option<DateTime<Utc>>,
    /// Per-reminder interval override in hours. Falls back to the subject's
    /// default when absent.
    pub interval_hours: Option<i32>,
    /// Disabled reminders are skipped by the scan loop. Toggled off on skip,
    /// back on upon fulfillment.
    pub enabled: bool,
    /// Instant of the last fulfillment.
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Instant of the last explicit skip.
    pub last_skipped_at: Option<DateTime<Utc>>,
    /// Instant of the most recent due-notification, used for suppression.
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// # Subject
///
/// The thing a reminder is about. Supplies the default interval and the
/// early-warning window inherited by its reminders.
#[derive(Debug, Clone)]
pub struct Subject {
    /// Unique identifier of the subject.
    pub id: Uuid,
    /// Human-readable name, used in notification payloads.
    pub name: String,
    /// Default interval in hours for reminders without their own override.
    pub default_interval_hours: Option<i32>,
    /// Duration before the due time during which an early administration
    /// counts as "within window" rather than "too early".
    pub early_warning_minutes: i32,
}

/// A reminder joined with its subject, as loaded by the store in one query.
#[derive(Debug, Clone)]
pub struct ReminderWithSubject {
    pub reminder: Reminder,
    pub subject: Subject,
}

/// # Notification Configuration
///
/// Process-wide notification settings, persisted as a JSON blob under the
/// `"notifications"` settings key and re-read once per scan cycle. Missing or
/// malformed values fall back to the defaults below; partial blobs merge with
/// the defaults per field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Deliver due-notifications through the push capability.
    pub enable_push: bool,
    /// Publish due-notifications through the broadcast channel.
    pub enable_in_app: bool,
    /// Window before the due time in which a reminder counts as "due soon".
    pub due_soon_minutes: i64,
    /// Minimum spacing between repeat due-notifications for the same
    /// occurrence. Zero or negative means: notify once per occurrence only.
    pub overdue_repeat_minutes: i64,
    /// Default snooze duration offered to clients.
    pub snooze_minutes_default: i64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enable_push: false,
            enable_in_app: true,
            due_soon_minutes: 30,
            overdue_repeat_minutes: 60,
            snooze_minutes_default: 30,
        }
    }
}

impl NotificationConfig {
    /// The settings-store key this configuration is persisted under.
    pub const SETTINGS_KEY: &'static str = "notifications";

    /// Parses the persisted settings value, falling back to defaults when the
    /// key is absent or its value is not valid JSON.
    pub fn from_setting(raw: Option<&str>) -> Self {
        match raw {
            Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
                log::warn!("Malformed notification settings, using defaults: {}", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }
}

/// # Broadcast Event
///
/// An ephemeral message distributed to every worker process and, from there,
/// to every live client connection. Never persisted; exists only in transit.
///
/// The `kind` tag (e.g., `"reminder.due"`, `"entity.created"`) tells the
/// receiver what happened; `id` and `recipient_id` identify the entity; any
/// additional payload fields ride in the flattened `data` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Event tag, e.g. `"reminder.due"`.
    pub kind: String,
    /// Identifier of the entity the event refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// The care recipient the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<Uuid>,
    /// Additional payload fields, flattened into the JSON object.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl BroadcastEvent {
    /// Creates an event with no extra payload.
    pub fn new(kind: impl Into<String>, id: Option<Uuid>, recipient_id: Option<Uuid>) -> Self {
        Self {
            kind: kind.into(),
            id,
            recipient_id,
            data: Map::new(),
        }
    }

    /// Adds one payload field, builder-style.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Full JSON encoding, as sent on SSE data frames.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| serde_json::json!({ "kind": self.kind }).to_string())
    }
}

/// A Web-Push subscription descriptor, as stored per user-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEndpoint {
    /// Delivery URL of the push service for this subscription.
    pub endpoint: String,
    /// Client public key (P-256, base64url).
    pub p256dh: String,
    /// Client auth secret (base64url).
    pub auth: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_config_defaults_when_missing() {
        let cfg = NotificationConfig::from_setting(None);
        assert_eq!(cfg, NotificationConfig::default());
        assert!(!cfg.enable_push);
        assert!(cfg.enable_in_app);
        assert_eq!(cfg.overdue_repeat_minutes, 60);
    }

    #[test]
    fn notification_config_defaults_when_malformed() {
        let cfg = NotificationConfig::from_setting(Some("{not json"));
        assert_eq!(cfg, NotificationConfig::default());
    }

    #[test]
    fn notification_config_merges_partial_blob() {
        let cfg = NotificationConfig::from_setting(Some(r#"{"enable_push": true}"#));
        assert!(cfg.enable_push);
        assert!(cfg.enable_in_app);
        assert_eq!(cfg.overdue_repeat_minutes, 60);
    }

    #[test]
    fn broadcast_event_round_trips_flattened_fields() {
        let id = Uuid::new_v4();
        let event = BroadcastEvent::new("reminder.due", Some(id), None)
            .with_field("subject_name", serde_json::json!("Ibuprofen"));
        let encoded = event.to_json();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["kind"], "reminder.due");
        assert_eq!(value["id"], serde_json::json!(id.to_string()));
        assert_eq!(value["subject_name"], "Ibuprofen");
        assert!(value.get("recipient_id").is_none());

        let decoded: BroadcastEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kind, "reminder.due");
        assert_eq!(decoded.id, Some(id));
        assert_eq!(decoded.data["subject_name"], "Ibuprofen");
    }
}
