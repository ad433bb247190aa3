//! # Reminder Scan Loop
//!
//! The periodic due-time engine. Every cycle loads the notification settings
//! and all enabled reminders, decides which reminders are newly due, stamps
//! their `last_notified_at` in one batch, and dispatches the resulting
//! payloads: in-app through the broadcast channel, push through the external
//! delivery capability.
//!
//! ## Guarantees:
//! - **Single-flight.** At most one scan executes at a time; overlapping
//!   triggers are skipped, never queued (skip-tick behavior plus an explicit
//!   in-progress flag).
//! - **Crash-proof loop.** Any error inside a cycle is caught and logged;
//!   the next scheduled cycle proceeds normally.
//! - **Duplicate suppression.** A reminder already notified for the current
//!   occurrence is not re-notified until `overdue_repeat_minutes` have
//!   passed; with a non-positive repeat setting it is never re-notified
//!   until fulfillment resets its due time.
//! - **Zero due, zero writes.** A scan that finds nothing due performs no
//!   store updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::pubsub::PubSub;
use crate::models::{BroadcastEvent, NotificationConfig, Reminder, ReminderWithSubject};
use crate::reminders::due::next_due;
use crate::store::{PushDelivery, ReminderStore, SettingsStore};

/// Default scan period.
pub const DEFAULT_SCAN_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// The decisions of one scan cycle: payloads to dispatch and the
/// `last_notified_at` stamps to persist in one batch.
#[derive(Debug, Default)]
pub struct ScanPlan {
    /// Due-notification payloads, one per newly-due reminder.
    pub payloads: Vec<BroadcastEvent>,
    /// `(reminder_id, notified_at)` updates to persist.
    pub notified: Vec<(Uuid, DateTime<Utc>)>,
}

/// Whether a due reminder was already notified for the current occurrence
/// and is still within the repeat-suppression window.
///
/// `last_notified_at >= next_due` means the stamp belongs to this occurrence
/// (fulfillment moves `next_due` forward and resets the comparison). With a
/// non-positive `repeat_minutes`, such a reminder is never re-notified.
pub fn should_skip_notification(
    reminder: &Reminder,
    next_due: DateTime<Utc>,
    now: DateTime<Utc>,
    repeat_minutes: i64,
) -> bool {
    let Some(last_notified) = reminder.last_notified_at else {
        return false;
    };
    if last_notified < next_due {
        return false;
    }
    if repeat_minutes <= 0 {
        return true;
    }
    now - last_notified < Duration::minutes(repeat_minutes)
}

/// Builds the wire payload for one due reminder. The reminder id rides both
/// in the generic envelope `id` and under the explicit `reminder_id` key
/// consumers of this event kind select on.
fn due_event(item: &ReminderWithSubject, due_at: DateTime<Utc>) -> BroadcastEvent {
    BroadcastEvent::new(
        "reminder.due",
        Some(item.reminder.id),
        Some(item.reminder.recipient_id),
    )
    .with_field("reminder_id", json!(item.reminder.id))
    .with_field("subject_id", json!(item.subject.id))
    .with_field("subject_name", json!(item.subject.name))
    .with_field(
        "next_due",
        json!(due_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    )
    .with_field("title", json!("Reminder due"))
    .with_field("body", json!(format!("{} is due.", item.subject.name)))
    .with_field("url", json!("/"))
}

/// # Plan Scan
///
/// The pure decision core of a cycle. For each enabled reminder: compute the
/// next due time, skip anything unschedulable or not yet due, apply the
/// suppression rule, and collect a payload plus a notification stamp for the
/// rest. Deterministic given its inputs; all I/O stays in the caller.
pub fn plan_scan(
    items: &[ReminderWithSubject],
    config: &NotificationConfig,
    now: DateTime<Utc>,
) -> ScanPlan {
    let mut plan = ScanPlan::default();

    for item in items {
        let Some(due_at) = next_due(item) else {
            continue;
        };
        if now < due_at {
            continue;
        }
        if should_skip_notification(&item.reminder, due_at, now, config.overdue_repeat_minutes) {
            continue;
        }

        plan.notified.push((item.reminder.id, now));
        plan.payloads.push(due_event(item, due_at));
    }

    plan
}

/// # Reminder Scheduler
///
/// Owns the periodic scan task. Constructed once at startup; `run` is spawned
/// as a long-lived task and exits when the shutdown token fires.
pub struct ReminderScheduler {
    store: Arc<dyn ReminderStore>,
    settings: Arc<dyn SettingsStore>,
    push: Arc<dyn PushDelivery>,
    pubsub: Arc<PubSub>,
    scan_interval: StdDuration,
    in_flight: AtomicBool,
}

impl ReminderScheduler {
    /// Creates a scheduler over the given collaborators.
    pub fn new(
        store: Arc<dyn ReminderStore>,
        settings: Arc<dyn SettingsStore>,
        push: Arc<dyn PushDelivery>,
        pubsub: Arc<PubSub>,
        scan_interval: StdDuration,
    ) -> Self {
        Self {
            store,
            settings,
            push,
            pubsub,
            scan_interval,
            in_flight: AtomicBool::new(false),
        }
    }

    /// # Main Scan Loop
    ///
    /// Ticks at the configured period until `shutdown` fires. Missed ticks
    /// are skipped, and the in-progress flag coalesces any overlapping
    /// trigger instead of queueing it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Reminder scheduler started (period: {:?})",
            self.scan_interval
        );
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.try_scan(Utc::now()).await;
                }
            }
        }
        info!("Reminder scheduler stopped");
    }

    /// Runs one cycle unless another is already in flight, in which case the
    /// trigger is skipped (never queued). Returns whether a cycle ran. A
    /// failed cycle is logged and counts as having run.
    pub async fn try_scan(&self, now: DateTime<Utc>) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous reminder scan still running; skipping this trigger");
            return false;
        }
        if let Err(e) = self.scan_once(now).await {
            error!("Reminder scan failed: {:#}", e);
        }
        self.in_flight.store(false, Ordering::SeqCst);
        true
    }

    /// Executes one scan cycle at instant `now`.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let raw = self
            .settings
            .get_setting(NotificationConfig::SETTINGS_KEY)
            .await?;
        let config = NotificationConfig::from_setting(raw.as_deref());

        let items = self.store.enabled_reminders().await?;
        let plan = plan_scan(&items, &config, now);
        if plan.notified.is_empty() {
            return Ok(());
        }

        info!("Reminder scan found {} due reminder(s)", plan.notified.len());
        self.store.mark_notified(&plan.notified).await?;

        if config.enable_in_app {
            for payload in &plan.payloads {
                self.pubsub.publish(payload).await;
            }
        }

        if config.enable_push {
            let endpoints = self.store.active_push_subscriptions().await?;
            if !endpoints.is_empty() {
                // Push delivery can be slow; run the batch off the scan loop.
                let push = Arc::clone(&self.push);
                let payloads = plan.payloads.clone();
                tokio::spawn(async move {
                    deliver_push_batch(push, endpoints, payloads).await;
                });
            }
        }

        Ok(())
    }
}

/// Delivers every payload to every endpoint. Per-endpoint failures are
/// logged and do not abort the batch.
async fn deliver_push_batch(
    push: Arc<dyn PushDelivery>,
    endpoints: Vec<crate::models::PushEndpoint>,
    payloads: Vec<BroadcastEvent>,
) {
    for payload in &payloads {
        let data = payload.to_json();
        for endpoint in &endpoints {
            if let Err(e) = push.deliver(endpoint, data.as_bytes()).await {
                warn!("Push delivery failed for endpoint {}: {}", endpoint.endpoint, e);
            }
        }
    }
}
