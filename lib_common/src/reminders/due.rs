//! # Due-Time Calculator
//!
//! Pure functions computing when a reminder is next due and how the current
//! instant relates to that due time. No I/O, fully deterministic given
//! inputs, so both the scan loop and an early-administration check reproduce
//! exactly the same trichotomy: due, within-window-early, too-early.
//!
//! Boundary rules (inclusive):
//! - `now == next_due` counts as due.
//! - `now == next_due - early_warning_window` counts as within-window.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::ReminderWithSubject;

/// How early an early administration is, relative to the warning window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    /// Within the early-warning window before the due time.
    WithinWindow,
    /// Before the early-warning window opens.
    TooEarly,
}

/// Classification of a reminder at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueStatus {
    /// No schedule can be computed (no anchor instant, or no interval).
    Unknown,
    /// Due or overdue: `now >= next_due`. `minutes_until_due` is <= 0.
    Due {
        next_due: DateTime<Utc>,
        minutes_until_due: i64,
    },
    /// Not yet due.
    Early {
        next_due: DateTime<Utc>,
        minutes_until_due: i64,
        warning: WarningLevel,
    },
}

/// The interval in effect for a reminder: its own override, else the
/// subject's default.
pub fn effective_interval_hours(item: &ReminderWithSubject) -> Option<i32> {
    item.reminder
        .interval_hours
        .or(item.subject.default_interval_hours)
}

/// Computes the next due instant: base anchor plus the effective interval.
///
/// The base is `last_completed_at` when present, else `start_time`. Returns
/// `None` when the reminder has no defined schedule (no anchor, or neither
/// the reminder nor its subject carries an interval).
pub fn next_due(item: &ReminderWithSubject) -> Option<DateTime<Utc>> {
    let base = item.reminder.last_completed_at.or(item.reminder.start_time)?;
    let hours = effective_interval_hours(item)?;
    Some(base + Duration::hours(i64::from(hours)))
}

/// Classifies a reminder relative to `now`.
///
/// Monotonic in `now`: as `now` advances past `next_due - window` and then
/// past `next_due`, the state transitions too-early -> within-window -> due,
/// never skipping or reversing.
pub fn classify(item: &ReminderWithSubject, now: DateTime<Utc>) -> DueStatus {
    let Some(due) = next_due(item) else {
        return DueStatus::Unknown;
    };

    // Floor division so e.g. -30 seconds reports -1 minute, matching the
    // "minutes until due" a client renders.
    let minutes_until_due = (due - now).num_seconds().div_euclid(60);

    if now >= due {
        return DueStatus::Due {
            next_due: due,
            minutes_until_due,
        };
    }

    let warning_start = due - Duration::minutes(i64::from(item.subject.early_warning_minutes));
    let warning = if now >= warning_start {
        WarningLevel::WithinWindow
    } else {
        WarningLevel::TooEarly
    };

    DueStatus::Early {
        next_due: due,
        minutes_until_due,
        warning,
    }
}
