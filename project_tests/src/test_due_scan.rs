//! # Due Scan Dry Run
//!
//! Feeds a fabricated reminder set through the due-time calculator and the
//! scan planner, printing the classification and the resulting plan. Useful
//! for eyeballing suppression behavior without a database.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use lib_common::core::scheduler::plan_scan;
use lib_common::models::{NotificationConfig, Reminder, ReminderWithSubject, Subject};
use lib_common::reminders::due::classify;

fn fabricate(
    name: &str,
    interval_hours: i32,
    completed_ago: Duration,
    notified_ago: Option<Duration>,
    now: DateTime<Utc>,
) -> ReminderWithSubject {
    ReminderWithSubject {
        reminder: Reminder {
            id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            start_time: None,
            interval_hours: Some(interval_hours),
            enabled: true,
            last_completed_at: Some(now - completed_ago),
            last_skipped_at: None,
            last_notified_at: notified_ago.map(|ago| now - ago),
        },
        subject: Subject {
            id: Uuid::new_v4(),
            name: name.to_string(),
            default_interval_hours: None,
            early_warning_minutes: 15,
        },
    }
}

fn main() {
    let now = Utc::now();

    let items = vec![
        // Overdue by an hour, never notified: expect a payload.
        fabricate("Paracetamol", 4, Duration::hours(5), None, now),
        // Overdue, notified 10 minutes ago: expect suppression.
        fabricate(
            "Ibuprofen",
            4,
            Duration::hours(5),
            Some(Duration::minutes(10)),
            now,
        ),
        // Inside the early-warning window.
        fabricate(
            "Vitamin D",
            4,
            Duration::hours(4) - Duration::minutes(10),
            None,
            now,
        ),
        // Nowhere near due.
        fabricate("Amoxicillin", 8, Duration::hours(1), None, now),
    ];

    println!("[*] Classification at {}", now.to_rfc3339());
    println!("-----------------------------------------------");
    for item in &items {
        println!(
            "{:<12} -> {:?}",
            item.subject.name,
            classify(item, now)
        );
    }

    let config = NotificationConfig::default();
    let plan = plan_scan(&items, &config, now);

    println!("\n[*] Scan plan ({:?})", config);
    println!("-----------------------------------------------");
    println!(
        "{} payload(s), {} notification stamp(s)",
        plan.payloads.len(),
        plan.notified.len()
    );
    for payload in &plan.payloads {
        println!("{}", payload.to_json());
    }
}
