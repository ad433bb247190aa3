//! # PostgreSQL Store
//!
//! Pooled implementation of [`ReminderStore`] and [`SettingsStore`] over
//! `deadpool_postgres`. The pool serves the scan loop's read/write queries;
//! the broadcast channel holds its own dedicated connection and does not go
//! through this pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::models::{PushEndpoint, Reminder, ReminderWithSubject, Subject};
use crate::store::{ReminderStore, SettingsStore};

/// Enabled reminders joined with their subject, one row per reminder.
const ENABLED_REMINDERS_SQL: &str = "\
    SELECT r.id, r.recipient_id, r.subject_id, r.start_time, r.interval_hours, \
           r.enabled, r.last_completed_at, r.last_skipped_at, r.last_notified_at, \
           s.name AS subject_name, s.default_interval_hours, s.early_warning_minutes \
    FROM reminders r \
    JOIN subjects s ON s.id = r.subject_id \
    WHERE r.enabled = TRUE";

const MARK_NOTIFIED_SQL: &str =
    "UPDATE reminders SET last_notified_at = $2 WHERE id = $1";

const GET_SETTING_SQL: &str = "SELECT value FROM app_settings WHERE key = $1";

const ACTIVE_PUSH_SUBSCRIPTIONS_SQL: &str = "\
    SELECT p.endpoint, p.p256dh, p.auth \
    FROM push_subscriptions p \
    JOIN users u ON u.id = p.user_id \
    WHERE u.is_active = TRUE";

/// # PostgreSQL Store
///
/// Owns the connection pool. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Builds the pool against `db_url`. `RecyclingMethod::Fast` is the
    /// recommended recycling mode for tokio-postgres managers.
    pub fn connect(db_url: &str) -> anyhow::Result<Self> {
        let mut pg_pool_config = DeadpoolConfig::new();
        pg_pool_config.url = Some(db_url.to_string());
        pg_pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = pg_pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool, e.g. one shared with other components.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

fn row_to_item(row: &tokio_postgres::Row) -> ReminderWithSubject {
    ReminderWithSubject {
        reminder: Reminder {
            id: row.get("id"),
            recipient_id: row.get("recipient_id"),
            subject_id: row.get("subject_id"),
            start_time: row.get("start_time"),
            interval_hours: row.get("interval_hours"),
            enabled: row.get("enabled"),
            last_completed_at: row.get("last_completed_at"),
            last_skipped_at: row.get("last_skipped_at"),
            last_notified_at: row.get("last_notified_at"),
        },
        subject: Subject {
            id: row.get("subject_id"),
            name: row.get("subject_name"),
            default_interval_hours: row.get("default_interval_hours"),
            early_warning_minutes: row.get("early_warning_minutes"),
        },
    }
}

#[async_trait]
impl ReminderStore for PgStore {
    async fn enabled_reminders(&self) -> anyhow::Result<Vec<ReminderWithSubject>> {
        let client = self.pool.get().await?;
        let rows = client.query(ENABLED_REMINDERS_SQL, &[]).await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    async fn mark_notified(&self, updates: &[(Uuid, DateTime<Utc>)]) -> anyhow::Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(MARK_NOTIFIED_SQL).await?;
        for (id, at) in updates {
            tx.execute(&stmt, &[id, at]).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn active_push_subscriptions(&self) -> anyhow::Result<Vec<PushEndpoint>> {
        let client = self.pool.get().await?;
        let rows = client.query(ACTIVE_PUSH_SUBSCRIPTIONS_SQL, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| PushEndpoint {
                endpoint: row.get("endpoint"),
                p256dh: row.get("p256dh"),
                auth: row.get("auth"),
            })
            .collect())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(GET_SETTING_SQL, &[&key]).await?;
        Ok(row.map(|r| r.get("value")))
    }
}
