//! Durable delivery queue backed by SQLite.
//!
//! Payloads that could not be published are stored here and re-attempted by
//! [`DeliveryQueue::drain`]. Each failed attempt increments the row's retry
//! count; rows that reach the configured maximum become dead letters, which
//! are never drained again and are only removed by retention cleanup.
//!
//! Every mutation is a single statement, so a drain attempt either commits
//! its delete / retry increment or leaves the row untouched.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::FromRow;
use tracing::{debug, info, warn};

use sitelink_common::{Clock, RetryPolicy, SitePayload, StoreConfig};

use crate::error::StorageError;
use crate::gateway::PublishGateway;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS queued_payloads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        data TEXT NOT NULL,
        retries INTEGER NOT NULL DEFAULT 0,
        last_attempt INTEGER
    )
"#;

const INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_queued_payloads_timestamp ON queued_payloads(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_queued_payloads_retries ON queued_payloads(retries, timestamp)",
];

/// A persisted payload awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct QueuedPayload {
    pub id: i64,
    /// Enqueue time, Unix milliseconds.
    pub timestamp: i64,
    /// Serialized [`SitePayload`].
    pub data: String,
    pub retries: i64,
    /// Time of the last failed attempt, Unix milliseconds.
    pub last_attempt: Option<i64>,
}

impl QueuedPayload {
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    pub fn payload(&self) -> sitelink_common::Result<SitePayload> {
        SitePayload::from_json(&self.data)
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Rows published and deleted.
    pub published: usize,
    /// Rows whose attempt failed (retry count incremented).
    pub failed: usize,
    /// Rows that became dead letters during this pass.
    pub dead_lettered: usize,
    /// The pass stopped early because the gateway went offline.
    pub interrupted: bool,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.published + self.failed
    }
}

/// Row counts by delivery status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Rows still eligible for delivery.
    pub pending: u64,
    /// Rows that exhausted their retries.
    pub dead_letter: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.dead_letter
    }
}

/// SQLite-backed store-and-forward queue.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryQueue {
    /// Open (creating if needed) the queue described by the store configuration.
    pub async fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let policy = RetryPolicy::new(config.max_retries, config.retry_base_delay());
        Self::open_at(&config.resolved_path(), policy, clock).await
    }

    /// Open a queue database file.
    ///
    /// `policy.max_attempts` is the number of failed deliveries after which a
    /// row becomes a dead letter.
    pub async fn open_at(
        path: &Path,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %path.display(), "Opening delivery queue");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: path.display().to_string(),
                source,
            })?;

        Self::with_pool(pool, policy, clock).await
    }

    /// Open a queue that lives only as long as this handle.
    pub async fn open_in_memory(
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|source| {
                StorageError::Open {
                    path: ":memory:".to_string(),
                    source,
                }
            })?;

        // A single connection that is never recycled, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: ":memory:".to_string(),
                source,
            })?;

        Self::with_pool(pool, policy, clock).await
    }

    async fn with_pool(
        pool: SqlitePool,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        for index_sql in INDEXES {
            sqlx::query(index_sql).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            policy,
            clock,
        })
    }

    /// Failed deliveries after which a row becomes a dead letter.
    pub fn max_retries(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Persist a payload with a retry count of zero.
    ///
    /// Invalid payloads are logged and rejected; `Ok(None)` is returned for
    /// them and nothing is stored.
    pub async fn enqueue(&self, payload: &SitePayload) -> Result<Option<i64>, StorageError> {
        if let Err(e) = payload.validate() {
            warn!(error = %e, "Rejecting invalid payload");
            return Ok(None);
        }

        let data = payload
            .to_json()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let now = self.clock.now().timestamp_millis();

        let result = sqlx::query("INSERT INTO queued_payloads (timestamp, data) VALUES (?, ?)")
            .bind(now)
            .bind(data)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        debug!(id, payload_time = %payload.timestamp, "Payload queued");
        Ok(Some(id))
    }

    /// Attempt delivery of up to `max_batch` pending rows, oldest first.
    ///
    /// A successful publish deletes the row. A failure increments its retry
    /// count, stamps the attempt time and suspends the drain for
    /// `base_delay * 2^retries` before the next row. The pass stops as soon as
    /// the gateway reports it is disconnected.
    pub async fn drain(
        &self,
        gateway: &dyn PublishGateway,
        max_batch: u32,
    ) -> Result<DrainReport, StorageError> {
        let rows = sqlx::query_as::<_, QueuedPayload>(
            r#"
            SELECT id, timestamp, data, retries, last_attempt
            FROM queued_payloads
            WHERE retries < ?
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(self.max_retries()))
        .bind(i64::from(max_batch))
        .fetch_all(&self.pool)
        .await?;

        let mut report = DrainReport::default();
        if rows.is_empty() {
            return Ok(report);
        }

        info!(rows = rows.len(), "Draining delivery queue");

        let mut rows = rows.into_iter().peekable();
        while let Some(row) = rows.next() {
            if !gateway.is_connected() {
                info!("Broker went offline, stopping drain");
                report.interrupted = true;
                break;
            }

            let payload = match row.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(id = row.id, error = %e, "Queued payload is unreadable, dead-lettering");
                    self.mark_dead(row.id).await?;
                    report.dead_lettered += 1;
                    continue;
                }
            };

            match gateway.publish(&payload).await {
                Ok(()) => {
                    self.delete(row.id).await?;
                    report.published += 1;
                    debug!(id = row.id, "Queued payload delivered");
                }
                Err(e) => {
                    let retries = self.record_failure(row.id).await?;
                    report.failed += 1;

                    if retries >= i64::from(self.max_retries()) {
                        warn!(
                            id = row.id,
                            retries,
                            error = %e,
                            "Payload exhausted its retries, kept as dead letter"
                        );
                        report.dead_lettered += 1;
                        continue;
                    }

                    debug!(id = row.id, retries, error = %e, "Queued delivery failed");
                    // Back off only between rows of the same pass.
                    if rows.peek().is_some() {
                        let exponent = u32::try_from(retries).unwrap_or(u32::MAX);
                        self.clock.sleep(self.policy.backoff(exponent)).await;
                    }
                }
            }
        }

        info!(
            published = report.published,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "Drain finished"
        );
        Ok(report)
    }

    /// Delete rows enqueued strictly before `now - retention`, whatever their
    /// retry count. Returns the number of rows removed.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64, StorageError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);

        let result = sqlx::query("DELETE FROM queued_payloads WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Retention cleanup removed queued payloads");
        }
        Ok(removed)
    }

    /// Rows that exhausted their retries, oldest first.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<QueuedPayload>, StorageError> {
        let rows = sqlx::query_as::<_, QueuedPayload>(
            r#"
            SELECT id, timestamp, data, retries, last_attempt
            FROM queued_payloads
            WHERE retries >= ?
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(self.max_retries()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Look up a single row.
    pub async fn get(&self, id: i64) -> Result<Option<QueuedPayload>, StorageError> {
        let row = sqlx::query_as::<_, QueuedPayload>(
            "SELECT id, timestamp, data, retries, last_attempt FROM queued_payloads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        let max = i64::from(self.max_retries());

        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queued_payloads WHERE retries < ?")
                .bind(max)
                .fetch_one(&self.pool)
                .await?;
        let dead_letter: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queued_payloads WHERE retries >= ?")
                .bind(max)
                .fetch_one(&self.pool)
                .await?;

        Ok(QueueStats {
            pending: pending.max(0) as u64,
            dead_letter: dead_letter.max(0) as u64,
        })
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        info!("Closing delivery queue");
        self.pool.close().await;
    }

    async fn delete(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM queued_payloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: i64) -> Result<i64, StorageError> {
        let now = self.clock.now().timestamp_millis();
        let retries: i64 = sqlx::query_scalar(
            "UPDATE queued_payloads SET retries = retries + 1, last_attempt = ? WHERE id = ? RETURNING retries",
        )
        .bind(now)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(retries)
    }

    async fn mark_dead(&self, id: i64) -> Result<(), StorageError> {
        let now = self.clock.now().timestamp_millis();
        sqlx::query("UPDATE queued_payloads SET retries = MAX(retries, ?), last_attempt = ? WHERE id = ?")
            .bind(i64::from(self.max_retries()))
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
