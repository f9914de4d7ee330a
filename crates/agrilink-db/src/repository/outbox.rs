//! # Outbox Repository
//!
//! Durable queue of telemetry records awaiting delivery to the cloud.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Record Lifecycle                              │
//! │                                                                         │
//! │  INGESTION                                                             │
//! │       │  append()                                                       │
//! │       ▼                                                                 │
//! │  ┌──────────┐  lease_batch()  ┌───────────┐  acknowledge()  ┌───────┐  │
//! │  │ Pending  │ ──────────────► │ InFlight  │ ──────────────► │ Acked │  │
//! │  └──────────┘                 └───────────┘                 └───────┘  │
//! │       ▲                          │     │                        │      │
//! │       │  retry() / recover()     │     │ retry() past            │      │
//! │       └──────────────────────────┘     │ max_attempts           ▼      │
//! │                                        ▼                  purge_acked() │
//! │                               ┌───────────────┐                        │
//! │                               │ DeadLettered  │ ← kept until requeued  │
//! │                               └───────────────┘                        │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • append() returns only after the record is committed                 │
//! │  • at most one device's records are in flight per lease (per device)   │
//! │  • concurrent leases never return the same record                      │
//! │  • after a crash, InFlight records return to Pending exactly once      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutating operations hold the database writer lock for the duration
//! of their transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use agrilink_core::{NewOutboxRecord, OutboxRecord, OutboxStats, SyncStatus};

use crate::error::{DbError, DbResult};

/// Columns selected into [`OutboxRecord`].
const RECORD_COLUMNS: &str = "id, sequence, tenant_id, device_id, topic, payload, captured_at, \
     sync_status, attempt_count, last_attempt_at, last_error, correlation_id, acked_at, \
     dead_lettered_at";

/// Default number of failed attempts before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// =============================================================================
// Policy / Outcomes
// =============================================================================

/// Limits applied by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxPolicy {
    /// A record whose attempt count would exceed this is dead-lettered.
    pub max_attempts: u32,

    /// Maximum unresolved (not acked) records; `None` for no cap.
    pub max_records: Option<u64>,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        OutboxPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_records: None,
        }
    }
}

/// Result of [`OutboxRepository::retry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Records returned to Pending.
    pub requeued: u64,
    /// Records that crossed `max_attempts`, in id order.
    pub dead_lettered: Vec<OutboxRecord>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for outbox operations.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    policy: OutboxPolicy,
}

impl OutboxRepository {
    /// Creates a new OutboxRepository.
    pub fn new(pool: SqlitePool, write_lock: Arc<Mutex<()>>, policy: OutboxPolicy) -> Self {
        OutboxRepository {
            pool,
            write_lock,
            policy,
        }
    }

    pub fn policy(&self) -> OutboxPolicy {
        self.policy
    }

    /// Durably appends a record, assigning its id and per-device sequence.
    ///
    /// ## Errors
    /// - `StorageFull` when SQLite is out of space or `max_records` is reached
    /// - `StorageUnavailable` when the database cannot be reached
    pub async fn append(&self, record: NewOutboxRecord) -> DbResult<OutboxRecord> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if let Some(max_records) = self.policy.max_records {
            let unresolved: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM outbox_records WHERE sync_status != 'acked'",
            )
            .fetch_one(&mut *tx)
            .await?;

            if unresolved as u64 >= max_records {
                return Err(DbError::StorageFull(format!(
                    "outbox holds {} unresolved records (max {})",
                    unresolved, max_records
                )));
            }
        }

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO device_sequences (tenant_id, device_id, last_sequence)
            VALUES (?1, ?2, 1)
            ON CONFLICT (tenant_id, device_id)
            DO UPDATE SET last_sequence = last_sequence + 1
            RETURNING last_sequence
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.device_id)
        .fetch_one(&mut *tx)
        .await?;

        let stored = sqlx::query_as::<_, OutboxRecord>(&format!(
            r#"
            INSERT INTO outbox_records (
                sequence, tenant_id, device_id, topic, payload, captured_at, correlation_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(sequence)
        .bind(&record.tenant_id)
        .bind(&record.device_id)
        .bind(&record.topic)
        .bind(&record.payload)
        .bind(record.captured_at)
        .bind(&record.correlation_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            id = stored.id,
            sequence = stored.sequence,
            tenant_id = %stored.tenant_id,
            device_id = %stored.device_id,
            correlation_id = %stored.correlation_id,
            "Record appended to outbox"
        );

        Ok(stored)
    }

    /// Leases the oldest Pending records and marks them InFlight.
    ///
    /// Devices that already have an InFlight record are skipped. Stops at
    /// `max_count` records or before the payload total would exceed
    /// `max_bytes`; the first record is always taken.
    pub async fn lease_batch(&self, max_count: u32, max_bytes: usize) -> DbResult<Vec<OutboxRecord>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query_as::<_, OutboxRecord>(&format!(
            r#"
            SELECT {}
            FROM outbox_records o
            WHERE o.sync_status = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM outbox_records f
                  WHERE f.tenant_id = o.tenant_id
                    AND f.device_id = o.device_id
                    AND f.sync_status = 'in_flight'
              )
            ORDER BY o.id ASC
            LIMIT ?1
            "#,
            RECORD_COLUMNS
        ))
        .bind(i64::from(max_count))
        .fetch_all(&mut *tx)
        .await?;

        let mut batch = Vec::with_capacity(candidates.len());
        let mut total_bytes = 0usize;
        for record in candidates {
            let len = record.payload_len();
            if !batch.is_empty() && total_bytes + len > max_bytes {
                break;
            }
            total_bytes += len;
            batch.push(record);
        }

        if batch.is_empty() {
            return Ok(batch);
        }

        let now = Utc::now();
        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE outbox_records SET sync_status = 'in_flight', last_attempt_at = ",
        );
        query.push_bind(now);
        query.push(" WHERE sync_status = 'pending' AND id IN ");
        push_id_list(&mut query, &ids);
        query.build().execute(&mut *tx).await?;

        tx.commit().await?;

        for record in &mut batch {
            record.sync_status = SyncStatus::InFlight;
            record.last_attempt_at = Some(now);
        }

        debug!(count = batch.len(), bytes = total_bytes, "Leased outbox batch");
        Ok(batch)
    }

    /// Marks InFlight records as Acked. Ids in any other state are ignored.
    pub async fn acknowledge(&self, ids: &[i64]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE outbox_records SET sync_status = 'acked', acked_at = ");
        query.push_bind(Utc::now());
        query.push(" WHERE sync_status = 'in_flight' AND id IN ");
        push_id_list(&mut query, ids);

        let result = query.build().execute(&self.pool).await?;

        debug!(acked = result.rows_affected(), "Acknowledged outbox records");
        Ok(result.rows_affected())
    }

    /// Returns InFlight records to Pending after a failed attempt.
    ///
    /// Each record's attempt count is incremented and `error` stored. A record
    /// whose new attempt count exceeds `max_attempts` is dead-lettered instead.
    pub async fn retry(&self, ids: &[i64], error: &str) -> DbResult<RetryOutcome> {
        if ids.is_empty() {
            return Ok(RetryOutcome::default());
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut select: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, attempt_count FROM outbox_records WHERE sync_status = 'in_flight' AND id IN ",
        );
        push_id_list(&mut select, ids);
        let attempts: Vec<(i64, i64)> = select.build_query_as().fetch_all(&mut *tx).await?;

        let max_attempts = i64::from(self.policy.max_attempts);
        let (exhausted, requeue): (Vec<(i64, i64)>, Vec<(i64, i64)>) = attempts
            .into_iter()
            .partition(|(_, count)| count + 1 > max_attempts);
        let exhausted: Vec<i64> = exhausted.into_iter().map(|(id, _)| id).collect();
        let requeue: Vec<i64> = requeue.into_iter().map(|(id, _)| id).collect();

        let mut requeued = 0;
        if !requeue.is_empty() {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE outbox_records SET sync_status = 'pending', \
                 attempt_count = attempt_count + 1, last_error = ",
            );
            query.push_bind(error.to_string());
            query.push(" WHERE id IN ");
            push_id_list(&mut query, &requeue);
            requeued = query.build().execute(&mut *tx).await?.rows_affected();
        }

        let mut dead_lettered = Vec::new();
        if !exhausted.is_empty() {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE outbox_records SET sync_status = 'dead_lettered', \
                 attempt_count = attempt_count + 1, last_error = ",
            );
            query.push_bind(error.to_string());
            query.push(", dead_lettered_at = ");
            query.push_bind(Utc::now());
            query.push(" WHERE id IN ");
            push_id_list(&mut query, &exhausted);
            query.build().execute(&mut *tx).await?;

            let mut fetch: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM outbox_records WHERE id IN ", RECORD_COLUMNS));
            push_id_list(&mut fetch, &exhausted);
            fetch.push(" ORDER BY id ASC");
            dead_lettered = fetch
                .build_query_as::<OutboxRecord>()
                .fetch_all(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        for record in &dead_lettered {
            warn!(
                id = record.id,
                sequence = record.sequence,
                tenant_id = %record.tenant_id,
                device_id = %record.device_id,
                attempts = record.attempt_count,
                correlation_id = %record.correlation_id,
                error = %error,
                "Record dead-lettered after exhausting delivery attempts"
            );
        }

        debug!(requeued, dead_lettered = dead_lettered.len(), "Retried outbox records");

        Ok(RetryOutcome {
            requeued,
            dead_lettered,
        })
    }

    /// Startup recovery: returns every InFlight record to Pending without
    /// counting an attempt.
    pub async fn recover_in_flight(&self) -> DbResult<u64> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "UPDATE outbox_records SET sync_status = 'pending' WHERE sync_status = 'in_flight'",
        )
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered in-flight records from previous run");
        }
        Ok(recovered)
    }

    /// Deletes Acked records acknowledged before `older_than`.
    /// Dead-lettered records are never purged.
    pub async fn purge_acked(&self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "DELETE FROM outbox_records WHERE sync_status = 'acked' AND acked_at < ?1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Counts records per status.
    pub async fn count_by_status(&self) -> DbResult<OutboxStats> {
        let rows: Vec<(SyncStatus, i64)> = sqlx::query_as(
            "SELECT sync_status, COUNT(*) FROM outbox_records GROUP BY sync_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status {
                SyncStatus::Pending => stats.pending = count,
                SyncStatus::InFlight => stats.in_flight = count,
                SyncStatus::Acked => stats.acked = count,
                SyncStatus::DeadLettered => stats.dead_lettered = count,
            }
        }
        Ok(stats)
    }

    /// Oldest dead-lettered records first.
    pub async fn list_dead_letters(&self, limit: u32) -> DbResult<Vec<OutboxRecord>> {
        let records = sqlx::query_as::<_, OutboxRecord>(&format!(
            "SELECT {} FROM outbox_records WHERE sync_status = 'dead_lettered' \
             ORDER BY id ASC LIMIT ?1",
            RECORD_COLUMNS
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Operator action: puts a dead-lettered record back in the queue with
    /// a fresh attempt budget.
    pub async fn requeue_dead_letter(&self, id: i64) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE outbox_records SET
                sync_status = 'pending',
                attempt_count = 0,
                dead_lettered_at = NULL
            WHERE id = ?1 AND sync_status = 'dead_lettered'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("DeadLetter", id));
        }

        info!(id, "Dead-lettered record requeued");
        Ok(())
    }

    /// Gets a record by id.
    pub async fn get(&self, id: i64) -> DbResult<Option<OutboxRecord>> {
        let record = sqlx::query_as::<_, OutboxRecord>(&format!(
            "SELECT {} FROM outbox_records WHERE id = ?1",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

/// Appends `(?, ?, ...)` with one bind per id.
fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    query.push("(");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

// =============================================================================
// Unit Tests
// =============================================================================
