//! libSQL backend: durable `BrokerQueue` and `ResultStore`.
//!
//! Supports local file and in-memory databases. Timestamps that take part in
//! ordering or comparisons (`scheduled_for`, `lease_expires_at`,
//! `finished_at`) are stored as Unix milliseconds; audit columns are RFC 3339.
//! Succeeded and dead envelopes keep their `task_queue` row until
//! [`BrokerQueue::purge_finished`] removes it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError, ResultError};
use crate::queue::{BrokerQueue, ClaimedTask, DEFAULT_VISIBILITY_TIMEOUT, QueueStats, RequeueReason};
use crate::results::{DEFAULT_RETENTION, ResultStore, TaskResult};
use crate::store::migrations;
use crate::tasks::{
    Lease, TaskEnvelope, TaskId, TaskOrigin, TaskStatus, checked_after, checked_before,
};

const TASK_COLUMNS: &str = "id, seq, task_type, payload, scheduled_for, attempt, max_attempts, \
     status, created_by, last_error, lease_id, lease_expires_at, created_at, updated_at, result";

const RESULT_COLUMNS: &str = "id, task_type, status, attempt, result, error, finished_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// Claims are serialized behind `claim_lock` so reclaim-then-claim runs as
/// one step per dequeue.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    claim_lock: Mutex<()>,
    visibility_timeout: Duration,
    retention: Duration,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            claim_lock: Mutex::new(()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            retention: DEFAULT_RETENTION,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Reclaim expired leases. Caller holds `claim_lock`.
    async fn reclaim_locked(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let count = self
            .conn()
            .execute(
                "UPDATE task_queue SET status = 'pending', lease_id = NULL, \
                 lease_expires_at = NULL, updated_at = ?1 \
                 WHERE status = 'running' \
                 AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)",
                params![now.to_rfc3339(), now.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_expired: {e}")))?;
        if count > 0 {
            warn!(count, "Expired leases returned to pending");
        }
        Ok(count as usize)
    }

    /// Apply a lease-guarded update and turn "no row matched" into the right error.
    async fn leased_update(
        &self,
        id: TaskId,
        sql: &str,
        params: Vec<libsql::Value>,
        op: &str,
    ) -> Result<(), QueueError> {
        let count = self
            .conn()
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        if count > 0 {
            return Ok(());
        }
        match BrokerQueue::get(self, id).await? {
            Some(_) => Err(QueueError::LeaseExpired { id }),
            None => Err(QueueError::NotFound(id)),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Text(s) => Ok(Some(s)),
        _ => Ok(None),
    }
}

fn row_opt_i64(row: &libsql::Row, idx: i32) -> Result<Option<i64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Integer(n) => Ok(Some(n)),
        _ => Ok(None),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Map a libsql Row to a TaskEnvelope. Column order matches TASK_COLUMNS.
fn row_to_envelope(row: &libsql::Row) -> Result<TaskEnvelope, DatabaseError> {
    let q = |e: libsql::Error| DatabaseError::Query(e.to_string());

    let id_str: String = row.get(0).map_err(q)?;
    let seq: i64 = row.get(1).map_err(q)?;
    let task_type: String = row.get(2).map_err(q)?;
    let payload_str: String = row.get(3).map_err(q)?;
    let scheduled_ms: i64 = row.get(4).map_err(q)?;
    let attempt: i64 = row.get(5).map_err(q)?;
    let max_attempts: i64 = row.get(6).map_err(q)?;
    let status_str: String = row.get(7).map_err(q)?;
    let origin_str: String = row.get(8).map_err(q)?;
    let last_error = row_opt_text(row, 9).map_err(q)?;
    let lease_id = row_opt_text(row, 10).map_err(q)?;
    let lease_expires = row_opt_i64(row, 11).map_err(q)?;
    let created_str: String = row.get(12).map_err(q)?;
    let updated_str: String = row.get(13).map_err(q)?;
    let result = row_opt_text(row, 14).map_err(q)?;

    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("payload of {id_str}: {e}")))?;
    let status: TaskStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let created_by: TaskOrigin = origin_str.parse().map_err(DatabaseError::Serialization)?;
    let result = result
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("result of {id_str}: {e}")))?;
    let lease = match (lease_id, lease_expires) {
        (Some(l), Some(ms)) => Some(Lease {
            lease_id: parse_uuid(&l)?,
            expires_at: from_millis(ms),
        }),
        _ => None,
    };

    Ok(TaskEnvelope {
        id: parse_uuid(&id_str)?,
        task_type,
        payload,
        scheduled_for: from_millis(scheduled_ms),
        attempt: attempt.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        status,
        created_by,
        seq: seq.max(0) as u64,
        last_error,
        lease,
        result,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a TaskResult. Column order matches RESULT_COLUMNS.
fn row_to_result(row: &libsql::Row) -> Result<TaskResult, DatabaseError> {
    let q = |e: libsql::Error| DatabaseError::Query(e.to_string());

    let id_str: String = row.get(0).map_err(q)?;
    let task_type: String = row.get(1).map_err(q)?;
    let status_str: String = row.get(2).map_err(q)?;
    let attempt: i64 = row.get(3).map_err(q)?;
    let result = row_opt_text(row, 4).map_err(q)?;
    let error = row_opt_text(row, 5).map_err(q)?;
    let finished_ms: i64 = row.get(6).map_err(q)?;

    let result = result
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("result of {id_str}: {e}")))?;

    Ok(TaskResult {
        id: parse_uuid(&id_str)?,
        task_type,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        attempt: attempt.max(0) as u32,
        result,
        error,
        finished_at: from_millis(finished_ms),
    })
}

// ── BrokerQueue ─────────────────────────────────────────────────────

#[async_trait]
impl BrokerQueue for LibSqlBackend {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskId, QueueError> {
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&envelope.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO task_queue (id, task_type, payload, scheduled_for, attempt, \
                 max_attempts, status, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?8)",
                params![
                    envelope.id.to_string(),
                    envelope.task_type.clone(),
                    payload,
                    envelope.scheduled_for.timestamp_millis(),
                    envelope.attempt as i64,
                    envelope.max_attempts as i64,
                    envelope.created_by.as_str(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            scheduled_for = %envelope.scheduled_for,
            "Enqueued task"
        );
        Ok(envelope.id)
    }

    async fn dequeue_ready(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        let _guard = self.claim_lock.lock().await;
        let now = Utc::now();
        self.reclaim_locked(now).await?;

        let lease_id = Uuid::new_v4();
        let expires_at = checked_after(now, self.visibility_timeout).ok_or_else(|| {
            QueueError::TimeOutOfRange(format!("visibility timeout {:?}", self.visibility_timeout))
        })?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE task_queue SET status = 'running', lease_id = ?1, \
                     lease_expires_at = ?2, updated_at = ?3 \
                     WHERE id IN (\
                        SELECT id FROM task_queue \
                        WHERE status IN ('pending', 'failed_retrying') AND scheduled_for <= ?4 \
                        ORDER BY scheduled_for, seq LIMIT ?5\
                     ) RETURNING {TASK_COLUMNS}"
                ),
                params![
                    lease_id.to_string(),
                    expires_at.timestamp_millis(),
                    now.to_rfc3339(),
                    now.timestamp_millis(),
                    limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dequeue_ready: {e}")))?;

        let mut claimed = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("dequeue_ready: {e}")))?
        {
            let envelope = row_to_envelope(&row)?;
            claimed.push(ClaimedTask { envelope, lease_id });
        }
        // RETURNING order is unspecified.
        claimed.sort_by_key(|c| (c.envelope.scheduled_for, c.envelope.seq));
        Ok(claimed)
    }

    async fn ack(
        &self,
        id: TaskId,
        lease_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let result =
            serde_json::to_string(&result).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.leased_update(
            id,
            "UPDATE task_queue SET status = 'succeeded', attempt = MIN(attempt + 1, max_attempts), \
             result = ?1, lease_id = NULL, lease_expires_at = NULL, \
             finished_at = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = 'running' AND lease_id = ?5",
            vec![
                libsql::Value::Text(result),
                libsql::Value::Integer(now.timestamp_millis()),
                libsql::Value::Text(now.to_rfc3339()),
                libsql::Value::Text(id.to_string()),
                libsql::Value::Text(lease_id.to_string()),
            ],
            "ack",
        )
        .await?;
        debug!(task_id = %id, "Task acknowledged");
        Ok(())
    }

    async fn retry(
        &self,
        id: TaskId,
        lease_id: Uuid,
        next_time: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        self.leased_update(
            id,
            "UPDATE task_queue SET status = 'failed_retrying', \
             attempt = MIN(attempt + 1, max_attempts), scheduled_for = ?1, last_error = ?2, \
             lease_id = NULL, lease_expires_at = NULL, updated_at = ?3 \
             WHERE id = ?4 AND status = 'running' AND lease_id = ?5",
            vec![
                libsql::Value::Integer(next_time.timestamp_millis()),
                libsql::Value::Text(error.to_string()),
                libsql::Value::Text(Utc::now().to_rfc3339()),
                libsql::Value::Text(id.to_string()),
                libsql::Value::Text(lease_id.to_string()),
            ],
            "retry",
        )
        .await
    }

    async fn dead_letter(
        &self,
        id: TaskId,
        lease_id: Uuid,
        reason: &str,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        self.leased_update(
            id,
            "UPDATE task_queue SET status = 'dead', attempt = MIN(attempt + 1, max_attempts), \
             last_error = ?1, lease_id = NULL, lease_expires_at = NULL, \
             finished_at = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = 'running' AND lease_id = ?5",
            vec![
                libsql::Value::Text(reason.to_string()),
                libsql::Value::Integer(now.timestamp_millis()),
                libsql::Value::Text(now.to_rfc3339()),
                libsql::Value::Text(id.to_string()),
                libsql::Value::Text(lease_id.to_string()),
            ],
            "dead_letter",
        )
        .await?;
        info!(task_id = %id, reason = %reason, "Task dead-lettered");
        Ok(())
    }

    async fn requeue(
        &self,
        id: TaskId,
        lease_id: Uuid,
        at: DateTime<Utc>,
        reason: RequeueReason,
    ) -> Result<(), QueueError> {
        self.leased_update(
            id,
            "UPDATE task_queue SET status = ?1, scheduled_for = ?2, lease_id = NULL, \
             lease_expires_at = NULL, updated_at = ?3 \
             WHERE id = ?4 AND status = 'running' AND lease_id = ?5",
            vec![
                libsql::Value::Text(reason.status().as_str().to_string()),
                libsql::Value::Integer(at.timestamp_millis()),
                libsql::Value::Text(Utc::now().to_rfc3339()),
                libsql::Value::Text(id.to_string()),
                libsql::Value::Text(lease_id.to_string()),
            ],
            "requeue",
        )
        .await
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let _guard = self.claim_lock.lock().await;
        self.reclaim_locked(Utc::now()).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?
        {
            Some(row) => Ok(Some(row_to_envelope(&row)?)),
            None => Ok(None),
        }
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_queue WHERE status = 'dead' \
                     ORDER BY updated_at DESC, seq DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letters: {e}")))?;

        let mut dead = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_envelope(&row) {
                Ok(env) => dead.push(env),
                Err(e) => warn!("Skipping dead-letter row: {e}"),
            }
        }
        Ok(dead)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM task_queue \
                 WHERE status IN ('succeeded', 'dead') AND finished_at <= ?1",
                params![before.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_finished: {e}")))?;
        if count > 0 {
            debug!(count, "Finished envelopes purged");
        }
        Ok(count as usize)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM task_queue GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let mut stats = QueueStats::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            let count: i64 = row.get(1).unwrap_or(0);
            match status.parse::<TaskStatus>() {
                Ok(s) => {
                    stats.by_status.insert(s, count.max(0) as u64);
                }
                Err(e) => warn!("Skipping stats row: {e}"),
            }
        }
        Ok(stats)
    }
}

// ── ResultStore ─────────────────────────────────────────────────────

#[async_trait]
impl ResultStore for LibSqlBackend {
    async fn record(&self, result: TaskResult) -> Result<(), ResultError> {
        let result_json = result
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO task_results \
                 (id, task_type, status, attempt, result, error, finished_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(id) DO UPDATE SET task_type = excluded.task_type, \
                 status = excluded.status, \
                 attempt = excluded.attempt, result = excluded.result, error = excluded.error, \
                 finished_at = excluded.finished_at",
                params![
                    result.id.to_string(),
                    result.task_type.clone(),
                    result.status.as_str(),
                    result.attempt as i64,
                    opt_text(result_json.as_deref()),
                    opt_text(result.error.as_deref()),
                    result.finished_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_result: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<TaskResult, ResultError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RESULT_COLUMNS} FROM task_results WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_result: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_result: {e}")))?
            .ok_or(ResultError::NotFound(id))?;
        let result = row_to_result(&row)?;
        if result.is_expired(self.retention, Utc::now()) {
            return Err(ResultError::NotFound(id));
        }
        Ok(result)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ResultError> {
        let Some(cutoff) = checked_before(now, self.retention) else {
            return Ok(0);
        };
        let count = self
            .conn()
            .execute(
                "DELETE FROM task_results WHERE finished_at <= ?1",
                params![cutoff.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_results: {e}")))?;
        Ok(count as usize)
    }
}
