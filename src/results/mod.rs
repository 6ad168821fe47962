//! Task result store: last known outcome per task id, for status polling.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HandlerError, ResultError};
use crate::queue::BrokerQueue;
use crate::tasks::{
    TaskContext, TaskHandler, TaskId, TaskStatus, checked_after, checked_before,
};

pub use memory::MemoryResultStore;

/// Default time a terminal result stays queryable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Outcome recorded for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    /// Executions so far when this outcome was recorded.
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn succeeded(
        id: TaskId,
        task_type: impl Into<String>,
        attempt: u32,
        result: serde_json::Value,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            status: TaskStatus::Succeeded,
            attempt,
            result: Some(result),
            error: None,
            finished_at: Utc::now(),
        }
    }

    /// A failed outcome; `status` is `failed_retrying` or `dead`.
    pub fn failed(
        id: TaskId,
        task_type: impl Into<String>,
        status: TaskStatus,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            status,
            attempt,
            result: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }

    /// Whether the result has outlived `retention` at `now`.
    /// A retention too long to represent never expires.
    pub fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        checked_after(self.finished_at, retention).is_some_and(|until| until <= now)
    }
}

/// Backend-agnostic store of task outcomes.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record (or overwrite) the outcome for `result.id`.
    async fn record(&self, result: TaskResult) -> Result<(), ResultError>;

    /// Last known outcome, or `NotFound` if unknown or past retention.
    async fn get(&self, id: TaskId) -> Result<TaskResult, ResultError>;

    /// Delete results past retention. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ResultError>;
}

/// Task type of the built-in retention sweep.
pub const PURGE_TASK_TYPE: &str = "task_results.purge";

/// Handler that deletes results past retention, together with the succeeded
/// and dead envelopes the queue still holds for the same window.
pub struct PurgeExpiredResults {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn BrokerQueue>,
    retention: Duration,
}

impl PurgeExpiredResults {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn BrokerQueue>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            retention,
        }
    }
}

#[async_trait]
impl TaskHandler for PurgeExpiredResults {
    async fn run(
        &self,
        _ctx: TaskContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let now = Utc::now();
        let purged = self
            .store
            .purge_expired(now)
            .await
            .map_err(|e| HandlerError::retriable(e.to_string()))?;

        let envelopes = match checked_before(now, self.retention) {
            Some(cutoff) => self
                .queue
                .purge_finished(cutoff)
                .await
                .map_err(|e| HandlerError::retriable(e.to_string()))?,
            None => 0,
        };

        tracing::info!(purged, envelopes, "Expired task results purged");
        Ok(serde_json::json!({ "purged": purged, "envelopes": envelopes }))
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::queue::MemoryQueue;
    use crate::tasks::{TaskEnvelope, TaskOrigin};

    #[tokio::test]
    async fn purge_handler_reports_count() {
        let store = MemoryResultStore::with_retention(Duration::from_secs(60));
        let mut old = TaskResult::succeeded(Uuid::new_v4(), "x", 1, serde_json::Value::Null);
        old.finished_at = Utc::now() - chrono::Duration::hours(2);
        store.record(old).await.unwrap();

        // One dead letter finished now, inside the retention window.
        let queue = MemoryQueue::new();
        let id = queue
            .enqueue(TaskEnvelope::new("x", serde_json::Value::Null, 1))
            .await
            .unwrap();
        let claimed = queue.dequeue_ready(1).await.unwrap().remove(0);
        queue.dead_letter(id, claimed.lease_id, "boom").await.unwrap();

        let handler =
            PurgeExpiredResults::new(store.clone(), queue.clone(), Duration::from_secs(60));
        let ctx = TaskContext {
            task_id: Uuid::new_v4(),
            task_type: PURGE_TASK_TYPE.to_string(),
            attempt: 0,
            max_attempts: 1,
            origin: TaskOrigin::Cron,
            cancellation: CancellationToken::new(),
        };
        let out = handler.run(ctx.clone(), serde_json::Value::Null).await.unwrap();
        assert_eq!(out, serde_json::json!({"purged": 1, "envelopes": 0}));
        assert!(queue.get(id).await.unwrap().is_some());

        // With no retention left the dead letter goes too.
        let handler = PurgeExpiredResults::new(store.clone(), queue.clone(), Duration::ZERO);
        let out = handler.run(ctx, serde_json::Value::Null).await.unwrap();
        assert_eq!(out, serde_json::json!({"purged": 0, "envelopes": 1}));
        assert!(queue.get(id).await.unwrap().is_none());
    }

    #[test]
    fn expiry_boundary() {
        let mut r = TaskResult::failed(Uuid::new_v4(), "x", TaskStatus::Dead, 3, "boom");
        let now = Utc::now();
        r.finished_at = now - chrono::Duration::seconds(60);
        assert!(r.is_expired(Duration::from_secs(60), now));
        assert!(!r.is_expired(Duration::from_secs(61), now));
        assert!(!r.is_expired(Duration::from_secs(10_000_000_000_000), now));
        assert!(!r.is_expired(Duration::MAX, now));
    }
}
