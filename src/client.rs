//! Enqueue API used by the rest of the assistant.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{QueueError, Result, ResultError};
use crate::queue::BrokerQueue;
use crate::results::{ResultStore, TaskResult};
use crate::tasks::{
    TaskEnvelope, TaskId, TaskOrigin, TaskRegistry, TaskStatus, checked_after,
};

/// What a poller sees for a task id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusReport {
    pub id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Next eligible time while the task is still queued.
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Submits ad-hoc tasks and reports their status.
#[derive(Clone)]
pub struct TaskClient {
    registry: Arc<TaskRegistry>,
    queue: Arc<dyn BrokerQueue>,
    results: Arc<dyn ResultStore>,
}

impl TaskClient {
    pub fn new(
        registry: Arc<TaskRegistry>,
        queue: Arc<dyn BrokerQueue>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            registry,
            queue,
            results,
        }
    }

    /// Enqueue `task_type`, runnable now or after `delay`.
    ///
    /// A delay that does not fit in a timestamp is rejected with
    /// [`QueueError::TimeOutOfRange`].
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<TaskId> {
        let now = Utc::now();
        let when = match delay {
            Some(d) => checked_after(now, d)
                .ok_or_else(|| QueueError::TimeOutOfRange(format!("delay of {d:?}")))?,
            None => now,
        };
        self.enqueue_at(task_type, payload, when).await
    }

    /// Enqueue `task_type`, runnable from `when`.
    pub async fn enqueue_at(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        when: DateTime<Utc>,
    ) -> Result<TaskId> {
        let task = self.registry.resolve(task_type)?;
        let envelope = TaskEnvelope::new(task_type, payload, task.defaults.retry.max_attempts)
            .with_origin(TaskOrigin::AdHoc)
            .scheduled_at(when);
        let id = self.queue.enqueue(envelope).await?;
        tracing::debug!(
            task_id = %id,
            task_type = %task_type,
            scheduled_for = %when,
            "Ad-hoc task enqueued"
        );
        Ok(id)
    }

    /// Current status of `id`.
    ///
    /// Terminal outcomes come from the result store, falling back to the
    /// settled envelope while the queue still holds it; anything else in the
    /// queue is reported from its envelope. Unknown or expired ids are
    /// `NotFound`.
    pub async fn get_status(&self, id: TaskId) -> Result<TaskStatusReport> {
        let recorded = self.recorded(id).await?;
        if let Some(r) = recorded.as_ref().filter(|r| r.status.is_terminal()) {
            return Ok(report_from_result(r.clone()));
        }

        if let Some(env) = self.queue.get(id).await? {
            let terminal = env.status.is_terminal();
            return Ok(TaskStatusReport {
                id,
                task_type: env.task_type,
                status: env.status,
                attempt: env.attempt,
                result: env.result,
                error: env.last_error,
                scheduled_for: (!terminal).then_some(env.scheduled_for),
            });
        }

        match recorded {
            Some(r) => Ok(report_from_result(r)),
            None => Err(ResultError::NotFound(id).into()),
        }
    }

    async fn recorded(&self, id: TaskId) -> Result<Option<TaskResult>> {
        match self.results.get(id).await {
            Ok(r) => Ok(Some(r)),
            Err(ResultError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn report_from_result(r: TaskResult) -> TaskStatusReport {
    TaskStatusReport {
        id: r.id,
        task_type: r.task_type,
        status: r.status,
        attempt: r.attempt,
        result: r.result,
        error: r.error,
        scheduled_for: None,
    }
}
