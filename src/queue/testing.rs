//! Queue wrapper that injects broker outages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{BrokerQueue, ClaimedTask, MemoryQueue, QueueStats, RequeueReason};
use crate::error::QueueError;
use crate::tasks::{TaskEnvelope, TaskId};

pub(crate) struct FlakyQueue {
    pub inner: Arc<MemoryQueue>,
    failing_enqueues: AtomicUsize,
    failing_dequeues: AtomicUsize,
    rejected_type: Option<String>,
    pub dequeue_calls: AtomicUsize,
}

impl FlakyQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Enqueues of `task_type` always fail.
    pub fn rejecting(task_type: &str) -> Arc<Self> {
        Arc::new(Self::build(Some(task_type.to_string())))
    }

    fn build(rejected_type: Option<String>) -> Self {
        Self {
            inner: MemoryQueue::new(),
            failing_enqueues: AtomicUsize::new(0),
            failing_dequeues: AtomicUsize::new(0),
            rejected_type,
            dequeue_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_enqueues(&self, n: usize) {
        self.failing_enqueues.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_dequeues(&self, n: usize) {
        self.failing_dequeues.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerQueue for FlakyQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskId, QueueError> {
        if self.rejected_type.as_deref() == Some(envelope.task_type.as_str())
            || Self::take_failure(&self.failing_enqueues)
        {
            return Err(QueueError::Unavailable("broker offline".to_string()));
        }
        self.inner.enqueue(envelope).await
    }

    async fn dequeue_ready(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        self.dequeue_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_dequeues) {
            return Err(QueueError::Unavailable("broker offline".to_string()));
        }
        self.inner.dequeue_ready(limit).await
    }

    async fn ack(
        &self,
        id: TaskId,
        lease_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.inner.ack(id, lease_id, result).await
    }

    async fn retry(
        &self,
        id: TaskId,
        lease_id: Uuid,
        next_time: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        self.inner.retry(id, lease_id, next_time, error).await
    }

    async fn dead_letter(
        &self,
        id: TaskId,
        lease_id: Uuid,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.inner.dead_letter(id, lease_id, reason).await
    }

    async fn requeue(
        &self,
        id: TaskId,
        lease_id: Uuid,
        at: DateTime<Utc>,
        reason: RequeueReason,
    ) -> Result<(), QueueError> {
        self.inner.requeue(id, lease_id, at, reason).await
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        self.inner.reclaim_expired().await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskEnvelope>, QueueError> {
        self.inner.get(id).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError> {
        self.inner.dead_letters(limit).await
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        self.inner.purge_finished(before).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats().await
    }
}
