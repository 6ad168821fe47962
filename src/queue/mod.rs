//! Broker queue: durable store of task envelopes with lease-based claims.
//!
//! Two backends implement [`BrokerQueue`]:
//! - [`MemoryQueue`]: process-local, for tests and single-process setups
//! - `LibSqlBackend` (in `crate::store`): durable libSQL table

pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueError;
use crate::tasks::{TaskEnvelope, TaskId, TaskStatus};

pub use memory::MemoryQueue;

/// Default lease length for claimed envelopes.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// An envelope claimed by a worker slot together with its lease.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub envelope: TaskEnvelope,
    pub lease_id: Uuid,
}

impl ClaimedTask {
    pub fn id(&self) -> TaskId {
        self.envelope.id
    }
}

/// Why a claimed envelope is handed back without charging an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// Could not run yet (per-type concurrency saturated). Back to `pending`.
    Deferred,
    /// Execution was cancelled by shutdown. Back to `failed_retrying`.
    Interrupted,
}

impl RequeueReason {
    pub fn status(&self) -> TaskStatus {
        match self {
            RequeueReason::Deferred => TaskStatus::Pending,
            RequeueReason::Interrupted => TaskStatus::FailedRetrying,
        }
    }
}

/// Envelope counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub by_status: HashMap<TaskStatus, u64>,
}

impl QueueStats {
    pub fn count(&self, status: TaskStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn active(&self) -> u64 {
        self.count(TaskStatus::Pending)
            + self.count(TaskStatus::Running)
            + self.count(TaskStatus::FailedRetrying)
    }
}

/// Backend-agnostic queue of task envelopes.
///
/// All state changes on an envelope go through this trait. Operations on a
/// claimed envelope take the lease handed out by [`BrokerQueue::dequeue_ready`]
/// and fail with [`QueueError::LeaseExpired`] once the claim was reclaimed.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Insert a `pending` envelope. Returns its id.
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskId, QueueError>;

    /// Atomically claim up to `limit` ready envelopes, earliest
    /// `scheduled_for` first, ties in enqueue order. Expired leases are
    /// reclaimed before claiming.
    async fn dequeue_ready(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError>;

    /// Mark a claimed envelope `succeeded` with the handler's `result` and
    /// drop it from the active set. The envelope stays readable through
    /// [`BrokerQueue::get`] until purged.
    async fn ack(
        &self,
        id: TaskId,
        lease_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// Charge a failed attempt and make the envelope eligible again at `next_time`.
    async fn retry(
        &self,
        id: TaskId,
        lease_id: Uuid,
        next_time: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Mark a claimed envelope `dead`, retaining it for inspection.
    async fn dead_letter(&self, id: TaskId, lease_id: Uuid, reason: &str)
    -> Result<(), QueueError>;

    /// Hand a claimed envelope back without charging an attempt.
    async fn requeue(
        &self,
        id: TaskId,
        lease_id: Uuid,
        at: DateTime<Utc>,
        reason: RequeueReason,
    ) -> Result<(), QueueError>;

    /// Return `running` envelopes whose lease has expired to `pending`.
    async fn reclaim_expired(&self) -> Result<usize, QueueError>;

    /// Current state of an envelope still held by the queue.
    async fn get(&self, id: TaskId) -> Result<Option<TaskEnvelope>, QueueError>;

    /// Dead-lettered envelopes, most recent first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError>;

    /// Delete `succeeded` and `dead` envelopes that finished at or before
    /// `before`. Returns the number removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Envelope counts by status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
