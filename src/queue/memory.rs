//! In-memory broker queue.
//!
//! All envelopes live behind one `tokio::sync::Mutex`, which makes every claim
//! and transition a single critical section. Ready envelopes are indexed in a
//! `BTreeSet` keyed by `(scheduled_for, seq)` so claiming walks them in order;
//! leased envelopes are tracked separately so reclaim only looks at those.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BrokerQueue, ClaimedTask, DEFAULT_VISIBILITY_TIMEOUT, QueueStats, RequeueReason};
use crate::error::QueueError;
use crate::tasks::{Lease, TaskEnvelope, TaskId, TaskStatus, checked_after};

type ReadyKey = (DateTime<Utc>, u64, TaskId);

#[derive(Default)]
struct State {
    envelopes: HashMap<TaskId, TaskEnvelope>,
    ready: BTreeSet<ReadyKey>,
    running: HashSet<TaskId>,
    next_seq: u64,
}

impl State {
    fn mark_ready(&mut self, env: &TaskEnvelope) {
        self.running.remove(&env.id);
        self.ready.insert((env.scheduled_for, env.seq, env.id));
    }

    /// Look up an envelope the caller claims to hold a lease on.
    fn claimed_mut(
        &mut self,
        id: TaskId,
        lease_id: Uuid,
    ) -> Result<&mut TaskEnvelope, QueueError> {
        let env = self
            .envelopes
            .get_mut(&id)
            .ok_or(QueueError::NotFound(id))?;
        if !env.holds_lease(lease_id) {
            return Err(QueueError::LeaseExpired { id });
        }
        Ok(env)
    }

    /// Settle a claimed envelope into a terminal state.
    fn finish(
        &mut self,
        id: TaskId,
        lease_id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<&TaskEnvelope, QueueError> {
        let env = self.claimed_mut(id, lease_id)?;
        env.status = status;
        env.attempt = (env.attempt + 1).min(env.max_attempts);
        if let Some(error) = error {
            env.last_error = Some(error.to_string());
        }
        env.lease = None;
        env.updated_at = Utc::now();
        self.running.remove(&id);
        Ok(&self.envelopes[&id])
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<TaskId> = self
            .running
            .iter()
            .filter(|id| self.envelopes.get(*id).is_some_and(|e| e.lease_expired(now)))
            .copied()
            .collect();

        for id in &expired {
            self.running.remove(id);
            if let Some(env) = self.envelopes.get_mut(id) {
                env.status = TaskStatus::Pending;
                env.lease = None;
                env.updated_at = now;
                let key = (env.scheduled_for, env.seq, env.id);
                self.ready.insert(key);
                warn!(
                    task_id = %id,
                    task_type = %env.task_type,
                    "Lease expired, task returned to pending"
                );
            }
        }
        expired.len()
    }
}

/// Process-local [`BrokerQueue`].
pub struct MemoryQueue {
    state: Mutex<State>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    /// Create a new queue with the default visibility timeout.
    pub fn new() -> Arc<Self> {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
        })
    }

    fn lease_until(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, QueueError> {
        let timeout = self.visibility_timeout;
        checked_after(now, timeout)
            .ok_or_else(|| QueueError::TimeOutOfRange(format!("visibility timeout {timeout:?}")))
    }
}

#[async_trait]
impl BrokerQueue for MemoryQueue {
    async fn enqueue(&self, mut envelope: TaskEnvelope) -> Result<TaskId, QueueError> {
        let mut state = self.state.lock().await;
        if state.envelopes.contains_key(&envelope.id) {
            return Err(QueueError::Serialization(format!(
                "duplicate task id {}",
                envelope.id
            )));
        }

        state.next_seq += 1;
        envelope.seq = state.next_seq;
        envelope.status = TaskStatus::Pending;
        envelope.lease = None;
        envelope.updated_at = Utc::now();

        let id = envelope.id;
        debug!(
            task_id = %id,
            task_type = %envelope.task_type,
            scheduled_for = %envelope.scheduled_for,
            "Enqueued task"
        );
        state.mark_ready(&envelope);
        state.envelopes.insert(id, envelope);
        Ok(id)
    }

    async fn dequeue_ready(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        let now = Utc::now();
        let expires_at = self.lease_until(now)?;
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let due: Vec<ReadyKey> = state
            .ready
            .iter()
            .take_while(|(at, _, _)| *at <= now)
            .take(limit)
            .copied()
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for key in due {
            state.ready.remove(&key);
            let Some(env) = state.envelopes.get_mut(&key.2) else {
                continue;
            };
            if !env.status.is_claimable() {
                continue;
            }
            let lease_id = Uuid::new_v4();
            env.status = TaskStatus::Running;
            env.lease = Some(Lease {
                lease_id,
                expires_at,
            });
            env.updated_at = now;
            claimed.push(ClaimedTask {
                envelope: env.clone(),
                lease_id,
            });
            state.running.insert(key.2);
        }
        Ok(claimed)
    }

    async fn ack(
        &self,
        id: TaskId,
        lease_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.claimed_mut(id, lease_id)?.result = Some(result);
        state.finish(id, lease_id, TaskStatus::Succeeded, None)?;
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
        let mut state = self.state.lock().await;
        let env = state.claimed_mut(id, lease_id)?;
        env.status = TaskStatus::FailedRetrying;
        env.attempt = (env.attempt + 1).min(env.max_attempts);
        env.scheduled_for = next_time;
        env.last_error = Some(error.to_string());
        env.lease = None;
        env.updated_at = Utc::now();
        let env = env.clone();
        state.mark_ready(&env);
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: TaskId,
        lease_id: Uuid,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let env = state.finish(id, lease_id, TaskStatus::Dead, Some(reason))?;
        info!(task_id = %id, task_type = %env.task_type, reason = %reason, "Task dead-lettered");
        Ok(())
    }

    async fn requeue(
        &self,
        id: TaskId,
        lease_id: Uuid,
        at: DateTime<Utc>,
        reason: RequeueReason,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let env = state.claimed_mut(id, lease_id)?;
        env.status = reason.status();
        env.scheduled_for = at;
        env.lease = None;
        env.updated_at = Utc::now();
        let env = env.clone();
        state.mark_ready(&env);
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.reclaim_expired(Utc::now()))
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskEnvelope>, QueueError> {
        Ok(self.state.lock().await.envelopes.get(&id).cloned())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError> {
        let state = self.state.lock().await;
        let mut dead: Vec<TaskEnvelope> = state
            .envelopes
            .values()
            .filter(|e| e.status == TaskStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let count = state.envelopes.len();
        state
            .envelopes
            .retain(|_, e| !(e.status.is_terminal() && e.updated_at <= before));
        Ok(count - state.envelopes.len())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for env in state.envelopes.values() {
            *stats.by_status.entry(env.status).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn envelope(task_type: &str) -> TaskEnvelope {
        TaskEnvelope::new(task_type, serde_json::json!({}), 3)
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("send_email")).await.unwrap();

        let claimed = q.dequeue_ready(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), id);
        assert_eq!(claimed[0].envelope.status, TaskStatus::Running);

        // Already claimed
        assert!(q.dequeue_ready(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_envelopes_not_claimed() {
        let q = MemoryQueue::new();
        let later = Utc::now() + chrono::Duration::hours(1);
        q.enqueue(envelope("reminder").scheduled_at(later))
            .await
            .unwrap();
        assert!(q.dequeue_ready(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn earliest_due_first_then_fifo() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        let early = now - chrono::Duration::seconds(10);
        let a = q.enqueue(envelope("a").scheduled_at(now)).await.unwrap();
        let b = q.enqueue(envelope("b").scheduled_at(early)).await.unwrap();
        let c = q.enqueue(envelope("c").scheduled_at(now)).await.unwrap();

        let ids: Vec<TaskId> = q
            .dequeue_ready(10)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(ids, vec![b, a, c]);
    }

    #[tokio::test]
    async fn claim_respects_limit() {
        let q = MemoryQueue::new();
        for _ in 0..5 {
            q.enqueue(envelope("cleanup")).await.unwrap();
        }
        assert_eq!(q.dequeue_ready(2).await.unwrap().len(), 2);
        assert_eq!(q.dequeue_ready(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ack_removes_from_active_set() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("x")).await.unwrap();
        let claimed = q.dequeue_ready(1).await.unwrap().remove(0);
        q.ack(id, claimed.lease_id, serde_json::json!({"sent": true}))
            .await
            .unwrap();

        let env = q.get(id).await.unwrap().unwrap();
        assert_eq!(env.status, TaskStatus::Succeeded);
        assert_eq!(env.result, Some(serde_json::json!({"sent": true})));
        assert_eq!(env.attempt, 1);
        assert!(env.lease.is_none());
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.count(TaskStatus::Succeeded), 1);

        // A second ack with the same lease does not land.
        let err = q
            .ack(id, claimed.lease_id, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseExpired { .. }));
    }

    #[tokio::test]
    async fn purge_removes_only_old_finished_envelopes() {
        let q = MemoryQueue::new();
        for _ in 0..50 {
            let id = q.enqueue(envelope("x")).await.unwrap();
            let c = q.dequeue_ready(1).await.unwrap().remove(0);
            q.dead_letter(id, c.lease_id, "boom").await.unwrap();
        }
        let done = q.enqueue(envelope("x")).await.unwrap();
        let c = q.dequeue_ready(1).await.unwrap().remove(0);
        q.ack(done, c.lease_id, serde_json::Value::Null)
            .await
            .unwrap();
        let waiting = q.enqueue(envelope("x")).await.unwrap();

        assert_eq!(
            q.purge_finished(Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(q.purge_finished(Utc::now()).await.unwrap(), 51);

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.count(TaskStatus::Dead), 0);
        assert_eq!(stats.count(TaskStatus::Succeeded), 0);
        assert!(q.get(done).await.unwrap().is_none());
        assert!(q.get(waiting).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn oversized_visibility_timeout_is_an_error() {
        let q = MemoryQueue::with_visibility_timeout(Duration::from_secs(10_000_000_000_000));
        q.enqueue(envelope("x")).await.unwrap();
        let err = q.dequeue_ready(1).await.unwrap_err();
        assert!(matches!(err, QueueError::TimeOutOfRange(_)));
        // Nothing was claimed.
        assert_eq!(q.stats().await.unwrap().count(TaskStatus::Pending), 1);
    }

    #[tokio::test]
    async fn retry_increments_attempt_and_delays() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("x")).await.unwrap();
        let claimed = q.dequeue_ready(1).await.unwrap().remove(0);
        let later = Utc::now() + chrono::Duration::hours(1);
        q.retry(id, claimed.lease_id, later, "smtp 451")
            .await
            .unwrap();

        let env = q.get(id).await.unwrap().unwrap();
        assert_eq!(env.status, TaskStatus::FailedRetrying);
        assert_eq!(env.attempt, 1);
        assert_eq!(env.scheduled_for, later);
        assert_eq!(env.last_error.as_deref(), Some("smtp 451"));
        assert!(q.dequeue_ready(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_retrying_is_claimable_when_due() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("x")).await.unwrap();
        let claimed = q.dequeue_ready(1).await.unwrap().remove(0);
        q.retry(id, claimed.lease_id, Utc::now(), "flaky")
            .await
            .unwrap();
        let again = q.dequeue_ready(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].envelope.attempt, 1);
    }

    #[tokio::test]
    async fn dead_letter_retained() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("x")).await.unwrap();
        let claimed = q.dequeue_ready(1).await.unwrap().remove(0);
        q.dead_letter(id, claimed.lease_id, "malformed payload")
            .await
            .unwrap();

        let env = q.get(id).await.unwrap().unwrap();
        assert_eq!(env.status, TaskStatus::Dead);
        let dead = q.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("malformed payload"));
        assert!(q.dequeue_ready(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_lease_rejected() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("x")).await.unwrap();
        q.dequeue_ready(1).await.unwrap();
        let err = q
            .ack(id, Uuid::new_v4(), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseExpired { .. }));
        let err = q
            .ack(Uuid::new_v4(), Uuid::new_v4(), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_lease_reclaimed_exactly_once() {
        let q = MemoryQueue::with_visibility_timeout(Duration::from_millis(20));
        let id = q.enqueue(envelope("x")).await.unwrap();
        let first = q.dequeue_ready(1).await.unwrap().remove(0);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = q.dequeue_ready(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), id);
        assert_ne!(second[0].lease_id, first.lease_id);
        assert!(q.dequeue_ready(1).await.unwrap().is_empty());

        // The crashed slot's late ack must not land.
        let err = q
            .ack(id, first.lease_id, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseExpired { .. }));
        q.ack(id, second[0].lease_id, serde_json::Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn requeue_does_not_charge_attempt() {
        let q = MemoryQueue::new();
        let id = q.enqueue(envelope("x")).await.unwrap();
        let c = q.dequeue_ready(1).await.unwrap().remove(0);
        q.requeue(id, c.lease_id, Utc::now(), RequeueReason::Interrupted)
            .await
            .unwrap();
        let env = q.get(id).await.unwrap().unwrap();
        assert_eq!(env.status, TaskStatus::FailedRetrying);
        assert_eq!(env.attempt, 0);

        let c = q.dequeue_ready(1).await.unwrap().remove(0);
        q.requeue(id, c.lease_id, Utc::now(), RequeueReason::Deferred)
            .await
            .unwrap();
        assert_eq!(
            q.get(id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let q = MemoryQueue::new();
        for i in 0..500 {
            q.enqueue(TaskEnvelope::new("stress", serde_json::json!(i), 1))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = q.dequeue_ready(3).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|c| c.id()));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(total, 500);
    }
}
