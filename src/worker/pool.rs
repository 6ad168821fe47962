//! Worker pool: fixed set of slots that claim, execute and settle envelopes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::slot::{SlotBoard, SlotState};
use super::WorkerPoolConfig;
use crate::error::{ExecutionError, HandlerError, QueueError};
use crate::queue::{BrokerQueue, ClaimedTask, RequeueReason};
use crate::results::{ResultStore, TaskResult};
use crate::tasks::{
    Disposition, RegisteredTask, RetryPolicy, TaskContext, TaskEnvelope, TaskRegistry, TaskStatus,
    checked_after, classify,
};

/// How a shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Slots still executing when the grace period ran out.
    pub forced: bool,
    /// Envelopes handed back to the queue because their execution was cancelled.
    pub interrupted: usize,
}

/// Result of one handler run, before classification.
enum Outcome {
    Finished(Result<serde_json::Value, HandlerError>),
    Failed(ExecutionError),
    Killed,
}

struct Shared {
    config: WorkerPoolConfig,
    registry: Arc<TaskRegistry>,
    queue: Arc<dyn BrokerQueue>,
    results: Arc<dyn ResultStore>,
    limits: HashMap<String, Arc<Semaphore>>,
    board: SlotBoard,
    /// Stop claiming new work.
    stop: CancellationToken,
    /// Abort in-flight handlers.
    kill: CancellationToken,
    interrupted: AtomicUsize,
}

/// Fixed-size pool of worker slots.
pub struct WorkerPool {
    shared: Arc<Shared>,
    slots: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `config.pool_size` slots.
    pub fn start(
        config: WorkerPoolConfig,
        registry: Arc<TaskRegistry>,
        queue: Arc<dyn BrokerQueue>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        let size = config.pool_size.max(1);
        let limits = registry
            .concurrency_limits()
            .map(|(name, n)| (name.to_string(), Arc::new(Semaphore::new(n))))
            .collect();

        let shared = Arc::new(Shared {
            config,
            registry,
            queue,
            results,
            limits,
            board: SlotBoard::new(size),
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            interrupted: AtomicUsize::new(0),
        });

        let mut slots = JoinSet::new();
        for slot in 0..size {
            let shared = Arc::clone(&shared);
            slots.spawn(async move { shared.run_slot(slot).await });
        }
        info!(pool_size = size, "Worker pool started");

        Self { shared, slots }
    }

    pub fn size(&self) -> usize {
        self.shared.board.snapshot().len()
    }

    /// Current state of each slot.
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.shared.board.snapshot()
    }

    /// Stop claiming, wait up to `grace` for in-flight work, then cancel the
    /// rest. Cancelled envelopes go back to the queue as `failed_retrying`.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        self.shared.stop.cancel();
        info!(grace_secs = grace.as_secs_f64(), "Worker pool draining");

        let slots = &mut self.slots;
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = slots.join_next().await {
                log_slot_exit(res);
            }
        })
        .await
        .is_ok();

        if !drained {
            let busy = self
                .shared
                .board
                .snapshot()
                .iter()
                .filter(|s| s.is_busy())
                .count();
            warn!(busy, "Grace period elapsed, cancelling in-flight tasks");
            self.shared.kill.cancel();
            while let Some(res) = self.slots.join_next().await {
                log_slot_exit(res);
            }
        }

        let report = ShutdownReport {
            forced: !drained,
            interrupted: self.shared.interrupted.load(Ordering::SeqCst),
        };
        info!(forced = report.forced, interrupted = report.interrupted, "Worker pool stopped");
        report
    }
}

fn log_slot_exit(res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!("Worker slot exited abnormally: {e}");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Shared {
    async fn run_slot(self: Arc<Self>, slot: usize) {
        let mut unavailable_backoff = self.config.idle_backoff;

        while !self.stop.is_cancelled() {
            match self.queue.dequeue_ready(1).await {
                Ok(mut batch) => {
                    unavailable_backoff = self.config.idle_backoff;
                    match batch.pop() {
                        Some(claimed) => self.process(slot, claimed).await,
                        None => {
                            if !self.pause(self.config.idle_backoff).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        slot,
                        backoff_ms = unavailable_backoff.as_millis() as u64,
                        "Dequeue failed: {e}"
                    );
                    if !self.pause(unavailable_backoff).await {
                        break;
                    }
                    unavailable_backoff =
                        (unavailable_backoff * 2).min(self.config.max_unavailable_backoff);
                }
            }
        }

        self.board.set(slot, SlotState::Stopped);
        debug!(slot, "Worker slot stopped");
    }

    /// Sleep unless stopped first. Returns false when the slot should exit.
    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    async fn process(&self, slot: usize, claimed: ClaimedTask) {
        self.board.set(slot, SlotState::Claimed);
        let ClaimedTask { envelope, lease_id } = claimed;

        let task = match self.registry.resolve(&envelope.task_type) {
            Ok(task) => task.clone(),
            Err(e) => {
                warn!(task_id = %envelope.id, "{e}");
                let err = ExecutionError::UnknownTaskType(envelope.task_type.clone());
                self.settle_failure(&envelope, lease_id, &RetryPolicy::default(), err)
                    .await;
                self.board.set(slot, SlotState::Idle);
                return;
            }
        };

        let Some(_permit) = self.acquire_permit(&envelope, lease_id).await else {
            self.board.set(slot, SlotState::Idle);
            return;
        };

        self.board.set(slot, SlotState::Executing);
        debug!(
            slot,
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            attempt = envelope.attempt,
            "Executing task"
        );

        match self.execute(&task, &envelope).await {
            Outcome::Finished(Ok(value)) => self.settle_success(&envelope, lease_id, value).await,
            Outcome::Finished(Err(e)) => {
                self.settle_failure(&envelope, lease_id, &task.defaults.retry, e.into())
                    .await
            }
            Outcome::Failed(e) => {
                self.settle_failure(&envelope, lease_id, &task.defaults.retry, e)
                    .await
            }
            Outcome::Killed => self.settle_interrupted(&envelope, lease_id).await,
        }

        self.board.set(slot, SlotState::Idle);
    }

    /// Take a per-type concurrency permit, or defer the envelope.
    ///
    /// `Some(None)` means the type is unlimited.
    async fn acquire_permit(
        &self,
        envelope: &TaskEnvelope,
        lease_id: Uuid,
    ) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(sem) = self.limits.get(&envelope.task_type) else {
            return Some(None);
        };
        match Arc::clone(sem).try_acquire_owned() {
            Ok(permit) => Some(Some(permit)),
            Err(_) => {
                let now = Utc::now();
                let at = checked_after(now, self.config.idle_backoff).unwrap_or(now);
                debug!(
                    task_id = %envelope.id,
                    task_type = %envelope.task_type,
                    "Type at concurrency limit, deferring"
                );
                if let Err(e) = self
                    .queue
                    .requeue(envelope.id, lease_id, at, RequeueReason::Deferred)
                    .await
                {
                    self.log_transition_error(envelope, "requeue", e);
                }
                None
            }
        }
    }

    /// Run the handler under its timeout, on its own task so panics are caught.
    async fn execute(&self, task: &RegisteredTask, envelope: &TaskEnvelope) -> Outcome {
        let cancellation = self.kill.child_token();
        let ctx = TaskContext {
            task_id: envelope.id,
            task_type: envelope.task_type.clone(),
            attempt: envelope.attempt,
            max_attempts: envelope.max_attempts,
            origin: envelope.created_by,
            cancellation: cancellation.clone(),
        };
        let handler = Arc::clone(&task.handler);
        let payload = envelope.payload.clone();
        let timeout = task.defaults.retry.timeout;

        let mut run = tokio::spawn(async move { handler.run(ctx, payload).await });

        let outcome = tokio::select! {
            biased;
            joined = &mut run => match joined {
                Ok(res) => return Outcome::Finished(res),
                Err(e) if e.is_panic() => {
                    return Outcome::Failed(ExecutionError::Panicked(panic_message(e.into_panic())));
                }
                Err(_) => Outcome::Killed,
            },
            _ = self.kill.cancelled() => Outcome::Killed,
            _ = tokio::time::sleep(timeout) => Outcome::Failed(ExecutionError::Timeout(timeout)),
        };

        cancellation.cancel();
        run.abort();
        outcome
    }

    fn attempts_after(envelope: &TaskEnvelope) -> u32 {
        (envelope.attempt + 1).min(envelope.max_attempts)
    }

    /// The ack stores the result on the envelope, so the outcome stays
    /// visible even when recording it to the result store fails.
    async fn settle_success(
        &self,
        envelope: &TaskEnvelope,
        lease_id: Uuid,
        value: serde_json::Value,
    ) {
        if let Err(e) = self.queue.ack(envelope.id, lease_id, value.clone()).await {
            self.log_transition_error(envelope, "ack", e);
            return;
        }
        info!(task_id = %envelope.id, task_type = %envelope.task_type, "Task succeeded");
        self.record(TaskResult::succeeded(
            envelope.id,
            envelope.task_type.clone(),
            Self::attempts_after(envelope),
            value,
        ))
        .await;
    }

    async fn settle_failure(
        &self,
        envelope: &TaskEnvelope,
        lease_id: Uuid,
        policy: &RetryPolicy,
        err: ExecutionError,
    ) {
        let message = err.to_string();
        let decision = classify(&err);

        match policy.disposition(decision, envelope.attempt, envelope.max_attempts, Utc::now()) {
            Disposition::Retry { at } => {
                if let Err(e) = self.queue.retry(envelope.id, lease_id, at, &message).await {
                    self.log_transition_error(envelope, "retry", e);
                    return;
                }
                warn!(
                    task_id = %envelope.id,
                    task_type = %envelope.task_type,
                    attempt = envelope.attempt + 1,
                    retry_at = %at,
                    "Task failed, will retry: {message}"
                );
                self.record(TaskResult::failed(
                    envelope.id,
                    envelope.task_type.clone(),
                    TaskStatus::FailedRetrying,
                    Self::attempts_after(envelope),
                    message,
                ))
                .await;
            }
            Disposition::DeadLetter { reason } => {
                if let Err(e) = self.queue.dead_letter(envelope.id, lease_id, &message).await {
                    self.log_transition_error(envelope, "dead_letter", e);
                    return;
                }
                error!(
                    task_id = %envelope.id,
                    task_type = %envelope.task_type,
                    %reason,
                    "Task dead-lettered: {message}"
                );
                self.record(TaskResult::failed(
                    envelope.id,
                    envelope.task_type.clone(),
                    TaskStatus::Dead,
                    Self::attempts_after(envelope),
                    message,
                ))
                .await;
            }
        }
    }

    async fn settle_interrupted(&self, envelope: &TaskEnvelope, lease_id: Uuid) {
        match self
            .queue
            .requeue(envelope.id, lease_id, Utc::now(), RequeueReason::Interrupted)
            .await
        {
            Ok(()) => {
                self.interrupted.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task_id = %envelope.id,
                    task_type = %envelope.task_type,
                    "Task interrupted by shutdown, requeued"
                );
            }
            Err(e) => self.log_transition_error(envelope, "requeue", e),
        }
    }

    async fn record(&self, result: TaskResult) {
        let id = result.id;
        if let Err(e) = self.results.record(result).await {
            warn!(task_id = %id, "Failed to record task result: {e}");
        }
    }

    fn log_transition_error(&self, envelope: &TaskEnvelope, op: &str, e: QueueError) {
        match e {
            QueueError::LeaseExpired { .. } | QueueError::NotFound(_) => warn!(
                task_id = %envelope.id,
                task_type = %envelope.task_type,
                op,
                "Lease lost before settling, abandoning execution"
            ),
            other => error!(task_id = %envelope.id, op, "Queue transition failed: {other}"),
        }
    }
}
