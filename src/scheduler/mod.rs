//! Cron scheduler: turns recurring job definitions into queued envelopes.
//!
//! The scheduler never executes work itself. Each tick it enqueues one
//! envelope per due job and advances that job's next fire time. Downtime is
//! not backfilled: a job whose fire time passed while nothing was ticking
//! fires once, then moves to its next instant after the tick.

pub mod schedule;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ScheduleError;
use crate::queue::BrokerQueue;
use crate::tasks::{TaskEnvelope, TaskId, TaskOrigin, TaskRegistry};

pub use schedule::{CronJobDefinition, CronSchedule, Field};

/// What a single tick did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// `(job name, enqueued task id)` in firing order.
    pub fired: Vec<(String, TaskId)>,
    /// `(job name, error)` for jobs that stay due.
    pub failed: Vec<(String, String)>,
}

/// Enqueues cron-driven envelopes.
pub struct CronScheduler {
    jobs: Mutex<Vec<CronJobDefinition>>,
    registry: Arc<TaskRegistry>,
    queue: Arc<dyn BrokerQueue>,
}

impl CronScheduler {
    /// Build a scheduler whose jobs first fire strictly after now.
    pub fn new(
        jobs: Vec<CronJobDefinition>,
        registry: Arc<TaskRegistry>,
        queue: Arc<dyn BrokerQueue>,
    ) -> Result<Self, ScheduleError> {
        Self::starting_at(jobs, registry, queue, Utc::now())
    }

    /// Build a scheduler whose jobs first fire strictly after `start`.
    pub fn starting_at(
        mut jobs: Vec<CronJobDefinition>,
        registry: Arc<TaskRegistry>,
        queue: Arc<dyn BrokerQueue>,
        start: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let mut names = HashSet::new();
        for job in &mut jobs {
            if !names.insert(job.name.clone()) {
                return Err(ScheduleError::DuplicateJob(job.name.clone()));
            }
            if !registry.has(&job.handler_type) {
                return Err(ScheduleError::UnknownHandler {
                    job: job.name.clone(),
                    task_type: job.handler_type.clone(),
                });
            }
            job.next_fire_at = job.schedule.next_after(start);
            if job.next_fire_at.is_none() {
                return Err(ScheduleError::Exhausted(job.name.clone()));
            }
            debug!(
                job = %job.name,
                schedule = %job.schedule,
                next_fire_at = ?job.next_fire_at,
                "Cron job registered"
            );
        }

        Ok(Self {
            jobs: Mutex::new(jobs),
            registry,
            queue,
        })
    }

    /// Fire every job due at `now`, in registration order.
    ///
    /// A job that fails to enqueue keeps its fire time and is retried on the
    /// next tick; other jobs are unaffected.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut jobs = self.jobs.lock().await;

        for job in jobs.iter_mut().filter(|j| j.is_due(now)) {
            let max_attempts = match self.registry.resolve(&job.handler_type) {
                Ok(task) => task.defaults.retry.max_attempts,
                Err(e) => {
                    error!(job = %job.name, "Cron job cannot fire: {e}");
                    report.failed.push((job.name.clone(), e.to_string()));
                    continue;
                }
            };

            let envelope =
                TaskEnvelope::new(job.handler_type.clone(), job.payload.clone(), max_attempts)
                    .with_origin(TaskOrigin::Cron)
                    .scheduled_at(now);

            match self.queue.enqueue(envelope).await {
                Ok(task_id) => {
                    job.last_fired_at = Some(now);
                    job.next_fire_at = job.schedule.next_after(now);
                    if job.next_fire_at.is_none() {
                        warn!(job = %job.name, "Cron schedule has no further fire times");
                    }
                    info!(
                        job = %job.name,
                        task_id = %task_id,
                        next_fire_at = ?job.next_fire_at,
                        "Cron job fired"
                    );
                    report.fired.push((job.name.clone(), task_id));
                }
                Err(e) => {
                    warn!(job = %job.name, "Cron enqueue failed, will retry next tick: {e}");
                    report.failed.push((job.name.clone(), e.to_string()));
                }
            }
        }

        report
    }

    /// Remove a job. Returns whether it existed.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        before != jobs.len()
    }

    /// Snapshot of all jobs and their fire times.
    pub async fn jobs(&self) -> Vec<CronJobDefinition> {
        self.jobs.lock().await.clone()
    }

    /// Run the tick loop until `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick(Utc::now()).await;
                    }
                }
            }
            debug!("Cron ticker stopped");
        })
    }
}
