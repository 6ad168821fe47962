//! Wires registry, queue, scheduler, pool and hooks into a running service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::TaskClient;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::lifecycle::{Lifecycle, LifecycleHook};
use crate::queue::BrokerQueue;
use crate::results::ResultStore;
use crate::scheduler::{CronJobDefinition, CronScheduler};
use crate::tasks::TaskRegistry;
use crate::worker::{ShutdownReport, WorkerPool};

/// Builder for the task runtime. Everything is registered here before
/// [`Runtime::start`]; the registry is frozen once started.
pub struct Runtime {
    config: RuntimeConfig,
    registry: TaskRegistry,
    queue: Arc<dyn BrokerQueue>,
    results: Arc<dyn ResultStore>,
    cron_jobs: Vec<CronJobDefinition>,
    lifecycle: Lifecycle,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        queue: Arc<dyn BrokerQueue>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            config,
            registry: TaskRegistry::new(),
            queue,
            results,
            cron_jobs: Vec::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Use a prepared registry in place of the empty one.
    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut TaskRegistry {
        &mut self.registry
    }

    pub fn cron(mut self, job: CronJobDefinition) -> Self {
        self.cron_jobs.push(job);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.lifecycle.add(hook);
        self
    }

    /// Validate, run startup hooks, then start the worker pool and the
    /// cron ticker.
    pub async fn start(self) -> Result<RuntimeHandle> {
        let Runtime {
            config,
            mut registry,
            queue,
            results,
            cron_jobs,
            mut lifecycle,
        } = self;

        for unknown in registry.apply_overrides(&config.policy_overrides) {
            warn!(task_type = %unknown, "Policy override for unregistered task type ignored");
        }
        config.validate(&registry)?;

        let registry = Arc::new(registry);
        let scheduler = Arc::new(CronScheduler::new(
            cron_jobs,
            Arc::clone(&registry),
            Arc::clone(&queue),
        )?);

        lifecycle.startup().await?;

        let pool = WorkerPool::start(
            config.pool_config(),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&results),
        );
        let cron_cancel = CancellationToken::new();
        let ticker = Arc::clone(&scheduler).spawn(config.tick_interval, cron_cancel.clone());

        info!(
            task_types = registry.count(),
            cron_jobs = scheduler.jobs().await.len(),
            pool_size = pool.size(),
            "Task runtime started"
        );

        Ok(RuntimeHandle {
            client: TaskClient::new(
                Arc::clone(&registry),
                Arc::clone(&queue),
                Arc::clone(&results),
            ),
            scheduler,
            ticker,
            cron_cancel,
            pool,
            lifecycle,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

/// A started runtime.
pub struct RuntimeHandle {
    client: TaskClient,
    scheduler: Arc<CronScheduler>,
    ticker: JoinHandle<()>,
    cron_cancel: CancellationToken,
    pool: WorkerPool,
    lifecycle: Lifecycle,
    shutdown_grace: Duration,
}

impl RuntimeHandle {
    pub fn client(&self) -> TaskClient {
        self.client.clone()
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Wait for `signal`, then shut down with the configured grace period.
    /// A signal that fails to install still leads to a full shutdown.
    pub async fn shutdown_on<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = std::io::Result<()>>,
    {
        if let Err(e) = signal.await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        self.shutdown().await
    }

    /// Shut down with the configured grace period.
    pub async fn shutdown(self) -> ShutdownReport {
        let grace = self.shutdown_grace;
        self.shutdown_with_grace(grace).await
    }

    /// Stop the scheduler, drain the pool for up to `grace`, then run
    /// teardown hooks in reverse order.
    pub async fn shutdown_with_grace(mut self, grace: Duration) -> ShutdownReport {
        info!("Task runtime shutting down");
        self.cron_cancel.cancel();
        if let Err(e) = self.ticker.await {
            warn!("Cron ticker exited abnormally: {e}");
        }

        let report = self.pool.shutdown(grace).await;
        self.lifecycle.teardown().await;
        info!("Task runtime stopped");
        report
    }
}
