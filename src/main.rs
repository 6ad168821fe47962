use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use assist_worker::config::RuntimeConfig;
use assist_worker::queue::BrokerQueue;
use assist_worker::results::{PURGE_TASK_TYPE, PurgeExpiredResults, ResultStore};
use assist_worker::runtime::Runtime;
use assist_worker::scheduler::{CronJobDefinition, CronSchedule};
use assist_worker::store::LibSqlBackend;
use assist_worker::tasks::{RetryPolicy, TaskDefaults};

/// Install the tracing subscriber. The returned guard flushes the file
/// writer and must live as long as the process.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    match std::env::var("ASSIST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "assist-worker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = RuntimeConfig::from_env().context("invalid configuration")?;

    eprintln!("⚙️  Assist Worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Pool size: {}", config.pool_size);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.db_path.display())
            })?
            .with_visibility_timeout(config.visibility_timeout)
            .with_retention(config.result_retention),
    );
    let queue: Arc<dyn BrokerQueue> = backend.clone();
    let results: Arc<dyn ResultStore> = backend;

    // ── Built-in tasks ───────────────────────────────────────────────────
    let purge = PurgeExpiredResults::new(
        Arc::clone(&results),
        Arc::clone(&queue),
        config.result_retention,
    );
    let mut runtime = Runtime::new(config.clone(), queue, results);
    runtime.registry_mut().register(
        PURGE_TASK_TYPE,
        Arc::new(purge),
        TaskDefaults::new(RetryPolicy::default()).with_max_concurrency(1),
    )?;
    let runtime = runtime.cron(CronJobDefinition::new(
        "purge-task-results",
        PURGE_TASK_TYPE,
        CronSchedule::daily(3, 0, 0)?,
    ));

    let handle = runtime.start().await.context("failed to start task runtime")?;
    eprintln!("   Running. Ctrl-C to stop.\n");

    let report = handle
        .shutdown_on(async {
            let signal = tokio::signal::ctrl_c().await;
            eprintln!("\n   Shutting down (grace {}s)...", config.shutdown_grace.as_secs());
            signal
        })
        .await;
    if report.forced {
        tracing::warn!(
            interrupted = report.interrupted,
            "Shutdown forced in-flight tasks back to the queue"
        );
    }

    Ok(())
}
