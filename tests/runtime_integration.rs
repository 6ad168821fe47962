//! End-to-end tests driving the runtime through `TaskClient`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Notify;

use assist_worker::config::RuntimeConfig;
use assist_worker::error::{ConfigError, Error, LifecycleError};
use assist_worker::lifecycle::LifecycleHook;
use assist_worker::queue::{BrokerQueue, MemoryQueue};
use assist_worker::results::{MemoryResultStore, ResultStore};
use assist_worker::runtime::{Runtime, RuntimeHandle};
use assist_worker::scheduler::CronJobDefinition;
use assist_worker::store::LibSqlBackend;
use assist_worker::tasks::{RetryPolicy, TaskDefaults, TaskRegistry, TaskStatus, handler_fn};
use assist_worker::{HandlerError, TaskClient, TaskStatusReport};

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        pool_size: 2,
        tick_interval: Duration::from_millis(20),
        idle_backoff: Duration::from_millis(5),
        shutdown_grace: Duration::from_secs(1),
        ..RuntimeConfig::default()
    }
}

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_backoff(Duration::from_millis(40), 2.0)
        .with_timeout(Duration::from_secs(5))
}

async fn wait_for_status(
    client: &TaskClient,
    id: uuid::Uuid,
    status: TaskStatus,
) -> TaskStatusReport {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(report) = client.get_status(id).await {
            if report.status == status {
                return report;
            }
        }
        assert!(Instant::now() < deadline, "task {id} never reached {status}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

/// Registry with a `send_email` handler that waits for `release` before finishing.
fn email_registry(release: Arc<Notify>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_typed(
            "send_email",
            TaskDefaults::new(quick_retry(3)),
            move |_, email: SendEmail| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok::<_, HandlerError>(serde_json::json!({
                        "delivered_to": email.to,
                        "subject": email.subject,
                    }))
                }
            },
        )
        .unwrap();
    registry
}

async fn run_send_email(handle: RuntimeHandle, release: Arc<Notify>) {
    let client = handle.client();
    let id = client
        .enqueue(
            "send_email",
            serde_json::json!({"to": "ana@example.com", "subject": "Standup notes"}),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let pending = client.get_status(id).await.unwrap();
    assert_eq!(pending.status, TaskStatus::Pending);
    assert_eq!(pending.attempt, 0);

    wait_for_status(&client, id, TaskStatus::Running).await;
    release.notify_one();

    let done = wait_for_status(&client, id, TaskStatus::Succeeded).await;
    assert_eq!(done.attempt, 1);
    assert_eq!(
        done.result,
        Some(serde_json::json!({"delivered_to": "ana@example.com", "subject": "Standup notes"}))
    );
    assert!(done.error.is_none());

    let report = handle.shutdown().await;
    assert!(!report.forced);
}

#[tokio::test]
async fn send_email_end_to_end_in_memory() {
    let release = Arc::new(Notify::new());
    let handle = Runtime::new(test_config(), MemoryQueue::new(), MemoryResultStore::new())
        .with_registry(email_registry(Arc::clone(&release)))
        .start()
        .await
        .unwrap();
    run_send_email(handle, release).await;
}

#[tokio::test]
async fn send_email_end_to_end_libsql() {
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let release = Arc::new(Notify::new());
    let handle = Runtime::new(test_config(), backend.clone(), backend)
        .with_registry(email_registry(Arc::clone(&release)))
        .start()
        .await
        .unwrap();
    run_send_email(handle, release).await;
}

#[tokio::test]
async fn always_failing_task_backs_off_then_dies() {
    let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "sync_calendar",
            Arc::new(handler_fn(move |_, _| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(Instant::now());
                    Err::<serde_json::Value, _>(HandlerError::retriable(
                        "calendar API returned 503",
                    ))
                }
            })),
            TaskDefaults::new(quick_retry(4)),
        )
        .unwrap();

    let queue = MemoryQueue::new();
    let handle = Runtime::new(test_config(), queue.clone(), MemoryResultStore::new())
        .with_registry(registry)
        .start()
        .await
        .unwrap();
    let client = handle.client();
    let id = client
        .enqueue("sync_calendar", serde_json::Value::Null, None)
        .await
        .unwrap();

    let dead = wait_for_status(&client, id, TaskStatus::Dead).await;
    handle.shutdown().await;

    assert_eq!(dead.attempt, 4);
    assert!(dead.error.unwrap().contains("calendar API returned 503"));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 4, "one first run plus max_attempts - 1 retries");
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    for pair in gaps.windows(2) {
        assert!(pair[1] > pair[0], "backoff must grow: {gaps:?}");
    }

    let dead_letters = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].attempt, dead_letters[0].max_attempts);
}

#[tokio::test]
async fn shutdown_grace_acks_fast_and_requeues_slow() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "summarize",
            Arc::new(handler_fn(|_, payload| async move {
                let ms = payload["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, HandlerError>(serde_json::json!({"slept_ms": ms}))
            })),
            TaskDefaults::new(quick_retry(3).with_timeout(Duration::from_secs(60))),
        )
        .unwrap();

    let queue = MemoryQueue::new();
    let handle = Runtime::new(test_config(), queue.clone(), MemoryResultStore::new())
        .with_registry(registry)
        .start()
        .await
        .unwrap();
    let client = handle.client();
    let fast = client
        .enqueue("summarize", serde_json::json!({"ms": 50}), None)
        .await
        .unwrap();
    let slow = client
        .enqueue("summarize", serde_json::json!({"ms": 30_000}), None)
        .await
        .unwrap();
    wait_for_status(&client, slow, TaskStatus::Running).await;

    let report = handle.shutdown_with_grace(Duration::from_millis(300)).await;
    assert!(report.forced);
    assert_eq!(report.interrupted, 1);

    assert_eq!(client.get_status(fast).await.unwrap().status, TaskStatus::Succeeded);
    let requeued = queue.get(slow).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::FailedRetrying);
    assert_eq!(requeued.attempt, 0);
}

#[tokio::test]
async fn crashed_claim_recovered_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("queue.db");

    let id = {
        let backend = LibSqlBackend::new_local(&path)
            .await
            .unwrap()
            .with_visibility_timeout(Duration::from_millis(50));
        let id = backend
            .enqueue(assist_worker::tasks::TaskEnvelope::new(
                "renew_watch",
                serde_json::json!({"channel": "calendar"}),
                3,
            ))
            .await
            .unwrap();
        // Claimed, then the process dies without settling.
        assert_eq!(backend.dequeue_ready(1).await.unwrap().len(), 1);
        id
    };
    tokio::time::sleep(Duration::from_millis(80)).await;

    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "renew_watch",
            Arc::new(handler_fn(move |ctx, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(serde_json::json!({"attempt_seen": ctx.attempt}))
                }
            })),
            TaskDefaults::new(quick_retry(3)),
        )
        .unwrap();

    let backend = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let handle = Runtime::new(test_config(), backend.clone(), backend)
        .with_registry(registry)
        .start()
        .await
        .unwrap();
    let client = handle.client();
    let done = wait_for_status(&client, id, TaskStatus::Succeeded).await;
    handle.shutdown().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    // Reclaiming an expired lease does not charge an attempt.
    assert_eq!(done.result, Some(serde_json::json!({"attempt_seen": 0})));
}

#[tokio::test]
async fn cron_job_runs_through_pool() {
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "heartbeat",
            Arc::new(handler_fn(move |ctx, payload| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(ctx.origin, assist_worker::tasks::TaskOrigin::Cron);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(payload)
                }
            })),
            TaskDefaults::new(quick_retry(1)),
        )
        .unwrap();

    let handle = Runtime::new(test_config(), MemoryQueue::new(), MemoryResultStore::new())
        .with_registry(registry)
        .cron(
            CronJobDefinition::new("every-second", "heartbeat", "*:*:*".parse().unwrap())
                .with_payload(serde_json::json!({"source": "cron"})),
        )
        .start()
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(4);
    while runs.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "cron job never executed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let jobs = handle.scheduler().jobs().await;
    let job = &jobs[0];
    assert!(job.next_fire_at.unwrap() > job.last_fired_at.unwrap());
    handle.shutdown().await;
}

struct FailingHook;

#[async_trait]
impl LifecycleHook for FailingHook {
    fn name(&self) -> &str {
        "broker-connection"
    }

    async fn startup(&self) -> assist_worker::Result<()> {
        Err(assist_worker::error::DatabaseError::Pool("connection refused".to_string()).into())
    }

    async fn shutdown(&self) -> assist_worker::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn failed_startup_hook_aborts_before_claiming() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "noop",
            Arc::new(handler_fn(|_, _| async {
                Ok::<_, HandlerError>(serde_json::Value::Null)
            })),
            TaskDefaults::new(quick_retry(1)),
        )
        .unwrap();
    let queue = MemoryQueue::new();
    let id = queue
        .enqueue(assist_worker::tasks::TaskEnvelope::new("noop", serde_json::Value::Null, 1))
        .await
        .unwrap();

    let result = Runtime::new(test_config(), queue.clone(), MemoryResultStore::new())
        .with_registry(registry)
        .hook(Arc::new(FailingHook))
        .start()
        .await;

    assert!(matches!(
        result,
        Err(Error::Lifecycle(LifecycleError::StartupFailed { ref hook, .. }))
            if hook == "broker-connection"
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn policy_overrides_apply_at_start() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "flaky",
            Arc::new(handler_fn(|_, _| async {
                Err::<serde_json::Value, _>(HandlerError::retriable("nope"))
            })),
            TaskDefaults::new(quick_retry(5)),
        )
        .unwrap();
    let mut config = test_config();
    config.policy_overrides.insert(
        "flaky".to_string(),
        serde_json::from_str(r#"{"max_attempts": 1}"#).unwrap(),
    );

    let results = MemoryResultStore::new();
    let handle = Runtime::new(config, MemoryQueue::new(), results.clone())
        .with_registry(registry)
        .start()
        .await
        .unwrap();
    let client = handle.client();
    let id = client.enqueue("flaky", serde_json::Value::Null, None).await.unwrap();
    let dead = wait_for_status(&client, id, TaskStatus::Dead).await;
    assert_eq!(dead.attempt, 1);
    assert_eq!(results.get(id).await.unwrap().status, TaskStatus::Dead);
    handle.shutdown().await;
}

fn noop_registry(timeout: Duration) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "noop",
            Arc::new(handler_fn(|_, _| async {
                Ok::<_, HandlerError>(serde_json::json!({"ok": true}))
            })),
            TaskDefaults::new(quick_retry(1).with_timeout(timeout)),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn runtime_refuses_visibility_timeout_shorter_than_handler_timeout() {
    let config = RuntimeConfig {
        visibility_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let queue = MemoryQueue::new();
    let id = queue
        .enqueue(assist_worker::tasks::TaskEnvelope::new("noop", serde_json::Value::Null, 1))
        .await
        .unwrap();

    let result = Runtime::new(config, queue.clone(), MemoryResultStore::new())
        .with_registry(noop_registry(Duration::from_secs(5)))
        .start()
        .await;

    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::InvalidValue { ref key, .. }))
            if key == "ASSIST_WORKER_VISIBILITY_TIMEOUT_SECS"
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_stays_visible_through_completion() {
    let config = RuntimeConfig {
        pool_size: 4,
        ..test_config()
    };
    let handle = Runtime::new(config, MemoryQueue::new(), MemoryResultStore::new())
        .with_registry(noop_registry(Duration::from_secs(5)))
        .start()
        .await
        .unwrap();
    let client = handle.client();

    for _ in 0..200 {
        let id = client.enqueue("noop", serde_json::Value::Null, None).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let report = match client.get_status(id).await {
                Ok(report) => report,
                Err(e) => panic!("status of {id} unavailable mid-flight: {e}"),
            };
            if report.status == TaskStatus::Succeeded {
                assert_eq!(report.result, Some(serde_json::json!({"ok": true})));
                break;
            }
            assert!(Instant::now() < deadline, "task {id} never finished");
            tokio::task::yield_now().await;
        }
    }
    handle.shutdown().await;
}

#[derive(Default)]
struct RecordingHook {
    torn_down: AtomicU32,
}

#[async_trait]
impl LifecycleHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    async fn startup(&self) -> assist_worker::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> assist_worker::Result<()> {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn failed_signal_listener_still_shuts_down() {
    let hook = Arc::new(RecordingHook::default());
    let handle = Runtime::new(test_config(), MemoryQueue::new(), MemoryResultStore::new())
        .with_registry(noop_registry(Duration::from_secs(5)))
        .hook(hook.clone())
        .start()
        .await
        .unwrap();

    let report = handle
        .shutdown_on(async { Err::<(), _>(std::io::Error::other("no signal handler")) })
        .await;

    assert!(!report.forced);
    assert_eq!(hook.torn_down.load(Ordering::SeqCst), 1);
}
