//! Startup and teardown hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{LifecycleError, Result};

/// A resource that must be ready before workers claim tasks and released
/// after they stop (broker connections, result-store pools, caches).
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &str;

    async fn startup(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Runs hooks in registration order and tears them down in reverse.
#[derive(Default)]
pub struct Lifecycle {
    hooks: Vec<Arc<dyn LifecycleHook>>,
    /// Number of leading hooks whose startup succeeded.
    started: usize,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Start every hook. On the first failure the hooks already started are
    /// torn down and the failure is returned.
    pub async fn startup(&mut self) -> std::result::Result<(), LifecycleError> {
        for hook in &self.hooks {
            if let Err(e) = hook.startup().await {
                let failed = LifecycleError::StartupFailed {
                    hook: hook.name().to_string(),
                    reason: e.to_string(),
                };
                error!(hook = %hook.name(), "Startup hook failed: {e}");
                self.teardown().await;
                return Err(failed);
            }
            info!(hook = %hook.name(), "Startup hook complete");
            self.started += 1;
        }
        Ok(())
    }

    /// Shut down started hooks in reverse order. Errors are logged and do not
    /// stop the remaining hooks.
    pub async fn teardown(&mut self) {
        for hook in self.hooks[..self.started].iter().rev() {
            match hook.shutdown().await {
                Ok(()) => info!(hook = %hook.name(), "Shutdown hook complete"),
                Err(e) => error!(hook = %hook.name(), "Shutdown hook failed: {e}"),
            }
        }
        self.started = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::{DatabaseError, Error};

    struct Recorder {
        name: String,
        fail_startup: bool,
        fail_shutdown: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                fail_startup: false,
                fail_shutdown: false,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl LifecycleHook for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn startup(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_startup {
                return Err(Error::Database(DatabaseError::Pool("refused".to_string())));
            }
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            if self.fail_shutdown {
                return Err(Error::Database(DatabaseError::Pool("stuck".to_string())));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn startup_in_order_teardown_reversed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        lifecycle.add(Arc::new(Recorder::new("broker", &log)));
        lifecycle.add(Arc::new(Recorder::new("results", &log)));

        lifecycle.startup().await.unwrap();
        lifecycle.teardown().await;
        // Second teardown is a no-op.
        lifecycle.teardown().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:broker", "start:results", "stop:results", "stop:broker"]
        );
    }

    #[tokio::test]
    async fn failed_startup_tears_down_started_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        lifecycle.add(Arc::new(Recorder::new("broker", &log)));
        let mut bad = Recorder::new("cache", &log);
        bad.fail_startup = true;
        lifecycle.add(Arc::new(bad));
        lifecycle.add(Arc::new(Recorder::new("never", &log)));

        let err = lifecycle.startup().await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartupFailed { ref hook, .. } if hook == "cache"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:broker", "start:cache", "stop:broker"]
        );
    }

    #[tokio::test]
    async fn teardown_continues_past_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        lifecycle.add(Arc::new(Recorder::new("a", &log)));
        let mut b = Recorder::new("b", &log);
        b.fail_shutdown = true;
        lifecycle.add(Arc::new(b));

        lifecycle.startup().await.unwrap();
        lifecycle.teardown().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
    }
}
