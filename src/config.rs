//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;

use crate::error::ConfigError;
use crate::tasks::{PolicyOverride, TaskRegistry, checked_after, checked_before};
use crate::worker::WorkerPoolConfig;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Number of worker slots.
    pub pool_size: usize,
    /// Lease length for claimed envelopes.
    pub visibility_timeout: Duration,
    /// Cron scheduler tick period.
    pub tick_interval: Duration,
    /// Sleep between empty dequeues.
    pub idle_backoff: Duration,
    /// Time in-flight tasks get to finish on shutdown.
    pub shutdown_grace: Duration,
    /// How long terminal results stay queryable.
    pub result_retention: Duration,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Per-type retry/timeout overrides keyed by task type.
    pub policy_overrides: HashMap<String, PolicyOverride>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            visibility_timeout: Duration::from_secs(300), // 5 minutes
            tick_interval: Duration::from_millis(1000),
            idle_backoff: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(30),
            result_retention: Duration::from_secs(168 * 3600), // 7 days
            db_path: PathBuf::from("./data/assist-worker.db"),
            policy_overrides: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `ASSIST_WORKER_*` environment variables; unset ones keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let pool_size = parse_var(&lookup, "ASSIST_WORKER_POOL_SIZE", defaults.pool_size)?;
        let visibility_timeout = Duration::from_secs(parse_var(
            &lookup,
            "ASSIST_WORKER_VISIBILITY_TIMEOUT_SECS",
            defaults.visibility_timeout.as_secs(),
        )?);
        let tick_interval = Duration::from_millis(parse_var(
            &lookup,
            "ASSIST_WORKER_TICK_INTERVAL_MS",
            defaults.tick_interval.as_millis() as u64,
        )?);
        let idle_backoff = Duration::from_millis(parse_var(
            &lookup,
            "ASSIST_WORKER_IDLE_BACKOFF_MS",
            defaults.idle_backoff.as_millis() as u64,
        )?);
        let shutdown_grace = Duration::from_secs(parse_var(
            &lookup,
            "ASSIST_WORKER_SHUTDOWN_GRACE_SECS",
            defaults.shutdown_grace.as_secs(),
        )?);
        let retention_hours: u64 = parse_var(
            &lookup,
            "ASSIST_WORKER_RESULT_RETENTION_HOURS",
            defaults.result_retention.as_secs() / 3600,
        )?;
        let db_path = lookup("ASSIST_WORKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let policy_overrides = match lookup("ASSIST_WORKER_TASK_POLICIES") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "ASSIST_WORKER_TASK_POLICIES".to_string(),
                    message: e.to_string(),
                }
            })?,
            _ => HashMap::new(),
        };

        let result_retention = retention_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "ASSIST_WORKER_RESULT_RETENTION_HOURS".to_string(),
                message: format!("{retention_hours} hours overflows"),
            })?;

        let config = Self {
            pool_size,
            visibility_timeout,
            tick_interval,
            idle_backoff,
            shutdown_grace,
            result_retention,
            db_path,
            policy_overrides,
        };
        config.validate_values()?;
        Ok(config)
    }

    fn validate_values(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ASSIST_WORKER_POOL_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ASSIST_WORKER_TICK_INTERVAL_MS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        // Leases and retention cutoffs are computed as `now +/- span`.
        let now = Utc::now();
        for (key, span) in [
            ("ASSIST_WORKER_VISIBILITY_TIMEOUT_SECS", self.visibility_timeout),
            ("ASSIST_WORKER_IDLE_BACKOFF_MS", self.idle_backoff),
            ("ASSIST_WORKER_RESULT_RETENTION_HOURS", self.result_retention),
        ] {
            if checked_after(now, span).is_none() || checked_before(now, span).is_none() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{span:?} is out of range"),
                });
            }
        }
        Ok(())
    }

    /// Check the configuration against the registered task types.
    ///
    /// The visibility timeout must be longer than every handler timeout;
    /// otherwise a slow but healthy execution is reclaimed and runs on a
    /// second slot while the first is still going.
    pub fn validate(&self, registry: &TaskRegistry) -> Result<(), ConfigError> {
        self.validate_values()?;
        if let Some(max_timeout) = registry.max_timeout() {
            if self.visibility_timeout <= max_timeout {
                let visibility = self.visibility_timeout;
                return Err(ConfigError::InvalidValue {
                    key: "ASSIST_WORKER_VISIBILITY_TIMEOUT_SECS".to_string(),
                    message: format!(
                        "{visibility:?} must exceed the slowest handler timeout {max_timeout:?}"
                    ),
                });
            }
        }
        for (task_type, policy) in registry.policies() {
            if let Some(attempt) = policy.backoff_plateau() {
                tracing::warn!(
                    task_type,
                    attempt,
                    max_backoff_secs = policy.max_backoff.as_secs(),
                    "Retry delays stop growing at this attempt"
                );
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            pool_size: self.pool_size,
            idle_backoff: self.idle_backoff,
            ..WorkerPoolConfig::default()
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}
