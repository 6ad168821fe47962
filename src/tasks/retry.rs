//! Retry policy and failure classification.
//!
//! A failed execution is first classified into a [`RetryDecision`], then the
//! task type's [`RetryPolicy`] turns that decision plus the attempt count into
//! a [`Disposition`]: retry at a later time, or dead-letter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::checked_after;
use crate::error::{ExecutionError, HandlerError};

/// Per-task-type retry and timeout settings.
///
/// Backoff grows by `backoff_multiplier` per failed attempt until it reaches
/// `max_backoff`. From there every further retry waits the capped delay plus
/// jitter, so delays only keep growing while
/// [`backoff_plateau`](Self::backoff_plateau) is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Growth factor applied per failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
    /// Extra random delay as a fraction of the computed backoff (0.0 disables).
    pub jitter: f64,
    /// Per-execution handler timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(3600),
            jitter: 0.1,
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, multiplier: f64) -> Self {
        self.backoff_base = base;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Backoff before retrying after failed attempt number `attempt` (0-based),
    /// without jitter: `backoff_base * backoff_multiplier^attempt`, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .max(1.0)
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let secs = self.backoff_base.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// First retried attempt whose backoff does not exceed the one before it,
    /// or `None` if delays grow across every retry `max_attempts` allows.
    pub fn backoff_plateau(&self) -> Option<u32> {
        let retries = self.max_attempts.saturating_sub(1);
        (1..retries).find(|&attempt| self.base_delay(attempt) <= self.base_delay(attempt - 1))
    }

    /// Backoff including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(factor)
    }

    /// Decide what happens to a task whose attempt number `attempt` failed.
    pub fn disposition(
        &self,
        decision: RetryDecision,
        attempt: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Disposition {
        match decision {
            RetryDecision::Retriable if attempt + 1 < max_attempts => {
                let at = checked_after(now, self.delay_for(attempt))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Disposition::Retry { at }
            }
            RetryDecision::Retriable => Disposition::DeadLetter {
                reason: DeadReason::AttemptsExhausted,
            },
            RetryDecision::Terminal => Disposition::DeadLetter {
                reason: DeadReason::Terminal,
            },
            RetryDecision::Unknown => Disposition::DeadLetter {
                reason: DeadReason::UnknownTaskType,
            },
        }
    }
}

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient; retry while attempts remain.
    Retriable,
    /// Will not succeed on retry.
    Terminal,
    /// No handler exists for the task type.
    Unknown,
}

/// Map an execution failure to a retry decision.
pub fn classify(error: &ExecutionError) -> RetryDecision {
    match error {
        ExecutionError::UnknownTaskType(_) => RetryDecision::Unknown,
        ExecutionError::Timeout(_) | ExecutionError::Panicked(_) => RetryDecision::Retriable,
        ExecutionError::Handler(HandlerError::Retriable(_)) => RetryDecision::Retriable,
        ExecutionError::Handler(HandlerError::Terminal(_))
        | ExecutionError::Handler(HandlerError::MalformedPayload(_)) => RetryDecision::Terminal,
    }
}

/// What to do with a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Retry { at: DateTime<Utc> },
    DeadLetter { reason: DeadReason },
}

/// Why a task was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    AttemptsExhausted,
    Terminal,
    UnknownTaskType,
}

impl std::fmt::Display for DeadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadReason::AttemptsExhausted => write!(f, "attempts exhausted"),
            DeadReason::Terminal => write!(f, "terminal failure"),
            DeadReason::UnknownTaskType => write!(f, "unknown task type"),
        }
    }
}

/// Per-type policy overrides supplied through configuration.
///
/// Durations are expressed in plain numbers so the map can be written as JSON
/// in an environment variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverride {
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub timeout_secs: Option<u64>,
}

impl PolicyOverride {
    /// Apply the set fields on top of `policy`.
    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(n) = self.max_attempts {
            policy.max_attempts = n.max(1);
        }
        if let Some(ms) = self.backoff_base_ms {
            policy.backoff_base = Duration::from_millis(ms);
        }
        if let Some(m) = self.backoff_multiplier {
            policy.backoff_multiplier = m;
        }
        if let Some(secs) = self.timeout_secs {
            policy.timeout = Duration::from_secs(secs);
        }
        policy
    }
}
