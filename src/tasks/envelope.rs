//! Task envelope and its state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a task envelope.
pub type TaskId = Uuid;

/// `now + span`, or `None` when the result is outside the `DateTime` range.
pub fn checked_after(now: DateTime<Utc>, span: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// `now - span`, or `None` when the result is outside the `DateTime` range.
pub fn checked_before(now: DateTime<Utc>, span: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

/// State of a task envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its `scheduled_for` time or a free slot.
    Pending,
    /// Claimed by exactly one worker slot.
    Running,
    /// Handler returned successfully.
    Succeeded,
    /// Last attempt failed; waiting for its backoff to elapse.
    FailedRetrying,
    /// Attempts exhausted or failure was terminal.
    Dead,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) |
            (FailedRetrying, Running) |
            (Running, Succeeded) | (Running, FailedRetrying) |
            (Running, Dead) |
            // Lease expiry or deferral hands the envelope back
            (Running, Pending)
        )
    }

    /// Whether a worker may claim an envelope in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::FailedRetrying)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetrying => "failed_retrying",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed_retrying" => Ok(Self::FailedRetrying),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Who created an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    Cron,
    AdHoc,
}

impl TaskOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::AdHoc => "ad_hoc",
        }
    }
}

impl std::fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskOrigin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Self::Cron),
            "ad_hoc" => Ok(Self::AdHoc),
            other => Err(format!("unknown task origin: {other}")),
        }
    }
}

/// Claim held by the slot that owns a running envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A unit of dispatchable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub created_by: TaskOrigin,

    // Queue-managed
    /// Enqueue order, assigned by the queue. Breaks `scheduled_for` ties.
    pub seq: u64,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
    /// Handler output, set by the ack that marks the envelope `succeeded`.
    pub result: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Create a pending envelope that is eligible immediately.
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            scheduled_for: now,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            status: TaskStatus::Pending,
            created_by: TaskOrigin::AdHoc,
            seq: 0,
            last_error: None,
            lease: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Delay eligibility until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.created_by = origin;
        self
    }

    /// Whether a worker may claim this envelope at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_for <= now
    }

    /// Whether the owning slot's lease has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running
            && self.lease.is_none_or(|lease| lease.expires_at <= now)
    }

    /// Whether `lease_id` is the current claim on this envelope.
    pub fn holds_lease(&self, lease_id: Uuid) -> bool {
        self.status == TaskStatus::Running
            && self.lease.is_some_and(|lease| lease.lease_id == lease_id)
    }

    /// Whether another failed attempt may still be retried.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }
}
