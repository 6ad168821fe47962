//! Error types for the task worker.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Result store error: {0}")]
    Result(#[from] ResultError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Task type '{0}' is already registered")]
    DuplicateType(String),

    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("Invalid task type name '{0}'")]
    InvalidTypeName(String),
}

/// Broker queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker could not be reached. Slots back off and retry the dequeue.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The claim on this envelope was reclaimed by the queue.
    #[error("Lease on task {id} expired or was reclaimed")]
    LeaseExpired { id: Uuid },

    #[error("Task {0} not found")]
    NotFound(Uuid),

    /// A requested delay or lease length does not fit in a timestamp.
    #[error("Time out of range: {0}")]
    TimeOutOfRange(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<DatabaseError> for QueueError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Serialization(s) => QueueError::Serialization(s),
            other => QueueError::Unavailable(other.to_string()),
        }
    }
}

/// Cron schedule errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Schedule '{0}' has no upcoming fire time")]
    Exhausted(String),

    #[error("Cron job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("Cron job '{job}' targets unregistered task type '{task_type}'")]
    UnknownHandler { job: String, task_type: String },
}

/// Task result store errors.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("No result for task {0}")]
    NotFound(Uuid),

    #[error("Result store unavailable: {0}")]
    Unavailable(String),
}

impl From<DatabaseError> for ResultError {
    fn from(e: DatabaseError) -> Self {
        ResultError::Unavailable(e.to_string())
    }
}

/// Startup / shutdown errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Startup hook '{hook}' failed: {reason}")]
    StartupFailed { hook: String, reason: String },
}

/// Failure reported by a task handler.
///
/// Handlers signal whether a failure is worth retrying; the worker pool turns
/// it into a queue transition and never lets it escape the slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient business failure, retried with backoff.
    #[error("{0}")]
    Retriable(String),

    /// Business failure that will not succeed on retry.
    #[error("{0}")]
    Terminal(String),

    /// The payload did not match the handler's schema.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl HandlerError {
    pub fn retriable(msg: impl Into<String>) -> Self {
        Self::Retriable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::MalformedPayload(e.to_string())
    }
}

/// Why a single execution of a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the worker runtime.
pub type Result<T> = std::result::Result<T, Error>;
