//! Task model: envelopes, the handler registry, and retry policy.
//!
//! - `envelope`: `TaskEnvelope` and its status state machine
//! - `registry`: `TaskRegistry` mapping type names to handlers and defaults
//! - `retry`: `RetryPolicy`, failure classification, backoff

pub mod envelope;
pub mod registry;
pub mod retry;

pub use envelope::{
    Lease, TaskEnvelope, TaskId, TaskOrigin, TaskStatus, checked_after, checked_before,
};
pub use registry::{
    FnHandler, RegisteredTask, TaskContext, TaskDefaults, TaskHandler, TaskRegistry, handler_fn,
};
pub use retry::{DeadReason, Disposition, PolicyOverride, RetryDecision, RetryPolicy, classify};
