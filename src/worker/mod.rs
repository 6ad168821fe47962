//! Worker pool and slot lifecycle.

pub mod pool;
pub mod slot;

use std::time::Duration;

pub use pool::{ShutdownReport, WorkerPool};
pub use slot::SlotState;

/// Sizing and pacing for a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of slots, fixed for the life of the pool.
    pub pool_size: usize,
    /// Sleep between empty dequeues. Also the delay for deferred envelopes.
    pub idle_backoff: Duration,
    /// Ceiling for the exponential backoff while the queue is unreachable.
    pub max_unavailable_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            idle_backoff: Duration::from_millis(250),
            max_unavailable_backoff: Duration::from_secs(30),
        }
    }
}
