//! In-memory result store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{DEFAULT_RETENTION, ResultStore, TaskResult};
use crate::error::ResultError;
use crate::tasks::TaskId;

/// Process-local [`ResultStore`].
pub struct MemoryResultStore {
    results: RwLock<HashMap<TaskId, TaskResult>>,
    retention: Duration,
}

impl MemoryResultStore {
    pub fn new() -> Arc<Self> {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            results: RwLock::new(HashMap::new()),
            retention,
        })
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn record(&self, result: TaskResult) -> Result<(), ResultError> {
        self.results.write().await.insert(result.id, result);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<TaskResult, ResultError> {
        let results = self.results.read().await;
        match results.get(&id) {
            Some(r) if !r.is_expired(self.retention, Utc::now()) => Ok(r.clone()),
            _ => Err(ResultError::NotFound(id)),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ResultError> {
        let mut results = self.results.write().await;
        let before = results.len();
        results.retain(|_, r| !r.is_expired(self.retention, now));
        Ok(before - results.len())
    }
}
