//! Task registry: task-type name → handler and per-type defaults.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, RegistryError};
use crate::tasks::envelope::{TaskId, TaskOrigin};
use crate::tasks::retry::{PolicyOverride, RetryPolicy};

static TYPE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_.]*$").unwrap_or_else(|e| panic!("task type regex: {e}"))
});

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    /// Executions before this one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub origin: TaskOrigin,
    /// Cancelled on timeout or forced shutdown.
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

/// Business logic behind a task type.
///
/// Handlers must be idempotent: an envelope may execute more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        (self.f)(ctx, payload).await
    }
}

type HandlerFuture = BoxFuture<'static, Result<serde_json::Value, HandlerError>>;

type TypedFn<P> = dyn Fn(TaskContext, P) -> HandlerFuture + Send + Sync;

/// Handler that deserializes its payload into `P` before running.
struct TypedHandler<P> {
    f: Box<TypedFn<P>>,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P> TaskHandler for TypedHandler<P>
where
    P: DeserializeOwned + Send + 'static,
{
    async fn run(
        &self,
        ctx: TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let payload: P = serde_json::from_value(payload)?;
        (self.f)(ctx, payload).await
    }
}

/// Per-type defaults declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TaskDefaults {
    pub retry: RetryPolicy,
    /// Upper bound on simultaneous executions of this type (None = pool size).
    pub max_concurrency: Option<usize>,
}

impl TaskDefaults {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            max_concurrency: None,
        }
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }
}

/// A resolved registry entry.
#[derive(Clone)]
pub struct RegisteredTask {
    pub handler: Arc<dyn TaskHandler>,
    pub defaults: TaskDefaults,
}

/// Registry of task types.
///
/// Built before the worker pool starts, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `type_name`.
    pub fn register(
        &mut self,
        type_name: &str,
        handler: Arc<dyn TaskHandler>,
        defaults: TaskDefaults,
    ) -> Result<(), RegistryError> {
        if !TYPE_NAME.is_match(type_name) {
            return Err(RegistryError::InvalidTypeName(type_name.to_string()));
        }
        if self.tasks.contains_key(type_name) {
            return Err(RegistryError::DuplicateType(type_name.to_string()));
        }
        self.tasks
            .insert(type_name.to_string(), RegisteredTask { handler, defaults });
        tracing::debug!(task_type = %type_name, "Registered task type");
        Ok(())
    }

    /// Register a handler whose payload is deserialized into `P`.
    ///
    /// A payload that does not match `P` fails as malformed and is never retried.
    pub fn register_typed<P, F, Fut>(
        &mut self,
        type_name: &str,
        defaults: TaskDefaults,
        f: F,
    ) -> Result<(), RegistryError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(TaskContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        let run: Box<TypedFn<P>> =
            Box::new(move |ctx: TaskContext, payload: P| -> HandlerFuture {
                Box::pin(f(ctx, payload))
            });
        let handler = TypedHandler::<P> {
            f: run,
            _payload: PhantomData,
        };
        self.register(type_name, Arc::new(handler), defaults)
    }

    /// Look up the handler and defaults for `type_name`.
    pub fn resolve(&self, type_name: &str) -> Result<&RegisteredTask, RegistryError> {
        self.tasks
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownTaskType(type_name.to_string()))
    }

    /// Apply configured policy overrides. Overrides naming unknown types are
    /// reported back so the caller can warn about them.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, PolicyOverride>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (name, o) in overrides {
            match self.tasks.get_mut(name) {
                Some(entry) => entry.defaults.retry = o.apply(entry.defaults.retry),
                None => unknown.push(name.clone()),
            }
        }
        unknown.sort();
        unknown
    }

    pub fn has(&self, type_name: &str) -> bool {
        self.tasks.contains_key(type_name)
    }

    /// List all registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    /// Per-type concurrency limits, for the pool's semaphores.
    pub fn concurrency_limits(&self) -> impl Iterator<Item = (&str, usize)> {
        self.tasks
            .iter()
            .filter_map(|(name, t)| t.defaults.max_concurrency.map(|n| (name.as_str(), n)))
    }

    /// Retry policy of every registered type.
    pub fn policies(&self) -> impl Iterator<Item = (&str, &RetryPolicy)> {
        self.tasks
            .iter()
            .map(|(name, t)| (name.as_str(), &t.defaults.retry))
    }

    /// Largest handler timeout across all types.
    pub fn max_timeout(&self) -> Option<std::time::Duration> {
        self.tasks.values().map(|t| t.defaults.retry.timeout).max()
    }
}
