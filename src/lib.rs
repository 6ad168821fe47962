//! Assist Worker: task scheduling and execution core.

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod results;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod worker;

pub use client::{TaskClient, TaskStatusReport};
pub use config::RuntimeConfig;
pub use error::{Error, HandlerError, Result};
pub use runtime::{Runtime, RuntimeHandle};
