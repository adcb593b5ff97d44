//! # Taskmill
//!
//! A distributed task-queue worker framework: producers push tasks into a
//! shared broker, worker processes pull batches and run them through a
//! pluggable executor, and every lifecycle outcome is dispatched to
//! user-defined handlers.
//!
//! ## Features
//!
//! - **Pluggable storage**: one connector contract with in-memory, Redis,
//!   sharded Redis, MongoDB and PostgreSQL backends behind feature flags
//! - **Priority + delay in one dimension**: high/normal classes and
//!   delayed visibility share a single score, so a pop is one ordered read
//! - **Distributed locks**: TTL-bounded, crash-safe, backed by each
//!   store's native uniqueness primitive
//! - **Escalating timeouts**: an out-of-process watchdog walks a stuck
//!   worker through soft/hard/critical signals; a threaded pool gets
//!   per-task in-process cancellation
//! - **Lifecycle protocol**: success, failure, timeout, retry,
//!   max-retries, requeue and starvation callbacks, with cross-handler
//!   redirection
//! - **Process tree**: a supervisor that respawns, restarts-on-request and
//!   memory-polices worker subprocesses over a plain exit-code contract
//! - **Async/await**: built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use taskmill::{
//!     Priority, Task, Worker, WorkerConfig,
//!     worker::{TaskHandler, WorkResult, WorkerContext},
//! };
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl TaskHandler for SendEmail {
//!     async fn work(&self, _ctx: &WorkerContext, task: &Task) -> WorkResult {
//!         let to = task.kwargs["to"].as_str().unwrap_or_default();
//!         println!("sending email to {}", to);
//!         Ok(Value::Null)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> taskmill::Result<()> {
//!     let config = WorkerConfig::new("emails").with_max_tasks_per_run(100);
//!     let worker = Worker::new(config, Arc::new(SendEmail)).await?;
//!
//!     // Enqueue and process.
//!     let task = Task::default().with_kwarg("to", json!("user@example.com"));
//!     worker.broker().push_task("emails", &task, Priority::Normal, None).await?;
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `redis` - Redis and sharded-Redis connectors (default)
//! - `mongodb` - MongoDB connector
//! - `postgres` - PostgreSQL connector

pub mod broker;
pub mod config;
pub mod connector;
pub mod encoder;
pub mod error;
pub mod events;
pub mod executor;
pub mod killer;
pub mod priority;
pub mod supervisor;
pub mod task;
pub mod worker;

pub use broker::Broker;
pub use config::{
    ExecutorConfig, LogDestination, LoggingConfig, SupervisorConfig, TimeoutConfig, WorkerConfig,
};
pub use connector::{Connector, ConnectorConfig, Lock};
pub use encoder::{Compressor, Encoder, Serializer};
pub use error::TaskmillError;
pub use events::{EventKind, EventLogConfig};
pub use executor::{Outcome, TimeoutKind, WorkerInterrupt};
pub use priority::Priority;
pub use supervisor::Supervisor;
pub use task::Task;
pub use worker::{
    ExitReason, HandlerRegistry, RunSummary, TaskHandler, WorkError, WorkResult, Worker,
    WorkerContext,
};

/// Convenient type alias for Results with [`TaskmillError`] as the error type.
///
/// This is used throughout the crate for consistent error handling.
pub type Result<T> = std::result::Result<T, TaskmillError>;
