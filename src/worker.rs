//! The worker: pull loop, handler protocol and process entrypoint.
//!
//! A worker owns a broker and an executor, pulls batches from its queue
//! and drives each task through the executor's lifecycle state machine.
//! User code extends [`TaskHandler`]: `work` is required, everything else
//! is an optional hook. Control flow out of `work` is expressed through
//! [`WorkError`] values: `ctx.retry(...)`, `ctx.requeue(...)`,
//! `ctx.stop()` and `ctx.respawn()` all return the matching signal so a
//! handler ends with `return ctx.retry(&task).await;`.

use crate::{
    Result,
    broker::Broker,
    config::{ExecutorConfig, WorkerConfig},
    error::TaskmillError,
    executor::{SerialExecutor, TaskLifecycle, ThreadedExecutor, TimeoutKind, WorkerInterrupt},
    task::Task,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info};

/// What `work` and the lifecycle callbacks return in their error
/// position: either a genuine failure or one of the control signals.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("retry requested")]
    Retry,

    #[error("max retries reached")]
    MaxRetries,

    #[error("requeue requested")]
    Requeue,

    #[error("stop requested")]
    Stop,

    #[error("respawn requested")]
    Respawn,

    #[error("{0}")]
    Failed(String),
}

impl WorkError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        WorkError::Failed(err.to_string())
    }
}

impl From<TaskmillError> for WorkError {
    fn from(err: TaskmillError) -> Self {
        WorkError::Failed(err.to_string())
    }
}

pub type WorkResult = std::result::Result<Value, WorkError>;

/// Everything a handler can reach while processing: the immutable worker
/// configuration, the broker, and the control-signal constructors.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub broker: Arc<Broker>,
}

impl WorkerContext {
    pub fn new(config: WorkerConfig, broker: Arc<Broker>) -> Self {
        Self { config, broker }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.name
    }

    /// Push the task back with its run count bumped and signal a retry,
    /// unless the retry ceiling is hit, in which case nothing is pushed
    /// and the max-retries signal fires instead.
    pub async fn retry(&self, task: &Task) -> WorkResult {
        if self.config.max_retries > 0 && task.run_count >= self.config.max_retries {
            return Err(WorkError::MaxRetries);
        }
        self.broker.retry(&self.config.name, task).await?;
        Err(WorkError::Retry)
    }

    /// Push the task back unchanged and signal a requeue.
    pub async fn requeue(&self, task: &Task) -> WorkResult {
        self.broker.requeue(&self.config.name, task).await?;
        Err(WorkError::Requeue)
    }

    /// Graceful shutdown: aborts the batch and exits the pull loop.
    pub fn stop(&self) -> WorkResult {
        Err(WorkError::Stop)
    }

    /// Controlled restart: exits like `stop` but with the respawn exit
    /// code, which the supervisor answers by starting a replacement.
    pub fn respawn(&self) -> WorkResult {
        Err(WorkError::Respawn)
    }
}

/// User extension point. `work` does the work; the hooks observe the
/// lifecycle around it.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn work(&self, ctx: &WorkerContext, task: &Task) -> WorkResult;

    /// Runs once before the first pull.
    async fn initialize(&self, _ctx: &WorkerContext) {}

    /// Runs once after the pull loop ends, whatever the exit reason.
    async fn finalize(&self, _ctx: &WorkerContext) {}

    /// Before each task. Errors are logged, never fatal.
    async fn pre_work(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    /// After each task, whatever the outcome. Errors are logged, never
    /// fatal.
    async fn post_work(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    async fn on_success(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
        _value: &Value,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    /// May return a retry/requeue/max-retries signal to re-route the
    /// outcome to that handler instead.
    async fn on_failure(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
        _error: &WorkError,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    /// Same re-routing rules as `on_failure`.
    async fn on_timeout(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
        _kind: TimeoutKind,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    async fn on_retry(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    async fn on_max_retries(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    async fn on_requeue(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }

    /// Fired when the worker has pulled nothing for the configured
    /// starvation window; once per empty streak.
    async fn on_starvation(
        &self,
        _ctx: &WorkerContext,
        _idle: Duration,
    ) -> std::result::Result<(), WorkError> {
        Ok(())
    }
}

/// Why the pull loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `max_tasks_per_run` tasks were executed.
    Completed,
    /// A stop signal unwound out of a handler.
    Stopped,
    /// A respawn signal unwound out of a handler.
    Respawn,
}

/// Process exit codes the supervisor dispatches on.
pub mod exit_code {
    pub const COMPLETED: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIG_LOAD: i32 = 2;
    pub const HANDLER_NOT_FOUND: i32 = 3;
    pub const RESPAWN: i32 = 4;
    pub const STOP: i32 = 5;
}

impl ExitReason {
    pub fn code(self) -> i32 {
        match self {
            ExitReason::Completed => exit_code::COMPLETED,
            ExitReason::Stopped => exit_code::STOP,
            ExitReason::Respawn => exit_code::RESPAWN,
        }
    }
}

enum Engine {
    Serial(SerialExecutor),
    Threaded(ThreadedExecutor),
}

impl Engine {
    async fn for_lifecycle(lifecycle: TaskLifecycle) -> Result<Self> {
        match lifecycle.ctx.config.executor {
            ExecutorConfig::Serial => Ok(Engine::Serial(SerialExecutor::new(lifecycle).await?)),
            ExecutorConfig::Threaded { threads } => {
                Ok(Engine::Threaded(ThreadedExecutor::new(lifecycle, threads)))
            }
        }
    }

    async fn execute_batch(&mut self, tasks: Vec<Task>) -> std::result::Result<(), WorkerInterrupt> {
        match self {
            Engine::Serial(executor) => executor.execute_batch(tasks).await,
            Engine::Threaded(executor) => executor.execute_batch(tasks).await,
        }
    }

    async fn shutdown(self) {
        match self {
            Engine::Serial(executor) => executor.shutdown().await,
            Engine::Threaded(executor) => executor.shutdown().await,
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    broker: Arc<Broker>,
    handler: Arc<dyn TaskHandler>,
}

impl Worker {
    /// Resolve the broker from configuration and build the worker.
    pub async fn new(config: WorkerConfig, handler: Arc<dyn TaskHandler>) -> Result<Self> {
        let broker = Arc::new(Broker::from_config(&config.connector, config.encoder).await?);
        Ok(Self::with_broker(config, broker, handler))
    }

    /// Build on an existing broker; the way to share an in-memory
    /// connector between a producer and the worker under test.
    pub fn with_broker(
        config: WorkerConfig,
        broker: Arc<Broker>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            config,
            broker,
            handler,
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Run until `max_tasks_per_run` tasks were executed (forever when it
    /// is zero) or a stop/respawn signal unwinds out of a handler.
    pub async fn run(&self) -> Result<ExitReason> {
        let ctx = Arc::new(WorkerContext::new(
            self.config.clone(),
            Arc::clone(&self.broker),
        ));
        let lifecycle = TaskLifecycle::new(Arc::clone(&self.handler), Arc::clone(&ctx));

        info!(
            queue = %self.config.name,
            backend = self.config.connector.backend_name(),
            "worker starting"
        );
        self.handler.initialize(&ctx).await;

        let mut engine = Engine::for_lifecycle(lifecycle.clone()).await?;
        let reason = self.pull_loop(&lifecycle, &mut engine).await;
        engine.shutdown().await;

        self.handler.finalize(&ctx).await;
        info!(queue = %self.config.name, reason = ?reason, "worker exiting");
        Ok(reason)
    }

    async fn pull_loop(&self, lifecycle: &TaskLifecycle, engine: &mut Engine) -> ExitReason {
        let mut remaining: Option<u64> =
            (self.config.max_tasks_per_run > 0).then_some(self.config.max_tasks_per_run);
        let mut idle_since: Option<Instant> = None;
        let mut starvation_fired = false;

        loop {
            if remaining == Some(0) {
                return ExitReason::Completed;
            }

            let batch_size = remaining
                .map_or(self.config.tasks_per_transaction as u64, |left| {
                    left.min(self.config.tasks_per_transaction as u64)
                }) as usize;

            let tasks = match self.broker.get_tasks(&self.config.name, batch_size).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    // Pull-side backend trouble is survivable; back off and
                    // try again.
                    error!(queue = %self.config.name, "failed to pull tasks: {}", err);
                    tokio::time::sleep(self.config.idle_interval).await;
                    continue;
                }
            };

            if tasks.is_empty() {
                let since = *idle_since.get_or_insert_with(Instant::now);

                if !self.config.starvation_timeout.is_zero()
                    && !starvation_fired
                    && since.elapsed() >= self.config.starvation_timeout
                {
                    starvation_fired = true;
                    if let Err(interrupt) = lifecycle.dispatch_starvation(since.elapsed()).await {
                        return match interrupt {
                            WorkerInterrupt::Stop => ExitReason::Stopped,
                            WorkerInterrupt::Respawn => ExitReason::Respawn,
                        };
                    }
                }

                tokio::time::sleep(self.config.idle_interval).await;
                continue;
            }

            idle_since = None;
            starvation_fired = false;
            let pulled = tasks.len() as u64;
            debug!(queue = %self.config.name, count = pulled, "pulled a batch");

            if let Err(interrupt) = engine.execute_batch(tasks).await {
                return match interrupt {
                    WorkerInterrupt::Stop => ExitReason::Stopped,
                    WorkerInterrupt::Respawn => ExitReason::Respawn,
                };
            }

            if let Some(left) = &mut remaining {
                *left = left.saturating_sub(pulled);
            }
        }
    }
}

/// Best-effort end-of-run report, written as one JSON line on stdout for
/// the supervisor to pick up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn emit(&self) {
        if let Ok(line) = serde_json::to_string(self) {
            println!("{}", line);
        }
    }
}

/// Maps worker names to handlers for [`bootstrap`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &str, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Worker-process entrypoint: load the config, resolve the handler, run,
/// report, exit. Never returns; the exit code is the supervisor contract
/// (see [`exit_code`]).
pub async fn bootstrap(config_path: &Path, registry: &HandlerRegistry) -> ! {
    let started_at = Utc::now();

    let config = match WorkerConfig::from_toml_file(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "failed to load worker config {}: {}",
                config_path.display(),
                err
            );
            std::process::exit(exit_code::CONFIG_LOAD);
        }
    };

    config.logging.init();

    let Some(handler) = registry.get(&config.name) else {
        error!("no handler registered for worker {:?}", config.name);
        std::process::exit(exit_code::HANDLER_NOT_FOUND);
    };

    let worker_name = config.name.clone();
    let (code, run_error) = match Worker::new(config, handler).await {
        Ok(worker) => match worker.run().await {
            Ok(reason) => (reason.code(), None),
            Err(err) => (exit_code::FAILURE, Some(err.to_string())),
        },
        Err(err) => (exit_code::FAILURE, Some(err.to_string())),
    };

    RunSummary {
        worker: worker_name,
        started_at,
        finished_at: Utc::now(),
        exit_code: code,
        error: run_error,
    }
    .emit();

    std::process::exit(code);
}
