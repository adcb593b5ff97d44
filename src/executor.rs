//! Execution engines: the per-task state machine and its two schedulers.
//!
//! Every pulled task moves through `pre_work -> working -> post_work` and
//! ends in exactly one lifecycle outcome. Control signals are ordinary
//! values here, not exceptions: [`Outcome`] is the closed set of terminal
//! states, and the executor pattern-matches on it to pick the callback to
//! fire. `Stop`/`Respawn` are not outcomes; they interrupt the whole
//! batch and surface as [`WorkerInterrupt`].

use crate::{
    events::EventKind,
    task::Task,
    worker::{TaskHandler, WorkError, WorkResult, WorkerContext},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod serial;
pub mod threaded;

pub use serial::SerialExecutor;
pub use threaded::ThreadedExecutor;

/// Which watchdog stage interrupted the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Soft,
    Hard,
}

/// Terminal state of one task execution.
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    Failure(WorkError),
    Timeout(TimeoutKind),
    Retry,
    MaxRetries,
    Requeue,
}

/// Batch-aborting control flow: a stop or respawn request propagates out
/// of the executor and worker loop instead of being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerInterrupt {
    Stop,
    Respawn,
}

/// Map what `work` returned onto an outcome, separating out the two
/// interrupt signals.
pub(crate) fn outcome_from(result: WorkResult) -> Result<Outcome, WorkerInterrupt> {
    match result {
        Ok(value) => Ok(Outcome::Success(value)),
        Err(WorkError::Retry) => Ok(Outcome::Retry),
        Err(WorkError::MaxRetries) => Ok(Outcome::MaxRetries),
        Err(WorkError::Requeue) => Ok(Outcome::Requeue),
        Err(WorkError::Stop) => Err(WorkerInterrupt::Stop),
        Err(WorkError::Respawn) => Err(WorkerInterrupt::Respawn),
        Err(failure) => Ok(Outcome::Failure(failure)),
    }
}

/// Map a spawned work task's join result onto an outcome.
pub(crate) fn join_outcome(
    joined: Result<WorkResult, tokio::task::JoinError>,
    timeout_kind: TimeoutKind,
) -> Result<Outcome, WorkerInterrupt> {
    match joined {
        Ok(result) => outcome_from(result),
        Err(err) if err.is_cancelled() => Ok(Outcome::Timeout(timeout_kind)),
        Err(err) => Ok(Outcome::Failure(WorkError::Failed(format!(
            "task panicked: {}",
            err
        )))),
    }
}

enum AfterCallback {
    Done,
    Redirect(Outcome),
    Interrupt(WorkerInterrupt),
}

/// The handler, context and event toggles one executor drives tasks
/// through. Cloning is cheap; both halves are shared.
#[derive(Clone)]
pub(crate) struct TaskLifecycle {
    pub handler: Arc<dyn TaskHandler>,
    pub ctx: Arc<WorkerContext>,
}

impl TaskLifecycle {
    pub fn new(handler: Arc<dyn TaskHandler>, ctx: Arc<WorkerContext>) -> Self {
        Self { handler, ctx }
    }

    fn event_enabled(&self, kind: EventKind) -> bool {
        self.ctx.config.logging.events.enabled(kind)
    }

    /// Hook errors are logged, never fatal.
    pub async fn pre_work(&self, task: &Task) {
        if let Err(err) = self.handler.pre_work(&self.ctx, task).await {
            warn!("pre_work hook failed: {}", err);
        }
    }

    pub async fn post_work(&self, task: &Task) {
        if let Err(err) = self.handler.post_work(&self.ctx, task).await {
            warn!("post_work hook failed: {}", err);
        }
    }

    /// Route an outcome to its lifecycle callback.
    ///
    /// A retry/max-retries/requeue signal coming back out of `on_failure`
    /// or `on_timeout` is re-dispatched to the matching handler; the loop
    /// is that explicit redirection. Any other callback error is logged
    /// and swallowed, except stop/respawn, which interrupt the batch from
    /// anywhere.
    pub async fn dispatch(&self, task: &Task, outcome: Outcome) -> Result<(), WorkerInterrupt> {
        let mut outcome = outcome;

        loop {
            let after = match outcome {
                Outcome::Success(value) => {
                    if self.event_enabled(EventKind::Success) {
                        debug!(queue = %self.ctx.config.name, "task succeeded");
                    }
                    self.absorb(
                        EventKind::Success,
                        self.handler.on_success(&self.ctx, task, &value).await,
                    )
                }
                Outcome::Retry => {
                    if self.event_enabled(EventKind::Retry) {
                        info!(
                            queue = %self.ctx.config.name,
                            run_count = task.run_count,
                            "task pushed back for retry"
                        );
                    }
                    self.absorb(
                        EventKind::Retry,
                        self.handler.on_retry(&self.ctx, task).await,
                    )
                }
                Outcome::MaxRetries => {
                    if self.event_enabled(EventKind::MaxRetries) {
                        warn!(
                            queue = %self.ctx.config.name,
                            run_count = task.run_count,
                            "task exhausted its retries"
                        );
                    }
                    self.absorb(
                        EventKind::MaxRetries,
                        self.handler.on_max_retries(&self.ctx, task).await,
                    )
                }
                Outcome::Requeue => {
                    if self.event_enabled(EventKind::Requeue) {
                        info!(queue = %self.ctx.config.name, "task requeued unchanged");
                    }
                    self.absorb(
                        EventKind::Requeue,
                        self.handler.on_requeue(&self.ctx, task).await,
                    )
                }
                Outcome::Failure(error) => {
                    if self.event_enabled(EventKind::Failure) {
                        error!(queue = %self.ctx.config.name, "task failed: {}", error);
                    }
                    self.redirectable(
                        EventKind::Failure,
                        self.handler.on_failure(&self.ctx, task, &error).await,
                    )
                }
                Outcome::Timeout(kind) => {
                    if self.event_enabled(EventKind::Timeout) {
                        warn!(queue = %self.ctx.config.name, "task timed out ({:?})", kind);
                    }
                    self.redirectable(
                        EventKind::Timeout,
                        self.handler.on_timeout(&self.ctx, task, kind).await,
                    )
                }
            };

            match after {
                AfterCallback::Done => return Ok(()),
                AfterCallback::Interrupt(interrupt) => return Err(interrupt),
                AfterCallback::Redirect(next) => outcome = next,
            }
        }
    }

    /// Terminal events: swallow and log everything but an interrupt.
    fn absorb(&self, kind: EventKind, result: Result<(), WorkError>) -> AfterCallback {
        match result {
            Ok(()) => AfterCallback::Done,
            Err(WorkError::Stop) => AfterCallback::Interrupt(WorkerInterrupt::Stop),
            Err(WorkError::Respawn) => AfterCallback::Interrupt(WorkerInterrupt::Respawn),
            Err(err) => {
                warn!("on_{} callback failed: {}", kind, err);
                AfterCallback::Done
            }
        }
    }

    /// Failure/timeout events additionally honor retry-class signals from
    /// the callback by re-dispatching to the matching handler.
    fn redirectable(&self, kind: EventKind, result: Result<(), WorkError>) -> AfterCallback {
        match result {
            Err(WorkError::Retry) => AfterCallback::Redirect(Outcome::Retry),
            Err(WorkError::MaxRetries) => AfterCallback::Redirect(Outcome::MaxRetries),
            Err(WorkError::Requeue) => AfterCallback::Redirect(Outcome::Requeue),
            other => self.absorb(kind, other),
        }
    }

    /// Starvation is dispatched from the pull loop rather than per task.
    pub async fn dispatch_starvation(
        &self,
        idle: std::time::Duration,
    ) -> Result<(), WorkerInterrupt> {
        if self.event_enabled(EventKind::Starvation) {
            warn!(
                queue = %self.ctx.config.name,
                idle_secs = idle.as_secs(),
                "worker is starving, no tasks pulled"
            );
        }
        match self.absorb(
            EventKind::Starvation,
            self.handler.on_starvation(&self.ctx, idle).await,
        ) {
            AfterCallback::Interrupt(interrupt) => Err(interrupt),
            _ => Ok(()),
        }
    }
}
