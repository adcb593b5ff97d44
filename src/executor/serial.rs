//! Serial executor: one task at a time, watched from out of process.
//!
//! One watchdog process covers the whole run; `start` / `stop_and_reset`
//! bracket each task so the escalation clock only ticks while work is in
//! flight. The watchdog's soft and hard signals (SIGINT, SIGABRT) are
//! received as tokio signal streams and translated into timeout outcomes;
//! the critical stage is SIGKILL, which never reaches us; the supervisor
//! sees the death instead. Pending signals are drained between tasks so a
//! signal aimed at a previous task cannot leak into the next one.

use crate::{
    Result,
    executor::{Outcome, TaskLifecycle, TimeoutKind, WorkerInterrupt, join_outcome},
    killer::ProcessKiller,
    task::Task,
};
use std::sync::Arc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::warn;

struct TimeoutSignals {
    soft: Signal,
    hard: Signal,
}

impl TimeoutSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            soft: signal(SignalKind::interrupt())?,
            hard: signal(SignalKind::from_raw(nix::libc::SIGABRT))?,
        })
    }

    /// Discard signals that arrived while no task was running.
    async fn drain(&mut self) {
        std::future::poll_fn(|cx| {
            while let std::task::Poll::Ready(Some(_)) = self.soft.poll_recv(cx) {}
            while let std::task::Poll::Ready(Some(_)) = self.hard.poll_recv(cx) {}
            std::task::Poll::Ready(())
        })
        .await;
    }
}

pub struct SerialExecutor {
    lifecycle: TaskLifecycle,
    killer: Option<ProcessKiller>,
    signals: Option<TimeoutSignals>,
}

impl SerialExecutor {
    pub(crate) async fn new(lifecycle: TaskLifecycle) -> Result<Self> {
        let timeouts = &lifecycle.ctx.config.timeouts;

        let (killer, signals) = if timeouts.disabled() {
            (None, None)
        } else {
            let killer = ProcessKiller::spawn(timeouts, std::process::id()).await?;
            (Some(killer), Some(TimeoutSignals::install()?))
        };

        Ok(Self {
            lifecycle,
            killer,
            signals,
        })
    }

    pub(crate) async fn execute_batch(
        &mut self,
        tasks: Vec<Task>,
    ) -> std::result::Result<(), WorkerInterrupt> {
        for task in tasks {
            self.lifecycle.pre_work(&task).await;

            if let Some(signals) = &mut self.signals {
                signals.drain().await;
            }
            if let Some(killer) = &self.killer {
                if let Err(err) = killer.start().await {
                    warn!("failed to start the watchdog clock: {}", err);
                }
            }

            let outcome = self.run_work(&task).await;

            if let Some(killer) = &self.killer {
                if let Err(err) = killer.stop_and_reset().await {
                    warn!("failed to reset the watchdog clock: {}", err);
                }
            }

            self.lifecycle.post_work(&task).await;

            match outcome {
                Ok(outcome) => self.lifecycle.dispatch(&task, outcome).await?,
                Err(interrupt) => return Err(interrupt),
            }
        }

        Ok(())
    }

    /// Run `work` as its own task so a panic becomes a failure outcome and
    /// a timeout can abort it mid-flight.
    async fn run_work(&mut self, task: &Task) -> std::result::Result<Outcome, WorkerInterrupt> {
        let handler = Arc::clone(&self.lifecycle.handler);
        let ctx = Arc::clone(&self.lifecycle.ctx);
        let task = task.clone();
        let mut join = tokio::spawn(async move { handler.work(&ctx, &task).await });

        match &mut self.signals {
            Some(signals) => {
                tokio::select! {
                    joined = &mut join => join_outcome(joined, TimeoutKind::Soft),
                    _ = signals.soft.recv() => {
                        join.abort();
                        Ok(Outcome::Timeout(TimeoutKind::Soft))
                    }
                    _ = signals.hard.recv() => {
                        join.abort();
                        Ok(Outcome::Timeout(TimeoutKind::Hard))
                    }
                }
            }
            None => join_outcome((&mut join).await, TimeoutKind::Soft),
        }
    }

    pub(crate) async fn shutdown(self) {
        if let Some(killer) = self.killer {
            if let Err(err) = killer.shutdown().await {
                warn!("failed to shut the watchdog down: {}", err);
            }
        }
    }
}
