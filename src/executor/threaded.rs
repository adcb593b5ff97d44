//! Threaded executor: a bounded pool of concurrent tasks.
//!
//! Tasks run as tokio tasks across `threads` pool slots. Admission is
//! bounded: once `threads` tasks are in flight, submission waits for at
//! least one completion before handing out the freed slot. Each slot has
//! one task-killer entry, created on the slot's first task and reused
//! (reset + resume) for every task that follows; the entry is suspended
//! between tasks so an idle slot cannot time out. At batch end all
//! entries are removed.
//!
//! Only the soft timeout applies here; the hard and critical stages
//! belong to the process-level watchdog, which makes no sense against a
//! single in-process task.

use crate::{
    config::TimeoutConfig,
    executor::{TaskLifecycle, TimeoutKind, WorkerInterrupt, join_outcome},
    killer::TaskKiller,
    task::Task,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tracing::warn;

pub struct ThreadedExecutor {
    lifecycle: TaskLifecycle,
    threads: usize,
    soft_timeout: Option<Duration>,
    killer: Arc<TaskKiller>,
}

impl ThreadedExecutor {
    pub(crate) fn new(lifecycle: TaskLifecycle, threads: usize) -> Self {
        let timeouts: &TimeoutConfig = &lifecycle.ctx.config.timeouts;
        let soft_timeout =
            (timeouts.soft_timeout > 0.0).then(|| Duration::from_secs_f64(timeouts.soft_timeout));
        let killer = Arc::new(TaskKiller::spawn(Duration::from_secs_f64(
            timeouts.tick_interval.max(0.01),
        )));

        Self {
            lifecycle,
            threads: threads.max(1),
            soft_timeout,
            killer,
        }
    }

    pub(crate) async fn execute_batch(&mut self, tasks: Vec<Task>) -> Result<(), WorkerInterrupt> {
        let mut in_flight: JoinSet<(usize, Result<(), WorkerInterrupt>)> = JoinSet::new();
        let mut free_slots: Vec<usize> = (0..self.threads).rev().collect();
        let mut interrupt: Option<WorkerInterrupt> = None;

        'submit: for task in tasks {
            // Bounded admission: block until a slot frees up.
            let slot = loop {
                if let Some(slot) = free_slots.pop() {
                    break slot;
                }
                match in_flight.join_next().await {
                    Some(Ok((slot, Ok(())))) => free_slots.push(slot),
                    Some(Ok((_, Err(batch_interrupt)))) => {
                        interrupt = Some(batch_interrupt);
                        break 'submit;
                    }
                    Some(Err(join_err)) => {
                        warn!("task orchestration panicked: {}", join_err);
                    }
                    None => break 'submit,
                }
            };

            let lifecycle = self.lifecycle.clone();
            let killer = Arc::clone(&self.killer);
            let soft_timeout = self.soft_timeout;
            in_flight.spawn(async move {
                let result = run_one(lifecycle, killer, slot, soft_timeout, task).await;
                (slot, result)
            });
        }

        // Let everything already admitted finish.
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((_, Err(batch_interrupt))) => {
                    interrupt.get_or_insert(batch_interrupt);
                }
                Ok((_, Ok(()))) => {}
                Err(join_err) => warn!("task orchestration panicked: {}", join_err),
            }
        }

        self.killer.remove_all();

        match interrupt {
            Some(interrupt) => Err(interrupt),
            None => Ok(()),
        }
    }

    pub(crate) async fn shutdown(self) {
        self.killer.remove_all();
    }
}

async fn run_one(
    lifecycle: TaskLifecycle,
    killer: Arc<TaskKiller>,
    slot: usize,
    soft_timeout: Option<Duration>,
    task: Task,
) -> Result<(), WorkerInterrupt> {
    lifecycle.pre_work(&task).await;

    let handler = Arc::clone(&lifecycle.handler);
    let ctx = Arc::clone(&lifecycle.ctx);
    let work_task = task.clone();
    let join = tokio::spawn(async move { handler.work(&ctx, &work_task).await });

    if let Some(timeout) = soft_timeout {
        killer.arm(slot, timeout, join.abort_handle());
    }

    let joined = join.await;
    killer.suspend(slot);

    let outcome = join_outcome(joined, TimeoutKind::Soft);

    lifecycle.post_work(&task).await;

    match outcome {
        Ok(outcome) => lifecycle.dispatch(&task, outcome).await,
        Err(interrupt) => Err(interrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::Broker,
        config::{TimeoutConfig, WorkerConfig},
        connector::memory::MemoryConnector,
        encoder::Encoder,
        worker::{TaskHandler, WorkError, WorkResult, WorkerContext},
    };
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct GaugedHandler {
        running: AtomicU32,
        peak: AtomicU32,
        completed: AtomicU32,
        timed_out: AtomicU32,
    }

    impl GaugedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicU32::new(0),
                peak: AtomicU32::new(0),
                completed: AtomicU32::new(0),
                timed_out: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for GaugedHandler {
        async fn work(&self, _ctx: &WorkerContext, task: &Task) -> WorkResult {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);

            let sleep_ms = task
                .kwargs
                .get("sleep_ms")
                .and_then(Value::as_u64)
                .unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }

        async fn on_success(
            &self,
            _ctx: &WorkerContext,
            _task: &Task,
            _value: &Value,
        ) -> std::result::Result<(), WorkError> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_timeout(
            &self,
            _ctx: &WorkerContext,
            _task: &Task,
            _kind: TimeoutKind,
        ) -> std::result::Result<(), WorkError> {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lifecycle_with(handler: Arc<dyn TaskHandler>, timeouts: TimeoutConfig) -> TaskLifecycle {
        let config = WorkerConfig::new("threaded_test").with_timeouts(timeouts);
        let broker = Arc::new(Broker::new(
            Arc::new(MemoryConnector::new()),
            Encoder::default(),
        ));
        TaskLifecycle::new(handler, Arc::new(WorkerContext::new(config, broker)))
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_pool_size() {
        let handler = GaugedHandler::new();
        let mut executor =
            ThreadedExecutor::new(lifecycle_with(handler.clone(), TimeoutConfig::default()), 3);

        let tasks: Vec<Task> = (0..12)
            .map(|_| Task::default().with_kwarg("sleep_ms", json!(20)))
            .collect();
        executor.execute_batch(tasks).await.unwrap();

        assert_eq!(handler.completed.load(Ordering::SeqCst), 12);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert!(handler.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_soft_timeout_fires_exactly_once_per_stuck_task() {
        let handler = GaugedHandler::new();
        let timeouts = TimeoutConfig {
            soft_timeout: 0.05,
            tick_interval: 0.01,
            ..Default::default()
        };
        let mut executor = ThreadedExecutor::new(lifecycle_with(handler.clone(), timeouts), 2);

        // Sleeps far past the soft timeout; must be cancelled.
        let tasks = vec![Task::default().with_kwarg("sleep_ms", json!(2_000))];
        let started = std::time::Instant::now();
        executor.execute_batch(tasks).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handler.timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slots_are_reused_across_tasks() {
        let handler = GaugedHandler::new();
        let timeouts = TimeoutConfig {
            soft_timeout: 10.0,
            tick_interval: 0.01,
            ..Default::default()
        };
        let mut executor = ThreadedExecutor::new(lifecycle_with(handler.clone(), timeouts), 2);

        let tasks: Vec<Task> = (0..8).map(|_| Task::default()).collect();
        executor.execute_batch(tasks).await.unwrap();

        assert_eq!(handler.completed.load(Ordering::SeqCst), 8);
        // Batch end removes every killer entry.
        assert_eq!(executor.killer.tracked_slots(), 0);
    }

    struct RedirectingHandler {
        failures_seen: AtomicU32,
        retries_seen: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for RedirectingHandler {
        async fn work(&self, _ctx: &WorkerContext, _task: &Task) -> WorkResult {
            Err(WorkError::Failed("always fails".into()))
        }

        async fn on_failure(
            &self,
            ctx: &WorkerContext,
            task: &Task,
            _error: &WorkError,
        ) -> std::result::Result<(), WorkError> {
            self.failures_seen.fetch_add(1, Ordering::SeqCst);
            // Asking for a retry from inside the failure handler must
            // land in on_retry, not be swallowed.
            ctx.retry(task).await.map(|_| ())
        }

        async fn on_retry(
            &self,
            _ctx: &WorkerContext,
            _task: &Task,
        ) -> std::result::Result<(), WorkError> {
            self.retries_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_handler_can_redirect_to_retry() {
        let handler = Arc::new(RedirectingHandler {
            failures_seen: AtomicU32::new(0),
            retries_seen: AtomicU32::new(0),
        });
        let lifecycle = lifecycle_with(handler.clone(), TimeoutConfig::default());
        let broker = Arc::clone(&lifecycle.ctx.broker);
        let mut executor = ThreadedExecutor::new(lifecycle, 1);

        executor.execute_batch(vec![Task::default()]).await.unwrap();

        assert_eq!(handler.failures_seen.load(Ordering::SeqCst), 1);
        assert_eq!(handler.retries_seen.load(Ordering::SeqCst), 1);
        // The retry actually re-pushed the task.
        let requeued = broker.get_task("threaded_test").await.unwrap().unwrap();
        assert_eq!(requeued.run_count, 1);
    }
}
