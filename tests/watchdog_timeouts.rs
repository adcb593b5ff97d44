//! End-to-end timeout scenarios against the real watchdog process.
//!
//! These spawn the `taskmill-watchdog` binary that cargo builds alongside
//! the tests, so they exercise the actual UDP control channel, the port
//! hand-off and real signal delivery.

#![cfg(unix)]

use async_trait::async_trait;
use serde_json::Value;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};
use taskmill::{
    Broker, Encoder, ExitReason, Priority, Task, TimeoutConfig, TimeoutKind, Worker, WorkerConfig,
    connector::memory::MemoryConnector,
    killer::ProcessKiller,
    worker::{TaskHandler, WorkError, WorkResult, WorkerContext},
};

fn watchdog_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_taskmill-watchdog"))
}

struct SleepyHandler {
    succeeded: AtomicU32,
    failed: AtomicU32,
    timed_out: AtomicU32,
}

#[async_trait]
impl TaskHandler for SleepyHandler {
    async fn work(&self, _ctx: &WorkerContext, _task: &Task) -> WorkResult {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(Value::Null)
    }

    async fn on_success(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
        _value: &Value,
    ) -> Result<(), WorkError> {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_failure(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
        _error: &WorkError,
    ) -> Result<(), WorkError> {
        self.failed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_timeout(
        &self,
        _ctx: &WorkerContext,
        _task: &Task,
        _kind: TimeoutKind,
    ) -> Result<(), WorkError> {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn serial_soft_timeout_fires_exactly_one_timeout_callback() {
    let broker = Arc::new(Broker::new(
        Arc::new(MemoryConnector::new()),
        Encoder::default(),
    ));
    broker
        .push_task("sleepy", &Task::default(), Priority::Normal, None)
        .await
        .unwrap();

    let handler = Arc::new(SleepyHandler {
        succeeded: AtomicU32::new(0),
        failed: AtomicU32::new(0),
        timed_out: AtomicU32::new(0),
    });

    // The task sleeps 2s; the soft stage fires at 0.4s. The critical
    // stage stays disabled so the test process cannot be SIGKILLed.
    let config = WorkerConfig::new("sleepy")
        .with_max_tasks_per_run(1)
        .with_idle_interval(Duration::from_millis(10))
        .with_timeouts(TimeoutConfig {
            soft_timeout: 0.4,
            hard_timeout: 3.0,
            critical_timeout: 0.0,
            tick_interval: 0.05,
            watchdog_program: Some(watchdog_program()),
        });

    let worker = Worker::with_broker(config, broker, handler.clone());
    let reason = tokio::time::timeout(Duration::from_secs(15), worker.run())
        .await
        .expect("worker should finish")
        .unwrap();

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(handler.timed_out.load(Ordering::SeqCst), 1);
    assert_eq!(handler.succeeded.load(Ordering::SeqCst), 0);
    assert_eq!(handler.failed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn watchdog_escalates_to_hard_when_soft_is_ignored() {
    // A monitored process that shrugs off the soft SIGINT.
    let mut stubborn = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("trap '' INT; sleep 30")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let pid = stubborn.id().expect("child should have a pid");

    let config = TimeoutConfig {
        soft_timeout: 0.3,
        hard_timeout: 0.8,
        critical_timeout: 5.0,
        tick_interval: 0.05,
        watchdog_program: Some(watchdog_program()),
    };

    let killer = ProcessKiller::spawn(&config, pid).await.unwrap();
    killer.start().await.unwrap();
    let started = Instant::now();

    let status = tokio::time::timeout(Duration::from_secs(10), stubborn.wait())
        .await
        .expect("the hard stage should terminate the child")
        .unwrap();
    let elapsed = started.elapsed();

    // Survived the soft stage, died to the hard one.
    assert!(!status.success());
    assert!(status.code().is_none(), "expected a signal death, got {:?}", status);
    assert!(elapsed >= Duration::from_millis(500), "died too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "died too late: {:?}", elapsed);

    killer.shutdown().await.unwrap();
}

#[tokio::test]
async fn watchdog_start_stop_controls_the_clock() {
    let mut parked = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("trap '' INT; sleep 30")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let pid = parked.id().expect("child should have a pid");

    let config = TimeoutConfig {
        soft_timeout: 0.0,
        hard_timeout: 0.3,
        critical_timeout: 0.0,
        tick_interval: 0.05,
        watchdog_program: Some(watchdog_program()),
    };

    let killer = ProcessKiller::spawn(&config, pid).await.unwrap();

    // Never started: the clock must not run.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(parked.try_wait().unwrap().is_none());

    // stop_and_reset before the threshold keeps the child alive.
    killer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    killer.stop_and_reset().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(parked.try_wait().unwrap().is_none());

    // Left running, the threshold is crossed.
    killer.start().await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), parked.wait())
        .await
        .expect("the hard stage should terminate the child")
        .unwrap();
    assert!(!status.success());

    killer.shutdown().await.unwrap();
}
