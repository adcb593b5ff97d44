//! In-process watchdog for the threaded executor.
//!
//! One watchdog task monitors a table of pool slots, each with its own
//! timeout, elapsed counter and the abort handle of the tokio task
//! currently running on that slot. On timeout the slot's task, and only
//! that task, is aborted, unwinding it at its next await point. The
//! countdown can be suspended between tasks (elapsed time is kept) and
//! reset at the start of a new one.
//!
//! Cancellation caveat: aborting takes effect at an await point. A task
//! spinning in blocking code without awaiting cannot be cancelled from
//! inside the process; the process watchdog and supervisor respawn are
//! the backstop for that case.
//!
//! The table lock is never held while sleeping, and expired abort handles
//! are fired after the lock is released.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    timeout: Duration,
    elapsed: Duration,
    suspended: bool,
    abort: Option<AbortHandle>,
}

/// Watchdog over the threaded executor's pool slots.
pub struct TaskKiller {
    entries: Arc<Mutex<HashMap<usize, Entry>>>,
    watchdog: tokio::task::JoinHandle<()>,
}

impl TaskKiller {
    /// Start the watchdog loop with the given tick interval.
    pub fn spawn(tick_interval: Duration) -> Self {
        let entries: Arc<Mutex<HashMap<usize, Entry>>> = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&entries);

        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick_interval).await;

                let expired: Vec<(usize, AbortHandle)> = {
                    let mut table = table.lock().unwrap();
                    let mut fired = Vec::new();
                    for (slot, entry) in table.iter_mut() {
                        if entry.suspended || entry.abort.is_none() {
                            continue;
                        }
                        entry.elapsed += tick_interval;
                        if entry.elapsed >= entry.timeout {
                            // Latched by taking the handle; the slot stays
                            // registered for its next task.
                            if let Some(handle) = entry.abort.take() {
                                fired.push((*slot, handle));
                            }
                        }
                    }
                    fired
                };

                for (slot, handle) in expired {
                    debug!("task on slot {} exceeded its timeout, aborting", slot);
                    handle.abort();
                }
            }
        });

        Self { entries, watchdog }
    }

    /// Register the task now running on `slot`: fresh countdown, fresh
    /// abort target, countdown running.
    pub fn arm(&self, slot: usize, timeout: Duration, abort: AbortHandle) {
        let mut table = self.entries.lock().unwrap();
        table.insert(
            slot,
            Entry {
                timeout,
                elapsed: Duration::ZERO,
                suspended: false,
                abort: Some(abort),
            },
        );
    }

    /// Pause the countdown without losing elapsed time.
    pub fn suspend(&self, slot: usize) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&slot) {
            entry.suspended = true;
        }
    }

    /// Continue a paused countdown from where it stopped.
    pub fn resume(&self, slot: usize) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&slot) {
            entry.suspended = false;
        }
    }

    /// Zero the elapsed counter.
    pub fn reset(&self, slot: usize) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&slot) {
            entry.elapsed = Duration::ZERO;
        }
    }

    pub fn remove(&self, slot: usize) {
        self.entries.lock().unwrap().remove(&slot);
    }

    /// Drop every slot entry; used at batch end.
    pub fn remove_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn tracked_slots(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Drop for TaskKiller {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parked_task() -> tokio::task::JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    #[tokio::test]
    async fn test_timed_out_task_is_aborted() {
        let killer = TaskKiller::spawn(Duration::from_millis(5));
        let handle = parked_task().await;

        killer.arm(0, Duration::from_millis(40), handle.abort_handle());

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        let join_err = result.expect("task should be aborted").unwrap_err();
        assert!(join_err.is_cancelled());
    }

    #[tokio::test]
    async fn test_only_the_expired_slot_is_aborted() {
        let killer = TaskKiller::spawn(Duration::from_millis(5));
        let fast = parked_task().await;
        let slow = parked_task().await;

        killer.arm(0, Duration::from_millis(30), fast.abort_handle());
        killer.arm(1, Duration::from_secs(60), slow.abort_handle());

        let result = tokio::time::timeout(Duration::from_secs(2), fast).await;
        assert!(result.expect("fast slot should abort").unwrap_err().is_cancelled());
        assert!(!slow.is_finished());
        slow.abort();
    }

    #[tokio::test]
    async fn test_suspended_slot_does_not_fire() {
        let killer = TaskKiller::spawn(Duration::from_millis(5));
        let handle = parked_task().await;

        killer.arm(0, Duration::from_millis(30), handle.abort_handle());
        killer.suspend(0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!handle.is_finished());

        // Elapsed time was kept; resuming runs the remainder down.
        killer.resume(0);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.expect("resumed slot should abort").unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_reset_restarts_the_countdown() {
        let killer = TaskKiller::spawn(Duration::from_millis(5));
        let handle = parked_task().await;

        killer.arm(0, Duration::from_millis(200), handle.abort_handle());

        tokio::time::sleep(Duration::from_millis(120)).await;
        killer.reset(0);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // 240ms of wall time, but never 200ms since the last reset.
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_remove_all_clears_the_table() {
        let killer = TaskKiller::spawn(Duration::from_millis(5));
        let handle = parked_task().await;

        killer.arm(0, Duration::from_secs(60), handle.abort_handle());
        killer.arm(1, Duration::from_secs(60), handle.abort_handle());
        assert_eq!(killer.tracked_slots(), 2);

        killer.remove_all();
        assert_eq!(killer.tracked_slots(), 0);
        handle.abort();
    }
}
