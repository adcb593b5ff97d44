//! Timeout watchdogs.
//!
//! Two killers cover the two execution modes. The process killer is a
//! separate OS process that escalates through soft/hard/critical signals
//! against the worker pid; being out of process, it can still deliver
//! signals when the worker's own runtime is wedged. The task killer is an
//! in-process watchdog that cancels one specific in-flight task without
//! touching the rest of the pool.

pub mod process;
pub mod task;

pub use process::{Escalation, ProcessKiller, WatchdogOptions, WatchdogState, run_watchdog};
pub use task::TaskKiller;
