//! Lifecycle event classification and per-event logging toggles.

use serde::{Deserialize, Serialize};

/// The lifecycle events a worker can dispatch for a pulled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Success,
    Failure,
    Timeout,
    Retry,
    MaxRetries,
    Requeue,
    Starvation,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Success => "success",
            EventKind::Failure => "failure",
            EventKind::Timeout => "timeout",
            EventKind::Retry => "retry",
            EventKind::MaxRetries => "max_retries",
            EventKind::Requeue => "requeue",
            EventKind::Starvation => "starvation",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which lifecycle events produce log lines. All enabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub success: bool,
    pub failure: bool,
    pub timeout: bool,
    pub retry: bool,
    pub max_retries: bool,
    pub requeue: bool,
    pub starvation: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            success: true,
            failure: true,
            timeout: true,
            retry: true,
            max_retries: true,
            requeue: true,
            starvation: true,
        }
    }
}

impl EventLogConfig {
    pub fn enabled(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Success => self.success,
            EventKind::Failure => self.failure,
            EventKind::Timeout => self.timeout,
            EventKind::Retry => self.retry,
            EventKind::MaxRetries => self.max_retries,
            EventKind::Requeue => self.requeue,
            EventKind::Starvation => self.starvation,
        }
    }

    /// Disable every event log line.
    pub fn silent() -> Self {
        Self {
            success: false,
            failure: false,
            timeout: false,
            retry: false,
            max_retries: false,
            requeue: false,
            starvation: false,
        }
    }
}
