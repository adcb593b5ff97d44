use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work flowing through the queue.
///
/// `date` is set at creation and never mutated afterwards. `run_count`
/// starts at zero and is incremented only by the retry path; requeueing a
/// task re-pushes it byte-for-byte unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub kwargs: serde_json::Map<String, Value>,
    pub date: DateTime<Utc>,
    pub run_count: u32,
}

impl Task {
    pub fn new(kwargs: serde_json::Map<String, Value>) -> Self {
        Self {
            kwargs,
            date: Utc::now(),
            run_count: 0,
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }

    /// The copy that goes back on the queue when a task is retried.
    pub(crate) fn retried(&self) -> Self {
        let mut task = self.clone();
        task.run_count += 1;
        task
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new(serde_json::Map::new())
    }
}
