//! Task prioritization and delayed visibility.
//!
//! Priority and scheduling share one ordering dimension: every queue entry
//! carries a floating-point *score*, and a pop only ever returns entries
//! whose score is less than or equal to the current Unix time. `High`
//! priority maps to the lowest score (consumed first), `Normal` to a higher
//! one, and a delayed task encodes its absolute visibility timestamp as the
//! score, so it stays invisible until that moment passes.
//!
//! ## Ordering
//!
//! Within a single backend node, entries pop in ascending score order, ties
//! broken by insertion order where the backend preserves it. Across sharded
//! nodes only per-node ordering holds.
//!
//! # Examples
//!
//! ```rust
//! use taskmill::Priority;
//! use std::str::FromStr;
//!
//! let priority = Priority::from_str("high").unwrap();
//! assert_eq!(priority, Priority::High);
//!
//! // High priority sorts ahead of normal.
//! assert!(Priority::High.base_score() < Priority::Normal.base_score());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Priority classes that determine consumption order within a queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Consumed before any normal-priority entry in the same queue.
    High,

    /// Default class for ordinary work.
    #[default]
    Normal,
}

impl Priority {
    /// The score assigned to an immediately-visible entry of this class.
    ///
    /// Both values are far below any Unix timestamp, so entries of either
    /// class are always visible; the gap between them is what orders the
    /// classes against each other.
    pub fn base_score(self) -> f64 {
        match self {
            Priority::High => 0.0,
            Priority::Normal => 1.0,
        }
    }

    /// All priority classes, highest first.
    pub fn all() -> [Priority; 2] {
        [Priority::High, Priority::Normal]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

impl FromStr for Priority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            _ => Err(PriorityError::InvalidPriority(s.to_string())),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PriorityError {
    #[error("Invalid priority: {0}. Valid priorities are: high, normal")]
    InvalidPriority(String),
}

/// Compute the visibility score for a queue entry.
///
/// When `consumable_from` is given it overrides the priority-derived
/// ordering entirely: the entry becomes visible only once the current time
/// reaches that instant.
pub fn score_for(priority: Priority, consumable_from: Option<DateTime<Utc>>) -> f64 {
    match consumable_from {
        Some(when) => when.timestamp_millis() as f64 / 1000.0,
        None => priority.base_score(),
    }
}

/// The score threshold below which an entry is currently visible.
pub fn visibility_horizon(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High.base_score() < Priority::Normal.base_score());
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!(Priority::from_str("high").unwrap(), Priority::High);
        assert_eq!(Priority::from_str("NORMAL").unwrap(), Priority::Normal);
        assert!(Priority::from_str("urgent").is_err());
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::High.to_string(), "high");
        assert_eq!(Priority::Normal.to_string(), "normal");
    }

    #[test]
    fn test_immediate_scores_are_always_visible() {
        let now = Utc::now();
        let horizon = visibility_horizon(now);

        assert!(score_for(Priority::High, None) <= horizon);
        assert!(score_for(Priority::Normal, None) <= horizon);
    }

    #[test]
    fn test_delayed_score_crosses_horizon_at_deadline() {
        let now = Utc::now();
        let later = now + Duration::seconds(30);
        let score = score_for(Priority::High, Some(later));

        // Invisible now, visible once the clock reaches the deadline.
        assert!(score > visibility_horizon(now));
        assert!(score <= visibility_horizon(later));
    }

    #[test]
    fn test_delay_overrides_priority_class() {
        let when = Utc::now() + Duration::seconds(5);
        assert_eq!(
            score_for(Priority::High, Some(when)),
            score_for(Priority::Normal, Some(when))
        );
    }
}
