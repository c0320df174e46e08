//! Retry/backoff policy for failing tasks.
//!
//! Every full cycle of failed attempts (3 by default) lowers a task's priority
//! by one level; a full cycle at the lowest level quarantines it as `blocked`.
//! The attempt count stored on the task is the only input; no wall-clock
//! counters are involved in the decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FailureKind;
use crate::store::{BlockKind, LOWEST_PRIORITY, Task, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Requeue at the given (unchanged) priority.
    Retry { priority: u8 },
    /// Requeue one level lower.
    Deprioritize { priority: u8 },
    /// Quarantine the task.
    Block,
}

/// Read from the `[backoff]` table of `taskforge.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub attempts_per_cycle: u32,
    /// Minimum idle time before a technical block is retried automatically.
    pub auto_retry_interval_secs: i64,
    pub max_auto_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts_per_cycle: 3,
            auto_retry_interval_secs: 2 * 60 * 60,
            max_auto_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Decide what happens after a failure, given the attempt count *after*
    /// this failure was recorded.
    pub fn decide(&self, attempts: u32, priority: u8, kind: FailureKind) -> BackoffDecision {
        let cycle = self.attempts_per_cycle.max(1);
        if !kind.counts_as_attempt() || attempts == 0 || attempts % cycle != 0 {
            return BackoffDecision::Retry { priority };
        }
        if priority < LOWEST_PRIORITY {
            BackoffDecision::Deprioritize {
                priority: priority + 1,
            }
        } else {
            BackoffDecision::Block
        }
    }

    pub fn auto_retry_interval(&self) -> Duration {
        Duration::seconds(self.auto_retry_interval_secs)
    }

    /// Whether a blocked task may be unblocked and retried automatically now.
    ///
    /// Only technical quarantines qualify. The idle clock starts at the later
    /// of the block time and the last automatic retry.
    pub fn auto_retry_due(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Blocked || task.block_kind != Some(BlockKind::Technical) {
            return false;
        }
        if task.extensions.auto_retries() >= self.max_auto_retries {
            return false;
        }
        let since = match (task.blocked_at, task.last_auto_retry_at) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => task.updated_at,
        };
        now - since >= self.auto_retry_interval()
    }
}
