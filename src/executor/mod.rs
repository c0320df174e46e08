//! Phase Executor: drives one task through its coding and review phases.
//!
//! Each phase prepares a workspace, writes the agent's input artifact,
//! records an assignment and hands off to the [`AgentRunner`]. Results are
//! reported to a [`PhaseHost`]; the executor itself never applies backoff or
//! merges.
//!
//! [`AgentRunner`]: crate::agent::AgentRunner

mod phases;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::FailureKind;
use crate::store::Task;
use crate::workspace::Workspace;

pub use phases::{AgentCommands, ExecutorDeps, PhaseExecutor};

/// Slot name used when a task carries no assignee.
pub const DEFAULT_SLOT: &str = "slot-0";

/// What a retried coding phase knows about the previous attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryContext {
    pub previous_failure: Option<String>,
    pub review_feedback: Option<String>,
    pub test_output: Option<String>,
    pub prior_diff: Option<String>,
    /// Reuse the task's branch, rebased onto the trunk first.
    pub use_existing_branch: bool,
}

impl RetryContext {
    /// Context recoverable from the task record alone. `None` for a task that
    /// has never failed and has no branch to return to.
    pub fn from_task(task: &Task) -> Option<Self> {
        let failure = task.extensions.last_failure();
        let branch = task.extensions.branch();
        if failure.is_none() && branch.is_none() {
            return None;
        }
        let test_output = failure
            .as_ref()
            .filter(|f| f.kind == FailureKind::TestFailure)
            .map(|f| f.reason.clone());
        Some(Self {
            previous_failure: failure.map(|f| format!("{}: {}", f.kind, f.reason)),
            review_feedback: task.extensions.review_feedback(),
            test_output,
            prior_diff: None,
            use_existing_branch: branch.is_some(),
        })
    }
}

/// Admission check run before a phase touches the filesystem.
#[async_trait]
pub trait CapacityGate: Send + Sync {
    async fn has_capacity(&self, project_id: &str) -> bool;
}

/// Gate that always admits.
pub struct Unlimited;

#[async_trait]
impl CapacityGate for Unlimited {
    async fn has_capacity(&self, _project_id: &str) -> bool {
        true
    }
}

/// Receives phase outcomes.
#[async_trait]
pub trait PhaseHost: Send + Sync {
    async fn on_coding_complete(&self, task: Task, workspace: Workspace);

    async fn on_review_complete(&self, task: Task, workspace: Workspace);

    /// `workspace` is set when the failure happened after it was created.
    async fn on_failure(
        &self,
        task: Task,
        workspace: Option<Workspace>,
        kind: FailureKind,
        reason: String,
    );

    /// No phase was started and nothing was changed.
    async fn on_capacity_exhausted(&self, task: Task);
}

/// A phase outcome, as delivered by [`ChannelHost`].
#[derive(Debug)]
pub enum PhaseEvent {
    CodingComplete {
        task: Task,
        workspace: Workspace,
    },
    ReviewComplete {
        task: Task,
        workspace: Workspace,
    },
    Failed {
        task: Task,
        workspace: Option<Workspace>,
        kind: FailureKind,
        reason: String,
    },
    CapacityExhausted {
        task: Task,
    },
}

/// Host that forwards every outcome to a channel, so the consumer can act
/// on it from its own loop.
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<PhaseEvent>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PhaseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PhaseEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("phase event dropped; receiver gone");
        }
    }
}

#[async_trait]
impl PhaseHost for ChannelHost {
    async fn on_coding_complete(&self, task: Task, workspace: Workspace) {
        self.send(PhaseEvent::CodingComplete { task, workspace });
    }

    async fn on_review_complete(&self, task: Task, workspace: Workspace) {
        self.send(PhaseEvent::ReviewComplete { task, workspace });
    }

    async fn on_failure(
        &self,
        task: Task,
        workspace: Option<Workspace>,
        kind: FailureKind,
        reason: String,
    ) {
        self.send(PhaseEvent::Failed {
            task,
            workspace,
            kind,
            reason,
        });
    }

    async fn on_capacity_exhausted(&self, task: Task) {
        self.send(PhaseEvent::CapacityExhausted { task });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailureRecord, NewTask, TaskStore};
    use chrono::Utc;

    #[tokio::test]
    async fn test_retry_context_from_fresh_task_is_none() {
        let store = TaskStore::in_memory("p").unwrap();
        let task = store.create(NewTask::new("fresh")).await.unwrap();
        assert!(RetryContext::from_task(&task).is_none());
    }

    #[tokio::test]
    async fn test_retry_context_carries_failure_and_branch() {
        let store = TaskStore::in_memory("p").unwrap();
        let mut task = store.create(NewTask::new("flaky")).await.unwrap();
        task.extensions.set_last_failure(&FailureRecord {
            kind: FailureKind::TestFailure,
            reason: "3 tests failed".into(),
            at: Utc::now(),
        });
        task.extensions.set_review_feedback("split the function");
        task.extensions.set_branch(Some("taskforge/x"));

        let ctx = RetryContext::from_task(&task).unwrap();
        assert_eq!(ctx.previous_failure.as_deref(), Some("test_failure: 3 tests failed"));
        assert_eq!(ctx.test_output.as_deref(), Some("3 tests failed"));
        assert_eq!(ctx.review_feedback.as_deref(), Some("split the function"));
        assert!(ctx.use_existing_branch);
    }

    #[tokio::test]
    async fn test_unlimited_gate_admits() {
        assert!(Unlimited.has_capacity("any").await);
    }
}
