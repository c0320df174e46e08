//! Typed error hierarchy for taskforge.
//!
//! One enum per subsystem:
//! - `StoreError`: task store lookups, transitions and persistence
//! - `WorkspaceError`: git worktree / rebase / merge plumbing
//! - `AgentError`: agent process spawning and result artifacts
//!
//! `FailureKind` is not an error type: it classifies why a task attempt failed so the
//! backoff policy can decide what happens next.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::TaskStatus;

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {id} not found in project {project_id}")]
    NotFound { project_id: String, id: String },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} cannot depend on itself")]
    SelfDependency { id: String },

    #[error("Adding {id} -> {depends_on} would create a dependency cycle")]
    DependencyCycle { id: String, depends_on: String },

    #[error("Task {id} is still referenced by {}", referenced_by.join(", "))]
    StillReferenced {
        id: String,
        referenced_by: Vec<String>,
    },

    #[error("Invalid task data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl StoreError {
    pub fn not_found(project_id: &str, id: &str) -> Self {
        Self::NotFound {
            project_id: project_id.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.into())
    }
}

/// Errors from workspace (git) operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Rebase or merge stopped on conflicting paths.
    #[error("Conflict in {} file(s): {}", files.len(), files.join(", "))]
    Conflict { files: Vec<String> },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Repository error: {0}")]
    Repo(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkspaceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors from agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write agent artifact at {path}: {source}")]
    ArtifactWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent produced an invalid result: {0}")]
    InvalidResult(String),

    #[error("Agent did not finish successfully: {0}")]
    Unsuccessful(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a task attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AgentCrash,
    AgentTimeout,
    TestFailure,
    ReviewRejected,
    ConflictDuringRebase,
    CapacityExhausted,
}

impl FailureKind {
    /// Whether this failure increments the task's attempt counter.
    pub fn counts_as_attempt(self) -> bool {
        matches!(
            self,
            Self::AgentCrash | Self::AgentTimeout | Self::TestFailure | Self::ReviewRejected
        )
    }

    /// Technical failures may be retried automatically after quarantine.
    pub fn is_technical(self) -> bool {
        matches!(self, Self::AgentCrash | Self::AgentTimeout | Self::TestFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentCrash => "agent_crash",
            Self::AgentTimeout => "agent_timeout",
            Self::TestFailure => "test_failure",
            Self::ReviewRejected => "review_rejected",
            Self::ConflictDuringRebase => "conflict_during_rebase",
            Self::CapacityExhausted => "capacity_exhausted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
