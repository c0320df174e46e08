//! Isolated per-task workspaces and trunk plumbing.
//!
//! A workspace is a checkout of a task branch that exactly one task owns for
//! its lifetime. Everything that mutates the trunk (`sync_trunk_from_upstream`,
//! `merge_branch`, `delete_branch`) must be called from the commit queue, as
//! must checkouts and rebases when [`WorkspaceManager::keeps_work_in_place`].

mod git;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::WorkspaceError;

pub use git::GitWorkspaceManager;

/// Branch a task's work lives on.
pub fn branch_for(task_id: &str) -> String {
    format!("taskforge/{}", task_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Result of merging a task branch into the trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCommit {
    pub commit: String,
    pub changed_files: Vec<String>,
}

/// Workspace and trunk operations. Real implementation:
/// [`GitWorkspaceManager`].
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Check out a workspace for `task_id`. With `existing_branch` the
    /// task's previous branch is reused; otherwise a fresh branch is cut
    /// from the trunk.
    async fn create_workspace(
        &self,
        task_id: &str,
        existing_branch: Option<&str>,
    ) -> Result<Workspace, WorkspaceError>;

    /// Where `task_id`'s workspace for `branch` lives, whether or not it is
    /// currently checked out.
    fn locate(&self, task_id: &str, branch: &str) -> Workspace;

    /// Discard the task's checkout. The branch survives.
    async fn remove_workspace(&self, task_id: &str) -> Result<(), WorkspaceError>;

    /// Commit whatever the agent left uncommitted. Returns whether a commit
    /// was made.
    async fn commit_all(&self, workspace: &Path, message: &str) -> Result<bool, WorkspaceError>;

    /// Rebase the workspace branch onto the trunk. A conflicting rebase is
    /// left in progress and reported as [`WorkspaceError::Conflict`].
    async fn rebase_onto_trunk(&self, workspace: &Path) -> Result<(), WorkspaceError>;

    async fn continue_rebase(&self, workspace: &Path) -> Result<(), WorkspaceError>;

    async fn abort_rebase(&self, workspace: &Path) -> Result<(), WorkspaceError>;

    /// Fast-forward the trunk from its upstream, if it has one.
    async fn sync_trunk_from_upstream(&self) -> Result<(), WorkspaceError>;

    /// Diff of `branch` against its merge base with the trunk.
    async fn capture_diff(&self, branch: &str) -> Result<String, WorkspaceError>;

    async fn merge_branch(&self, branch: &str, message: &str) -> Result<MergeCommit, WorkspaceError>;

    async fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError>;

    /// Whether merging removes the checkout (worktrees) or only the branch
    /// (in-place work).
    fn keeps_work_in_place(&self) -> bool;
}
