//! Merge Coordinator: integrates a reviewed task branch into the trunk.
//!
//! Order of operations for [`MergeCoordinator::perform_merge_and_done`]:
//! 1. sync the trunk from upstream (commit queue)
//! 2. rebase the task workspace onto the trunk, handing genuine conflicts to
//!    the [`ConflictResolver`]
//! 3. merge the branch (commit queue)
//! 4. record the changed files, close the task, clean up the workspace
//!
//! An unresolved conflict reopens the task with its conflict files recorded
//! and its attempt count untouched. Epic follow-up happens separately, in
//! [`EpicCompletionWatcher`], driven by the store's `Closed` events.

mod epic;

use std::sync::Arc;

use anyhow::Result;

use crate::agent::ConflictResolver;
use crate::commit_queue::CommitQueue;
use crate::errors::WorkspaceError;
use crate::store::{Extensions, Task, TaskStatus, TaskStore, TaskUpdate, ext};
use crate::workspace::{MergeCommit, WorkspaceManager};

pub use epic::EpicCompletionWatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { changed_files: Vec<String> },
    Reopened { conflict_files: Vec<String> },
}

pub struct MergeCoordinator {
    store: TaskStore,
    workspaces: Arc<dyn WorkspaceManager>,
    resolver: Arc<dyn ConflictResolver>,
    queue: CommitQueue,
}

impl MergeCoordinator {
    pub fn new(
        store: TaskStore,
        workspaces: Arc<dyn WorkspaceManager>,
        resolver: Arc<dyn ConflictResolver>,
        queue: CommitQueue,
    ) -> Self {
        Self {
            store,
            workspaces,
            resolver,
            queue,
        }
    }

    /// Merge `branch` for a task whose coding and review phases succeeded.
    ///
    /// Only store failures are returned as errors; git trouble reopens the
    /// task.
    pub async fn perform_merge_and_done(&self, task: &Task, branch: &str) -> Result<MergeOutcome> {
        let project_id = self.store.project_id().to_string();
        let workspace = self.workspaces.locate(&task.id, branch);

        let workspaces = Arc::clone(&self.workspaces);
        if let Err(e) = self
            .queue
            .enqueue_and_wait("sync trunk", async move {
                workspaces.sync_trunk_from_upstream().await?;
                Ok::<(), anyhow::Error>(())
            })
            .await
        {
            tracing::warn!(task_id = %task.id, error = %format!("{:#}", e), "trunk sync failed; merging against local trunk");
        }

        match self.workspaces.rebase_onto_trunk(&workspace.path).await {
            Ok(()) => {}
            Err(WorkspaceError::Conflict { files }) => {
                tracing::info!(task_id = %task.id, files = ?files, "rebase conflict; invoking resolver");
                if !self.resolver.resolve(&project_id, &workspace.path).await {
                    tracing::warn!(task_id = %task.id, "conflict resolver gave up");
                    return self.reopen(task, branch, files).await;
                }
                match self.workspaces.continue_rebase(&workspace.path).await {
                    Ok(()) => {
                        tracing::info!(task_id = %task.id, "conflict resolved");
                    }
                    Err(WorkspaceError::Conflict { files: remaining }) => {
                        tracing::warn!(task_id = %task.id, files = ?remaining, "conflicts remain after resolution");
                        return self.reopen(task, branch, remaining).await;
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "rebase --continue failed");
                        return self.reopen(task, branch, files).await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "rebase failed");
                return self.reopen(task, branch, Vec::new()).await;
            }
        }

        let workspaces = Arc::clone(&self.workspaces);
        let merge_branch = branch.to_string();
        let message = format!("Merge {}: {}", task.id, task.title);
        let merged = self
            .queue
            .enqueue_and_wait(format!("merge {}", task.id), async move {
                Ok::<_, anyhow::Error>(workspaces.merge_branch(&merge_branch, &message).await)
            })
            .await;
        let MergeCommit {
            commit,
            changed_files,
        } = match merged {
            Ok(Ok(commit)) => commit,
            Ok(Err(WorkspaceError::Conflict { files })) => {
                tracing::warn!(task_id = %task.id, files = ?files, "merge conflicted; trunk moved after rebase");
                return self.reopen(task, branch, files).await;
            }
            Ok(Err(e)) => {
                tracing::error!(task_id = %task.id, error = %e, "merge failed");
                return self.reopen(task, branch, Vec::new()).await;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %format!("{:#}", e), "merge job did not complete");
                return self.reopen(task, branch, Vec::new()).await;
            }
        };

        let mut extensions = Extensions::new();
        extensions.set_actual_files(changed_files.clone());
        let mut update = TaskUpdate::default().with_extensions(extensions);
        update.remove_extensions = vec![ext::BRANCH.to_string(), ext::CONFLICT_FILES.to_string()];
        self.store.update(&task.id, update).await?;
        self.store.close(&task.id, Some("merged")).await?;
        tracing::info!(task_id = %task.id, commit = %commit, files = changed_files.len(), "task merged and closed");

        self.cleanup(&task.id, branch).await;
        Ok(MergeOutcome::Merged { changed_files })
    }

    /// Remove the checkout (unless work happens in place) and the merged
    /// branch. Failures are logged; the task is already closed.
    async fn cleanup(&self, task_id: &str, branch: &str) {
        if !self.workspaces.keeps_work_in_place()
            && let Err(e) = self.workspaces.remove_workspace(task_id).await
        {
            tracing::warn!(task_id, error = %e, "failed to remove workspace after merge");
        }
        let workspaces = Arc::clone(&self.workspaces);
        let branch = branch.to_string();
        self.queue
            .enqueue(format!("delete branch {}", branch), async move {
                workspaces.delete_branch(&branch).await?;
                Ok::<(), anyhow::Error>(())
            });
    }

    /// Abort any rebase, release the checkout and put the task back in the
    /// ready pool on its branch.
    async fn reopen(&self, task: &Task, branch: &str, conflict_files: Vec<String>) -> Result<MergeOutcome> {
        let workspaces = Arc::clone(&self.workspaces);
        let task_id = task.id.clone();
        let workspace = self.workspaces.locate(&task.id, branch);
        let release = async move {
            if let Err(e) = workspaces.abort_rebase(&workspace.path).await {
                tracing::warn!(task_id = %task_id, error = %e, "rebase abort failed");
            }
            if let Err(e) = workspaces.remove_workspace(&task_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to release workspace");
            }
            Ok::<(), anyhow::Error>(())
        };
        // An in-place release checks the trunk back out.
        let released = if self.workspaces.keeps_work_in_place() {
            self.queue
                .enqueue_and_wait(format!("release {}", task.id), release)
                .await
        } else {
            release.await
        };
        if let Err(e) = released {
            tracing::warn!(task_id = %task.id, error = %format!("{:#}", e), "workspace release did not run");
        }

        let mut extensions = Extensions::new();
        extensions.set_branch(Some(branch));
        extensions.set_conflict_files(conflict_files.clone());
        let mut update = TaskUpdate::status(TaskStatus::Open).with_extensions(extensions);
        if conflict_files.is_empty() {
            update.remove_extensions.push(ext::CONFLICT_FILES.to_string());
        }
        self.store.update(&task.id, update).await?;
        tracing::info!(task_id = %task.id, files = ?conflict_files, "task reopened without merging");
        Ok(MergeOutcome::Reopened { conflict_files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewTask;
    use crate::testing::{MockResolver, MockWorkspace};

    struct Harness {
        store: TaskStore,
        workspaces: Arc<MockWorkspace>,
        resolver: Arc<MockResolver>,
        queue: CommitQueue,
        coordinator: MergeCoordinator,
        _dir: tempfile::TempDir,
    }

    fn harness(resolves: bool, in_place: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::in_memory("p").unwrap();
        let root = dir.path().join("ws");
        let workspaces = Arc::new(if in_place {
            MockWorkspace::in_place(root)
        } else {
            MockWorkspace::new(root)
        });
        let resolver = Arc::new(MockResolver::new(resolves));
        let (queue, _worker) = CommitQueue::start();
        let coordinator = MergeCoordinator::new(
            store.clone(),
            workspaces.clone(),
            resolver.clone(),
            queue.clone(),
        );
        Harness {
            store,
            workspaces,
            resolver,
            queue,
            coordinator,
            _dir: dir,
        }
    }

    /// A task in progress on its branch, as after an approved review.
    async fn reviewed_task(h: &Harness) -> (Task, String) {
        let task = h.store.create(NewTask::new("Parser")).await.unwrap();
        let task = h
            .store
            .update(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap();
        let ws = h.workspaces.create_workspace(&task.id, None).await.unwrap();
        (task, ws.branch)
    }

    #[tokio::test]
    async fn test_clean_merge_closes_task_and_records_files() {
        let h = harness(true, false);
        h.workspaces.set_changed_files(vec!["src/parser.rs".into()]);
        let (task, branch) = reviewed_task(&h).await;

        let outcome = h
            .coordinator
            .perform_merge_and_done(&task, &branch)
            .await
            .unwrap();
        h.queue.drain().await;

        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                changed_files: vec!["src/parser.rs".into()]
            }
        );
        let closed = h.store.get(&task.id).await.unwrap();
        assert_eq!(closed.status, TaskStatus::Closed);
        assert_eq!(closed.extensions.actual_files(), vec!["src/parser.rs".to_string()]);
        assert!(closed.extensions.branch().is_none());
        assert_eq!(h.workspaces.synced(), 1);
        assert_eq!(h.workspaces.merged(), vec![branch.clone()]);
        assert_eq!(h.workspaces.removed(), vec![task.id.clone()]);
        assert_eq!(h.workspaces.deleted_branches(), vec![branch]);
        assert_eq!(h.resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolved_conflict_merges_without_attempt() {
        let h = harness(true, false);
        h.workspaces.push_rebase_conflict(vec!["src/a.rs".into()]);
        let (task, branch) = reviewed_task(&h).await;

        let outcome = h
            .coordinator
            .perform_merge_and_done(&task, &branch)
            .await
            .unwrap();

        assert!(matches!(outcome, MergeOutcome::Merged { .. }));
        assert_eq!(h.resolver.calls(), 1);
        assert_eq!(h.workspaces.continued(), 1);
        let closed = h.store.get(&task.id).await.unwrap();
        assert_eq!(closed.status, TaskStatus::Closed);
        assert_eq!(closed.attempts(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_conflict_reopens_with_files() {
        let h = harness(false, false);
        h.workspaces.push_rebase_conflict(vec!["src/a.rs".into(), "src/b.rs".into()]);
        let (task, branch) = reviewed_task(&h).await;

        let outcome = h
            .coordinator
            .perform_merge_and_done(&task, &branch)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MergeOutcome::Reopened {
                conflict_files: vec!["src/a.rs".into(), "src/b.rs".into()]
            }
        );
        let reopened = h.store.get(&task.id).await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert_eq!(reopened.attempts(), 0);
        assert_eq!(
            reopened.extensions.conflict_files(),
            vec!["src/a.rs".to_string(), "src/b.rs".to_string()]
        );
        assert_eq!(reopened.extensions.branch(), Some(branch.clone()));
        assert!(reopened.assignee.is_none());
        assert_eq!(h.workspaces.aborted(), 1);
        assert!(h.workspaces.merged().is_empty());
        assert!(h.workspaces.has_branch(&branch));
    }

    #[tokio::test]
    async fn test_partial_resolution_reports_remaining_files() {
        let h = harness(true, false);
        h.workspaces.push_rebase_conflict(vec!["a".into(), "b".into()]);
        h.workspaces.push_continue_conflict(vec!["b".into()]);
        let (task, branch) = reviewed_task(&h).await;

        let outcome = h
            .coordinator
            .perform_merge_and_done(&task, &branch)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Reopened {
                conflict_files: vec!["b".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_merge_conflict_reopens() {
        let h = harness(true, false);
        h.workspaces.set_merge_conflict(vec!["src/late.rs".into()]);
        let (task, branch) = reviewed_task(&h).await;

        let outcome = h
            .coordinator
            .perform_merge_and_done(&task, &branch)
            .await
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Reopened { .. }));
        assert_eq!(h.store.get(&task.id).await.unwrap().status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_in_place_merge_keeps_checkout() {
        let h = harness(true, true);
        let (task, branch) = reviewed_task(&h).await;

        h.coordinator
            .perform_merge_and_done(&task, &branch)
            .await
            .unwrap();
        h.queue.drain().await;

        assert!(h.workspaces.removed().is_empty());
        assert_eq!(h.workspaces.deleted_branches(), vec![branch]);
    }
}
