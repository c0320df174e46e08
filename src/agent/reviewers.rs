//! Conflict-resolution and epic final-review agents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::artifact::{self, AgentResult, ResultStatus};
use super::{AgentCommand, AgentRunner, log_file, run_to_completion};
use crate::errors::AgentError;
use crate::store::{NewTask, Task, TaskStore, validate_priority};

/// Resolves a rebase left in conflict in a workspace. On success the
/// conflicted paths have been edited into their resolved form.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// `true` means resolved.
    async fn resolve(&self, project_id: &str, workspace: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalReviewStatus {
    Pass,
    Issues,
}

/// Follow-up work proposed by a final review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl ProposedTask {
    /// A child of `epic_id`. Out-of-range priorities fall back to the
    /// default.
    pub fn into_new_task(self, epic_id: &str) -> NewTask {
        let mut task = NewTask::new(self.title)
            .with_description(self.description)
            .with_parent(epic_id);
        if let Some(priority) = self.priority.filter(|p| validate_priority(*p).is_ok()) {
            task = task.with_priority(priority);
        }
        if !self.files.is_empty() {
            task.extensions.set_files(self.files);
        }
        task
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalReview {
    pub status: FinalReviewStatus,
    #[serde(default)]
    pub proposed_tasks: Vec<ProposedTask>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Assesses a completed epic against the trunk.
#[async_trait]
pub trait FinalReviewer: Send + Sync {
    async fn review(
        &self,
        project_id: &str,
        epic_id: &str,
        trunk: &Path,
    ) -> Result<FinalReview, AgentError>;
}

#[derive(Serialize)]
struct ConflictInput<'a> {
    phase: &'static str,
    project_id: &'a str,
    workspace: &'a Path,
    instructions: &'static str,
}

/// Conflict resolver backed by an agent process run inside the workspace.
pub struct ProcessConflictResolver {
    runner: Arc<dyn AgentRunner>,
    command: AgentCommand,
    log_dir: PathBuf,
}

impl ProcessConflictResolver {
    pub fn new(runner: Arc<dyn AgentRunner>, command: AgentCommand, log_dir: PathBuf) -> Self {
        Self {
            runner,
            command,
            log_dir,
        }
    }

    async fn try_resolve(&self, project_id: &str, workspace: &Path) -> Result<bool, AgentError> {
        let artifacts = artifact::workspace_artifact_dir(workspace);
        let task_label = workspace
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());
        let spec = self.command.spec(
            format!("{}/conflict", task_label),
            workspace,
            &artifacts,
            log_file(&self.log_dir, &task_label, "conflict"),
        );

        artifact::clear_result(&spec.result_path).await?;
        artifact::write_input(
            &spec.input_path,
            &ConflictInput {
                phase: "conflict_resolution",
                project_id,
                workspace,
                instructions: "A rebase onto the trunk stopped on conflicts. Edit every \
                               conflicted file into its resolved form; do not commit.",
            },
        )
        .await?;

        let result_path = spec.result_path.clone();
        let exit = run_to_completion(self.runner.as_ref(), spec).await?;
        if !exit.success() {
            tracing::warn!(project_id, workspace = %workspace.display(), exit = %exit.describe(), "conflict resolver failed");
            return Ok(false);
        }
        let result: Option<AgentResult> = artifact::read_result(&result_path).await?;
        Ok(!matches!(
            result.and_then(|r| r.status),
            Some(ResultStatus::Failed)
        ))
    }
}

#[async_trait]
impl ConflictResolver for ProcessConflictResolver {
    async fn resolve(&self, project_id: &str, workspace: &Path) -> bool {
        match self.try_resolve(project_id, workspace).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(project_id, workspace = %workspace.display(), error = %e, "conflict resolution errored");
                false
            }
        }
    }
}

#[derive(Serialize)]
struct FinalReviewInput<'a> {
    phase: &'static str,
    project_id: &'a str,
    epic: &'a Task,
    children: &'a [Task],
    trunk: &'a Path,
}

/// Final reviewer backed by an agent process run against the trunk. Its
/// artifacts live under `<taskforge_dir>/final-review/<epic>/`.
pub struct ProcessFinalReviewer {
    runner: Arc<dyn AgentRunner>,
    command: AgentCommand,
    store: TaskStore,
    taskforge_dir: PathBuf,
    log_dir: PathBuf,
}

impl ProcessFinalReviewer {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        command: AgentCommand,
        store: TaskStore,
        taskforge_dir: PathBuf,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            command,
            store,
            taskforge_dir,
            log_dir,
        }
    }
}

#[async_trait]
impl FinalReviewer for ProcessFinalReviewer {
    async fn review(
        &self,
        project_id: &str,
        epic_id: &str,
        trunk: &Path,
    ) -> Result<FinalReview, AgentError> {
        let epic = self
            .store
            .get(epic_id)
            .await
            .map_err(|e| AgentError::Other(e.into()))?;
        let children = self
            .store
            .children(epic_id)
            .await
            .map_err(|e| AgentError::Other(e.into()))?;

        let artifacts = self.taskforge_dir.join("final-review").join(epic_id);
        let spec = self.command.spec(
            format!("{}/final-review", epic_id),
            trunk,
            &artifacts,
            log_file(&self.log_dir, epic_id, "final-review"),
        );
        artifact::clear_result(&spec.result_path).await?;
        artifact::write_input(
            &spec.input_path,
            &FinalReviewInput {
                phase: "final_review",
                project_id,
                epic: &epic,
                children: &children,
                trunk,
            },
        )
        .await?;

        let result_path = spec.result_path.clone();
        let exit = run_to_completion(self.runner.as_ref(), spec).await?;
        if !exit.success() {
            return Err(AgentError::Unsuccessful(exit.describe()));
        }
        artifact::read_result(&result_path)
            .await?
            .ok_or_else(|| AgentError::InvalidResult("final review wrote no result".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_PRIORITY;

    #[test]
    fn test_final_review_parses_issues() {
        let review: FinalReview = serde_json::from_str(
            r#"{"status": "issues", "proposed_tasks": [{"title": "Add docs", "priority": 1}]}"#,
        )
        .unwrap();
        assert_eq!(review.status, FinalReviewStatus::Issues);
        assert_eq!(review.proposed_tasks.len(), 1);
        assert_eq!(review.proposed_tasks[0].description, "");
    }

    #[test]
    fn test_proposed_task_becomes_child() {
        let proposed = ProposedTask {
            title: "Fix edge case".into(),
            description: "empty input".into(),
            priority: Some(9),
            files: vec!["src/lib.rs".into()],
        };
        let new = proposed.into_new_task("tf-abc");
        assert_eq!(new.parent.as_deref(), Some("tf-abc"));
        assert_eq!(new.priority, DEFAULT_PRIORITY);
        assert_eq!(new.extensions.files(), vec!["src/lib.rs".to_string()]);
    }
}
