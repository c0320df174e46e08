use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use git2::{Oid, Repository};
use tokio::process::Command;

use super::{MergeCommit, Workspace, WorkspaceManager, branch_for};
use crate::config::{TaskforgeConfig, WorkMode};
use crate::errors::WorkspaceError;

/// Pathspec that keeps taskforge's own artifacts out of task commits.
const EXCLUDE_TASKFORGE: &str = ":(exclude).taskforge";

/// `WorkspaceManager` backed by the `git` CLI (worktrees, rebase, merge) and
/// `git2` for read-only inspection.
pub struct GitWorkspaceManager {
    repo: PathBuf,
    trunk: String,
    mode: WorkMode,
    workspaces_dir: PathBuf,
}

impl GitWorkspaceManager {
    pub fn new(
        repo: impl Into<PathBuf>,
        trunk: impl Into<String>,
        mode: WorkMode,
        workspaces_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo: repo.into(),
            trunk: trunk.into(),
            mode,
            workspaces_dir: workspaces_dir.into(),
        }
    }

    pub fn from_config(config: &TaskforgeConfig) -> Self {
        Self::new(
            config.project_dir.clone(),
            config.trunk_branch(),
            config.work_mode(),
            config.workspaces_dir(),
        )
    }

    fn workspace_path(&self, task_id: &str) -> PathBuf {
        match self.mode {
            WorkMode::Worktree => self.workspaces_dir.join(task_id),
            WorkMode::InPlace => self.repo.clone(),
        }
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError> {
        let path_str = utf8(path)?;
        let output = run_git(&self.repo, &["worktree", "remove", "--force", path_str]).await?;
        if !output.status.success() {
            // Not a registered worktree any more; clear the directory itself.
            tracing::debug!(path = %path.display(), "worktree remove failed; deleting directory");
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
        }
        git(&self.repo, &["worktree", "prune"]).await?;
        Ok(())
    }

    async fn restore_branch(&self, original: &str) {
        if let Err(e) = git(&self.repo, &["checkout", original]).await {
            tracing::error!(branch = original, error = %e, "failed to restore branch after merge");
        }
    }
}

#[async_trait]
impl WorkspaceManager for GitWorkspaceManager {
    async fn create_workspace(
        &self,
        task_id: &str,
        existing_branch: Option<&str>,
    ) -> Result<Workspace, WorkspaceError> {
        let reuse = match existing_branch {
            Some(branch) => branch_exists(&self.repo, branch).await?,
            None => false,
        };
        let branch = match (reuse, existing_branch) {
            (true, Some(branch)) => branch.to_string(),
            _ => branch_for(task_id),
        };
        let path = self.workspace_path(task_id);

        match self.mode {
            WorkMode::Worktree => {
                if path.exists() {
                    self.remove_worktree(&path).await?;
                }
                git(&self.repo, &["worktree", "prune"]).await?;
                tokio::fs::create_dir_all(&self.workspaces_dir).await?;
                let path_str = utf8(&path)?;
                if reuse {
                    git(&self.repo, &["worktree", "add", path_str, &branch]).await?;
                } else {
                    if branch_exists(&self.repo, &branch).await? {
                        git(&self.repo, &["branch", "-D", &branch]).await?;
                    }
                    git(
                        &self.repo,
                        &["worktree", "add", "-b", &branch, path_str, &self.trunk],
                    )
                    .await?;
                }
            }
            WorkMode::InPlace => {
                if reuse {
                    git(&self.repo, &["checkout", &branch]).await?;
                } else {
                    git(&self.repo, &["checkout", "-B", &branch, &self.trunk]).await?;
                }
            }
        }

        tracing::info!(task_id, branch = %branch, path = %path.display(), reused = reuse, "workspace ready");
        Ok(Workspace {
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    fn locate(&self, task_id: &str, branch: &str) -> Workspace {
        Workspace {
            task_id: task_id.to_string(),
            path: self.workspace_path(task_id),
            branch: branch.to_string(),
        }
    }

    async fn remove_workspace(&self, task_id: &str) -> Result<(), WorkspaceError> {
        match self.mode {
            WorkMode::Worktree => {
                let path = self.workspace_path(task_id);
                if path.exists() {
                    self.remove_worktree(&path).await?;
                }
            }
            WorkMode::InPlace => {
                if rebase_in_progress(&self.repo).await? {
                    git(&self.repo, &["rebase", "--abort"]).await?;
                }
                git(&self.repo, &["checkout", "-f", &self.trunk]).await?;
            }
        }
        tracing::debug!(task_id, "workspace removed");
        Ok(())
    }

    async fn commit_all(&self, workspace: &Path, message: &str) -> Result<bool, WorkspaceError> {
        let status = git(workspace, &["status", "--porcelain", "--", ".", EXCLUDE_TASKFORGE]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        git(workspace, &["add", "-A", "--", ".", EXCLUDE_TASKFORGE]).await?;
        git(workspace, &["commit", "-m", message]).await?;
        Ok(true)
    }

    async fn rebase_onto_trunk(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        let output = run_git(workspace, &["rebase", &self.trunk]).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(conflict_or_error(workspace, "rebase", &output).await)
    }

    async fn continue_rebase(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        if !rebase_in_progress(workspace).await? {
            return Ok(());
        }
        git(workspace, &["add", "-A", "--", ".", EXCLUDE_TASKFORGE]).await?;
        let output = run_git(workspace, &["rebase", "--continue"]).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(conflict_or_error(workspace, "rebase --continue", &output).await)
    }

    async fn abort_rebase(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        if rebase_in_progress(workspace).await? {
            git(workspace, &["rebase", "--abort"]).await?;
        }
        Ok(())
    }

    async fn sync_trunk_from_upstream(&self) -> Result<(), WorkspaceError> {
        let remotes = git(&self.repo, &["remote"]).await?;
        let remotes: Vec<&str> = remotes.lines().map(str::trim).filter(|r| !r.is_empty()).collect();
        let Some(remote) = remotes
            .iter()
            .find(|r| **r == "origin")
            .or_else(|| remotes.first())
        else {
            tracing::debug!("no upstream remote; trunk sync skipped");
            return Ok(());
        };

        if current_branch(&self.repo).await? == self.trunk {
            git(&self.repo, &["pull", "--ff-only", remote, &self.trunk]).await?;
        } else {
            let refspec = format!("{}:{}", self.trunk, self.trunk);
            git(&self.repo, &["fetch", remote, &refspec]).await?;
        }
        tracing::debug!(remote, trunk = %self.trunk, "trunk synced from upstream");
        Ok(())
    }

    async fn capture_diff(&self, branch: &str) -> Result<String, WorkspaceError> {
        let repo = self.repo.clone();
        let trunk = self.trunk.clone();
        let tip = branch.to_string();
        let base = tokio::task::spawn_blocking(move || merge_base(&repo, &trunk, &tip))
            .await
            .map_err(|e| anyhow!("merge-base task failed: {}", e))??;
        git(&self.repo, &["diff", &base, branch]).await
    }

    async fn merge_branch(&self, branch: &str, message: &str) -> Result<MergeCommit, WorkspaceError> {
        let original = current_branch(&self.repo).await?;
        if original != self.trunk {
            git(&self.repo, &["checkout", &self.trunk]).await?;
        }
        let restore = self.mode == WorkMode::Worktree && original != self.trunk;

        let output = run_git(&self.repo, &["merge", "--no-ff", "-m", message, branch]).await?;
        if !output.status.success() {
            let err = conflict_or_error(&self.repo, "merge", &output).await;
            if let Err(e) = git(&self.repo, &["merge", "--abort"]).await {
                tracing::error!(branch, error = %e, "merge --abort failed");
            }
            if restore {
                self.restore_branch(&original).await;
            }
            return Err(err);
        }

        let commit = git(&self.repo, &["rev-parse", "HEAD"]).await?.trim().to_string();
        let repo = self.repo.clone();
        let sha = commit.clone();
        let changed_files = tokio::task::spawn_blocking(move || changed_files_in_commit(&repo, &sha))
            .await
            .map_err(|e| anyhow!("changed-files task failed: {}", e))??;

        if restore {
            self.restore_branch(&original).await;
        }
        tracing::info!(branch, commit = %commit, files = changed_files.len(), "branch merged into trunk");
        Ok(MergeCommit {
            commit,
            changed_files,
        })
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        if branch_exists(&self.repo, branch).await? {
            git(&self.repo, &["branch", "-D", branch]).await?;
        }
        Ok(())
    }

    fn keeps_work_in_place(&self) -> bool {
        self.mode == WorkMode::InPlace
    }
}

fn utf8(path: &Path) -> Result<&str, WorkspaceError> {
    path.to_str()
        .ok_or_else(|| WorkspaceError::Other(anyhow!("path is not valid UTF-8: {}", path.display())))
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<Output, WorkspaceError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_EDITOR", "true")
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
        .map_err(WorkspaceError::Other)
}

/// Run git and return stdout, or `WorkspaceError::Git` on a non-zero exit.
async fn git(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = run_git(dir, args).await?;
    if !output.status.success() {
        return Err(WorkspaceError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Classify a failed rebase/merge by git's unmerged-path listing.
async fn conflict_or_error(dir: &Path, command: &str, output: &Output) -> WorkspaceError {
    match unmerged_files(dir).await {
        Ok(files) if !files.is_empty() => WorkspaceError::Conflict { files },
        Ok(_) => WorkspaceError::Git {
            command: command.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Err(e) => e,
    }
}

async fn unmerged_files(dir: &Path) -> Result<Vec<String>, WorkspaceError> {
    let out = git(dir, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

async fn branch_exists(dir: &Path, branch: &str) -> Result<bool, WorkspaceError> {
    let reference = format!("refs/heads/{}", branch);
    let output = run_git(dir, &["rev-parse", "--verify", "--quiet", &reference]).await?;
    Ok(output.status.success())
}

async fn current_branch(dir: &Path) -> Result<String, WorkspaceError> {
    Ok(git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?.trim().to_string())
}

async fn rebase_in_progress(dir: &Path) -> Result<bool, WorkspaceError> {
    for marker in ["rebase-merge", "rebase-apply"] {
        let path = git(dir, &["rev-parse", "--git-path", marker]).await?;
        let path = Path::new(path.trim());
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        };
        if path.exists() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn merge_base(repo: &Path, trunk: &str, branch: &str) -> Result<String, WorkspaceError> {
    let repo = Repository::open(repo)?;
    let trunk = repo.revparse_single(trunk)?.peel_to_commit()?.id();
    let tip = repo.revparse_single(branch)?.peel_to_commit()?.id();
    Ok(repo.merge_base(trunk, tip)?.to_string())
}

/// Paths a merge commit changed relative to its first parent.
fn changed_files_in_commit(repo: &Path, sha: &str) -> Result<Vec<String>, WorkspaceError> {
    let repo = Repository::open(repo)?;
    let commit = repo.find_commit(Oid::from_str(sha)?)?;
    let parent = commit.parent(0)?;
    let diff = repo.diff_tree_to_tree(Some(&parent.tree()?), Some(&commit.tree()?), None)?;
    let mut files: Vec<String> = diff
        .deltas()
        .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}
