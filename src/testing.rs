//! Hand-written mocks of the collaborator traits, for unit tests.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{
    AgentExit, AgentRunner, AgentSpec, ConflictResolver, FinalReview, FinalReviewStatus,
    FinalReviewer, OnDone,
};
use crate::errors::{AgentError, WorkspaceError};
use crate::executor::CapacityGate;
use crate::workspace::{MergeCommit, Workspace, WorkspaceManager, branch_for};

#[derive(Default)]
struct WorkspaceState {
    branches: HashSet<String>,
    created: Vec<(String, Option<String>)>,
    removed: Vec<String>,
    deleted_branches: Vec<String>,
    merged: Vec<String>,
    rebase_conflicts: VecDeque<Vec<String>>,
    continue_conflicts: VecDeque<Vec<String>>,
    merge_conflict: Option<Vec<String>>,
    changed_files: Vec<String>,
    aborted: usize,
    continued: usize,
    commits: usize,
    synced: usize,
}

/// In-memory workspace manager. Workspaces are plain directories under
/// `root` so artifacts can be written and read back.
pub struct MockWorkspace {
    root: PathBuf,
    in_place: bool,
    state: Mutex<WorkspaceState>,
}

impl MockWorkspace {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            in_place: false,
            state: Mutex::new(WorkspaceState::default()),
        }
    }

    pub fn in_place(root: PathBuf) -> Self {
        Self {
            in_place: true,
            ..Self::new(root)
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, WorkspaceState> {
        self.state.lock().unwrap()
    }

    pub fn add_branch(&self, branch: &str) {
        self.state().branches.insert(branch.to_string());
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state().branches.contains(branch)
    }

    pub fn push_rebase_conflict(&self, files: Vec<String>) {
        self.state().rebase_conflicts.push_back(files);
    }

    pub fn push_continue_conflict(&self, files: Vec<String>) {
        self.state().continue_conflicts.push_back(files);
    }

    pub fn set_merge_conflict(&self, files: Vec<String>) {
        self.state().merge_conflict = Some(files);
    }

    pub fn set_changed_files(&self, files: Vec<String>) {
        self.state().changed_files = files;
    }

    pub fn created(&self) -> Vec<(String, Option<String>)> {
        self.state().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn deleted_branches(&self) -> Vec<String> {
        self.state().deleted_branches.clone()
    }

    pub fn merged(&self) -> Vec<String> {
        self.state().merged.clone()
    }

    pub fn aborted(&self) -> usize {
        self.state().aborted
    }

    pub fn continued(&self) -> usize {
        self.state().continued
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn synced(&self) -> usize {
        self.state().synced
    }
}

#[async_trait]
impl WorkspaceManager for MockWorkspace {
    async fn create_workspace(
        &self,
        task_id: &str,
        existing_branch: Option<&str>,
    ) -> Result<Workspace, WorkspaceError> {
        let path = self.root.join(task_id);
        std::fs::create_dir_all(&path)?;
        let mut state = self.state();
        let branch = match existing_branch {
            Some(b) if state.branches.contains(b) => b.to_string(),
            _ => branch_for(task_id),
        };
        state.branches.insert(branch.clone());
        state
            .created
            .push((task_id.to_string(), existing_branch.map(str::to_string)));
        Ok(Workspace {
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    fn locate(&self, task_id: &str, branch: &str) -> Workspace {
        Workspace {
            task_id: task_id.to_string(),
            path: self.root.join(task_id),
            branch: branch.to_string(),
        }
    }

    async fn remove_workspace(&self, task_id: &str) -> Result<(), WorkspaceError> {
        let path = self.root.join(task_id);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        self.state().removed.push(task_id.to_string());
        Ok(())
    }

    async fn commit_all(&self, _workspace: &Path, _message: &str) -> Result<bool, WorkspaceError> {
        self.state().commits += 1;
        Ok(true)
    }

    async fn rebase_onto_trunk(&self, _workspace: &Path) -> Result<(), WorkspaceError> {
        match self.state().rebase_conflicts.pop_front() {
            Some(files) => Err(WorkspaceError::Conflict { files }),
            None => Ok(()),
        }
    }

    async fn continue_rebase(&self, _workspace: &Path) -> Result<(), WorkspaceError> {
        let mut state = self.state();
        state.continued += 1;
        match state.continue_conflicts.pop_front() {
            Some(files) => Err(WorkspaceError::Conflict { files }),
            None => Ok(()),
        }
    }

    async fn abort_rebase(&self, _workspace: &Path) -> Result<(), WorkspaceError> {
        self.state().aborted += 1;
        Ok(())
    }

    async fn sync_trunk_from_upstream(&self) -> Result<(), WorkspaceError> {
        self.state().synced += 1;
        Ok(())
    }

    async fn capture_diff(&self, branch: &str) -> Result<String, WorkspaceError> {
        Ok(format!("diff --git a/{b} b/{b}\n+change\n", b = branch))
    }

    async fn merge_branch(&self, branch: &str, _message: &str) -> Result<MergeCommit, WorkspaceError> {
        let mut state = self.state();
        if let Some(files) = state.merge_conflict.take() {
            return Err(WorkspaceError::Conflict { files });
        }
        state.merged.push(branch.to_string());
        Ok(MergeCommit {
            commit: "0123abcd".to_string(),
            changed_files: state.changed_files.clone(),
        })
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        let mut state = self.state();
        state.branches.remove(branch);
        state.deleted_branches.push(branch.to_string());
        Ok(())
    }

    fn keeps_work_in_place(&self) -> bool {
        self.in_place
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct MockRun {
    pub exit: AgentExit,
    pub result: Option<Value>,
}

impl MockRun {
    pub fn success() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit: AgentExit {
                code: Some(code),
                timed_out: false,
                stderr_tail: if code == 0 { String::new() } else { "mock failure".into() },
            },
            result: None,
        }
    }

    pub fn timeout() -> Self {
        Self {
            exit: AgentExit {
                code: None,
                timed_out: true,
                stderr_tail: String::new(),
            },
            result: None,
        }
    }

    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::success()
        }
    }
}

/// Agent runner that plays back scripted runs in order (defaulting to a
/// clean exit) and records every spec it was given.
pub struct MockAgentRunner {
    script: Mutex<VecDeque<MockRun>>,
    specs: Mutex<Vec<AgentSpec>>,
    fail_spawn: AtomicBool,
}

impl MockAgentRunner {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            specs: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
        }
    }

    pub fn push(&self, run: MockRun) {
        self.script.lock().unwrap().push_back(run);
    }

    pub fn fail_spawn(&self) {
        self.fail_spawn.store(true, Ordering::SeqCst);
    }

    pub fn specs(&self) -> Vec<AgentSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for MockAgentRunner {
    async fn run(&self, spec: AgentSpec, on_done: OnDone) -> Result<(), AgentError> {
        self.specs.lock().unwrap().push(spec.clone());
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(AgentError::SpawnFailed {
                command: spec.command,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            });
        }
        let run = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MockRun::success);
        if let Some(result) = &run.result {
            if let Some(parent) = spec.result_path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&spec.result_path, serde_json::to_vec(result).unwrap()).unwrap();
        }
        tokio::spawn(async move { on_done(run.exit).await });
        Ok(())
    }
}

/// Gate that never admits.
pub struct NoCapacity;

#[async_trait]
impl CapacityGate for NoCapacity {
    async fn has_capacity(&self, _project_id: &str) -> bool {
        false
    }
}

pub struct MockResolver {
    resolves: bool,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn new(resolves: bool) -> Self {
        Self {
            resolves,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConflictResolver for MockResolver {
    async fn resolve(&self, _project_id: &str, _workspace: &Path) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.resolves
    }
}

/// Final reviewer that plays back scripted reviews; passes once the script
/// runs out.
pub struct MockReviewer {
    script: Mutex<VecDeque<Result<FinalReview, String>>>,
    calls: Mutex<Vec<String>>,
}

impl MockReviewer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, review: Result<FinalReview, String>) {
        self.script.lock().unwrap().push_back(review);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FinalReviewer for MockReviewer {
    async fn review(
        &self,
        _project_id: &str,
        epic_id: &str,
        _trunk: &Path,
    ) -> Result<FinalReview, AgentError> {
        self.calls.lock().unwrap().push(epic_id.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(review)) => Ok(review),
            Some(Err(message)) => Err(AgentError::Unsuccessful(message)),
            None => Ok(FinalReview {
                status: FinalReviewStatus::Pass,
                proposed_tasks: Vec::new(),
                summary: None,
            }),
        }
    }
}
