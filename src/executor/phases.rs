use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{CapacityGate, DEFAULT_SLOT, PhaseHost, RetryContext};
use crate::agent::artifact::{self, AgentResult, ResultStatus};
use crate::agent::{AgentCommand, AgentExit, AgentRunner, log_file};
use crate::commit_queue::CommitQueue;
use crate::context::{ContextBuilder, ContextBundle, ContextThresholds};
use crate::errors::{FailureKind, WorkspaceError};
use crate::store::{
    Assignment, Extensions, ReviewRecord, ReviewVerdict, Task, TaskStatus, TaskStore, TaskUpdate,
    WorkPhase, ext,
};
use crate::workspace::{Workspace, WorkspaceManager};

/// Collaborators the executor drives.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub store: TaskStore,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub runner: Arc<dyn AgentRunner>,
    pub context: Arc<dyn ContextBuilder>,
    pub capacity: Arc<dyn CapacityGate>,
    pub host: Arc<dyn PhaseHost>,
    /// Serializes checkouts when task work happens in the trunk checkout.
    pub queue: CommitQueue,
}

#[derive(Debug, Clone)]
pub struct AgentCommands {
    pub coding: AgentCommand,
    pub review: AgentCommand,
}

#[derive(Serialize)]
struct CodingInput<'a> {
    phase: WorkPhase,
    task: &'a Task,
    attempt: u32,
    context: &'a ContextBundle,
    retry: Option<&'a RetryContext>,
    conflict_files: &'a [String],
}

#[derive(Serialize)]
struct ReviewInput<'a> {
    phase: WorkPhase,
    task: &'a Task,
    attempt: u32,
    context: &'a ContextBundle,
    diff: &'a str,
    review_history: &'a [ReviewRecord],
}

struct Inner {
    deps: ExecutorDeps,
    commands: AgentCommands,
    log_dir: PathBuf,
    thresholds: ContextThresholds,
    condensed: Mutex<HashMap<String, CondensedContext>>,
}

/// A condensed bundle and the raw bundle it was condensed from.
struct CondensedContext {
    source: ContextBundle,
    bundle: ContextBundle,
}

#[derive(Clone)]
pub struct PhaseExecutor {
    inner: Arc<Inner>,
}

impl PhaseExecutor {
    pub fn new(
        deps: ExecutorDeps,
        commands: AgentCommands,
        log_dir: PathBuf,
        thresholds: ContextThresholds,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                commands,
                log_dir,
                thresholds,
                condensed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start the coding phase. Returns once the agent is running (or the
    /// outcome has already been reported to the host).
    pub async fn execute_coding_phase(&self, task: Task, slot: &str, retry: Option<RetryContext>) {
        let deps = &self.inner.deps;
        if !deps.capacity.has_capacity(deps.store.project_id()).await {
            tracing::warn!(task_id = %task.id, "no execution capacity; coding phase not started");
            deps.host.on_capacity_exhausted(task).await;
            return;
        }

        let mut workspace = None;
        if let Err(e) = self
            .start_coding(&task, slot, retry.as_ref(), &mut workspace)
            .await
        {
            tracing::error!(task_id = %task.id, error = %format!("{:#}", e), "coding phase setup failed");
            deps.host
                .on_failure(
                    task,
                    workspace,
                    FailureKind::AgentCrash,
                    format!("coding setup failed: {:#}", e),
                )
                .await;
        }
    }

    /// Start the review phase against the branch the coding phase produced.
    pub async fn execute_review_phase(&self, task: Task, branch: &str) {
        let deps = &self.inner.deps;
        if !deps.capacity.has_capacity(deps.store.project_id()).await {
            tracing::warn!(task_id = %task.id, "no execution capacity; review phase not started");
            deps.host.on_capacity_exhausted(task).await;
            return;
        }

        let workspace = deps.workspaces.locate(&task.id, branch);
        if let Err(e) = self.start_review(&task, &workspace).await {
            tracing::error!(task_id = %task.id, error = %format!("{:#}", e), "review phase setup failed");
            deps.host
                .on_failure(
                    task,
                    Some(workspace),
                    FailureKind::AgentCrash,
                    format!("review setup failed: {:#}", e),
                )
                .await;
        }
    }

    /// Drop cached context once a task is closed, blocked or reopened
    /// against a moved trunk.
    pub async fn forget_task(&self, task_id: &str) {
        self.inner.condensed.lock().await.remove(task_id);
    }

    async fn start_coding(
        &self,
        task: &Task,
        slot: &str,
        retry: Option<&RetryContext>,
        workspace: &mut Option<Workspace>,
    ) -> Result<()> {
        let deps = &self.inner.deps;
        let task = deps
            .store
            .update(
                &task.id,
                TaskUpdate::status(TaskStatus::InProgress).with_assignee(Some(slot.to_string())),
            )
            .await?;

        let existing = retry
            .filter(|r| r.use_existing_branch)
            .and_then(|_| task.extensions.branch());
        let workspaces = Arc::clone(&deps.workspaces);
        let task_id = task.id.clone();
        let branch = existing.clone();
        let ws = self
            .on_trunk(format!("check out {}", task.id), async move {
                Ok::<_, anyhow::Error>(
                    workspaces
                        .create_workspace(&task_id, branch.as_deref())
                        .await?,
                )
            })
            .await?;
        *workspace = Some(ws.clone());
        let reused = existing.as_deref() == Some(ws.branch.as_str());

        let mut conflict_files = Vec::new();
        if reused {
            let workspaces = Arc::clone(&deps.workspaces);
            let path = ws.path.clone();
            conflict_files = self
                .on_trunk(format!("rebase {}", ws.branch), async move {
                    let files = match workspaces.rebase_onto_trunk(&path).await {
                        Ok(()) => Vec::new(),
                        Err(WorkspaceError::Conflict { files }) => {
                            workspaces.abort_rebase(&path).await?;
                            files
                        }
                        Err(e) => return Err(e.into()),
                    };
                    Ok::<_, anyhow::Error>(files)
                })
                .await?;
            if !conflict_files.is_empty() {
                tracing::warn!(task_id = %task.id, files = ?conflict_files, "retry branch conflicts with trunk; continuing unrebased");
            }
        }

        let mut retry = retry.cloned();
        if reused && let Some(ctx) = retry.as_mut() && ctx.prior_diff.is_none() {
            match deps.workspaces.capture_diff(&ws.branch).await {
                Ok(diff) if !diff.trim().is_empty() => ctx.prior_diff = Some(diff),
                Ok(_) => {}
                Err(e) => tracing::debug!(task_id = %task.id, error = %e, "no prior diff for retry"),
            }
        }

        let mut extensions = Extensions::new();
        extensions.set_branch(Some(&ws.branch));
        let mut update = TaskUpdate::default();
        if conflict_files.is_empty() {
            update.remove_extensions.push(ext::CONFLICT_FILES.to_string());
        } else {
            extensions.set_conflict_files(conflict_files.clone());
        }
        let task = deps
            .store
            .update(&task.id, update.with_extensions(extensions))
            .await?;

        let attempt = task.attempts();
        let context = self.context_for(&task.id).await?;
        let spec = self.inner.commands.coding.spec(
            format!("{}/coding", task.id),
            &ws.path,
            &artifact::workspace_artifact_dir(&ws.path),
            log_file(&self.inner.log_dir, &task.id, "coding"),
        );
        artifact::clear_result(&spec.result_path).await?;
        artifact::write_input(
            &spec.input_path,
            &CodingInput {
                phase: WorkPhase::Coding,
                task: &task,
                attempt,
                context: &context,
                retry: retry.as_ref(),
                conflict_files: &conflict_files,
            },
        )
        .await?;

        deps.store
            .record_assignment(Assignment {
                task_id: task.id.clone(),
                slot: slot.to_string(),
                phase: WorkPhase::Coding,
                branch: ws.branch.clone(),
                workspace_path: ws.path.display().to_string(),
                attempt,
                started_at: Utc::now(),
            })
            .await?;

        let exec = self.clone();
        let done_task = task.clone();
        let done_ws = ws.clone();
        deps.runner
            .run(
                spec,
                Box::new(move |exit| {
                    async move { exec.finish_coding(done_task, done_ws, exit).await }.boxed()
                }),
            )
            .await?;
        tracing::info!(task_id = %task.id, branch = %ws.branch, attempt, reused, "coding phase started");
        Ok(())
    }

    async fn finish_coding(&self, task: Task, ws: Workspace, exit: AgentExit) {
        let deps = &self.inner.deps;
        let failure = if exit.timed_out {
            Some((FailureKind::AgentTimeout, exit.describe()))
        } else if !exit.success() {
            Some((FailureKind::AgentCrash, exit.describe()))
        } else {
            let result_path = artifact::result_path(&artifact::workspace_artifact_dir(&ws.path));
            match artifact::read_result::<AgentResult>(&result_path).await {
                Ok(Some(AgentResult {
                    status: Some(ResultStatus::Failed),
                    test_output,
                    feedback,
                    ..
                })) => Some((
                    FailureKind::TestFailure,
                    test_output
                        .or(feedback)
                        .unwrap_or_else(|| "agent reported failing tests".to_string()),
                )),
                Ok(_) => None,
                Err(e) => Some((FailureKind::AgentCrash, e.to_string())),
            }
        };
        if let Some((kind, reason)) = failure {
            tracing::warn!(task_id = %task.id, failure = %kind, reason = %reason, "coding phase failed");
            deps.host.on_failure(task, Some(ws), kind, reason).await;
            return;
        }

        let message = format!("{}: {}", task.id, task.title);
        match deps.workspaces.commit_all(&ws.path, &message).await {
            Ok(committed) => {
                tracing::debug!(task_id = %task.id, committed, "agent work committed");
            }
            Err(e) => {
                deps.host
                    .on_failure(
                        task,
                        Some(ws),
                        FailureKind::AgentCrash,
                        format!("committing agent work failed: {}", e),
                    )
                    .await;
                return;
            }
        }
        tracing::info!(task_id = %task.id, "coding phase complete");
        let task = self.refresh(task).await;
        deps.host.on_coding_complete(task, ws).await;
    }

    async fn start_review(&self, task: &Task, ws: &Workspace) -> Result<()> {
        let deps = &self.inner.deps;
        if !ws.path.exists() {
            let workspaces = Arc::clone(&deps.workspaces);
            let task_id = task.id.clone();
            let branch = ws.branch.clone();
            self.on_trunk(format!("check out {}", task.id), async move {
                Ok::<_, anyhow::Error>(workspaces.create_workspace(&task_id, Some(&branch)).await?)
            })
            .await?;
        }
        let diff = deps.workspaces.capture_diff(&ws.branch).await?;
        let history = deps.store.reviews(&task.id).await?;
        let attempt = task.attempts();
        let context = self.context_for(&task.id).await?;

        let spec = self.inner.commands.review.spec(
            format!("{}/review", task.id),
            &ws.path,
            &artifact::workspace_artifact_dir(&ws.path),
            log_file(&self.inner.log_dir, &task.id, "review"),
        );
        artifact::clear_result(&spec.result_path).await?;
        artifact::write_input(
            &spec.input_path,
            &ReviewInput {
                phase: WorkPhase::Review,
                task,
                attempt,
                context: &context,
                diff: &diff,
                review_history: &history,
            },
        )
        .await?;

        deps.store
            .record_assignment(Assignment {
                task_id: task.id.clone(),
                slot: task
                    .assignee
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SLOT.to_string()),
                phase: WorkPhase::Review,
                branch: ws.branch.clone(),
                workspace_path: ws.path.display().to_string(),
                attempt,
                started_at: Utc::now(),
            })
            .await?;

        let exec = self.clone();
        let done_task = task.clone();
        let done_ws = ws.clone();
        deps.runner
            .run(
                spec,
                Box::new(move |exit| {
                    async move { exec.finish_review(done_task, done_ws, exit).await }.boxed()
                }),
            )
            .await?;
        tracing::info!(task_id = %task.id, branch = %ws.branch, attempt, "review phase started");
        Ok(())
    }

    async fn finish_review(&self, task: Task, ws: Workspace, exit: AgentExit) {
        let deps = &self.inner.deps;
        let verdict = if exit.timed_out {
            Err((FailureKind::AgentTimeout, exit.describe()))
        } else if !exit.success() {
            Err((FailureKind::AgentCrash, exit.describe()))
        } else {
            let result_path = artifact::result_path(&artifact::workspace_artifact_dir(&ws.path));
            match artifact::read_result::<AgentResult>(&result_path).await {
                Ok(Some(AgentResult {
                    verdict: Some(verdict),
                    feedback,
                    ..
                })) => Ok((verdict, feedback.unwrap_or_default())),
                Ok(Some(_)) => Err((
                    FailureKind::AgentCrash,
                    "review result has no verdict".to_string(),
                )),
                Ok(None) => Err((
                    FailureKind::AgentCrash,
                    "review agent wrote no result".to_string(),
                )),
                Err(e) => Err((FailureKind::AgentCrash, e.to_string())),
            }
        };

        let (verdict, feedback) = match verdict {
            Ok(v) => v,
            Err((kind, reason)) => {
                tracing::warn!(task_id = %task.id, failure = %kind, reason = %reason, "review phase failed");
                deps.host.on_failure(task, Some(ws), kind, reason).await;
                return;
            }
        };

        if let Err(e) = deps
            .store
            .record_review(ReviewRecord {
                task_id: task.id.clone(),
                attempt: task.attempts(),
                verdict,
                feedback: feedback.clone(),
                created_at: Utc::now(),
            })
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "failed to record review");
        }

        match verdict {
            ReviewVerdict::Approve => {
                tracing::info!(task_id = %task.id, "review approved");
                if let Err(e) = deps.store.clear_assignment(&task.id).await {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to release agent slot");
                }
                let task = self.refresh(task).await;
                deps.host.on_review_complete(task, ws).await;
            }
            ReviewVerdict::Reject => {
                tracing::info!(task_id = %task.id, "review rejected");
                let mut extensions = Extensions::new();
                extensions.set_review_feedback(&feedback);
                if let Err(e) = deps
                    .store
                    .update(&task.id, TaskUpdate::default().with_extensions(extensions))
                    .await
                {
                    tracing::error!(task_id = %task.id, error = %e, "failed to store review feedback");
                }
                let reason = if feedback.is_empty() {
                    "review rejected".to_string()
                } else {
                    feedback
                };
                let task = self.refresh(task).await;
                deps.host
                    .on_failure(task, Some(ws), FailureKind::ReviewRejected, reason)
                    .await;
            }
        }
    }

    /// Context for `task_id`, condensed above the thresholds. A condensed
    /// bundle is reused across phases and retries until the raw bundle it
    /// came from changes.
    async fn context_for(&self, task_id: &str) -> Result<ContextBundle> {
        let context = &self.inner.deps.context;
        let bundle = context.build_context(task_id).await?;
        if !self.inner.thresholds.exceeded_by(&bundle) {
            return Ok(bundle);
        }
        if let Some(cached) = self.inner.condensed.lock().await.get(task_id) {
            if cached.source == bundle {
                tracing::debug!(task_id, "reusing condensed context");
                return Ok(cached.bundle.clone());
            }
            tracing::debug!(task_id, "condensed context is stale");
        }
        tracing::info!(task_id, bytes = bundle.size_bytes(), "condensing context");
        let condensed = context.condense_context(bundle.clone()).await?;
        self.inner.condensed.lock().await.insert(
            task_id.to_string(),
            CondensedContext {
                source: bundle,
                bundle: condensed.clone(),
            },
        );
        Ok(condensed)
    }

    /// Run `job` on the commit queue when workspaces share the trunk
    /// checkout, directly otherwise.
    async fn on_trunk<T, F>(&self, label: String, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let deps = &self.inner.deps;
        if deps.workspaces.keeps_work_in_place() {
            deps.queue.enqueue_and_wait(label, job).await
        } else {
            job.await
        }
    }

    async fn refresh(&self, task: Task) -> Task {
        match self.inner.deps.store.get(&task.id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "could not reload task");
                task
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::context::StoreContextBuilder;
    use crate::executor::{ChannelHost, PhaseEvent, Unlimited};
    use crate::store::{DependencyType, NewTask};
    use crate::testing::{MockAgentRunner, MockRun, MockWorkspace, NoCapacity};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Store-backed context that counts condensations.
    struct CountingContext {
        inner: StoreContextBuilder,
        condensed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ContextBuilder for CountingContext {
        async fn build_context(&self, task_id: &str) -> Result<ContextBundle> {
            self.inner.build_context(task_id).await
        }

        async fn condense_context(&self, bundle: ContextBundle) -> Result<ContextBundle> {
            self.condensed.fetch_add(1, Ordering::SeqCst);
            self.inner.condense_context(bundle).await
        }
    }

    struct Harness {
        store: TaskStore,
        workspaces: Arc<MockWorkspace>,
        runner: Arc<MockAgentRunner>,
        events: mpsc::UnboundedReceiver<PhaseEvent>,
        executor: PhaseExecutor,
        condensations: Arc<AtomicUsize>,
        queue: CommitQueue,
        _dir: tempfile::TempDir,
    }

    fn harness_with(capacity: Arc<dyn CapacityGate>, thresholds: ContextThresholds) -> Harness {
        build_harness(capacity, thresholds, false)
    }

    fn build_harness(
        capacity: Arc<dyn CapacityGate>,
        thresholds: ContextThresholds,
        in_place: bool,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::in_memory("p").unwrap();
        let workspaces = Arc::new(if in_place {
            MockWorkspace::in_place(dir.path().join("ws"))
        } else {
            MockWorkspace::new(dir.path().join("ws"))
        });
        let runner = Arc::new(MockAgentRunner::new());
        let (queue, _worker) = CommitQueue::start();
        let (host, events) = ChannelHost::new();
        let condensations = Arc::new(AtomicUsize::new(0));
        let deps = ExecutorDeps {
            store: store.clone(),
            workspaces: workspaces.clone(),
            runner: runner.clone(),
            context: Arc::new(CountingContext {
                inner: StoreContextBuilder::new(store.clone()),
                condensed: Arc::clone(&condensations),
            }),
            capacity,
            host: Arc::new(host),
            queue: queue.clone(),
        };
        let commands = AgentCommands {
            coding: AgentCommand::new("coder", vec![]),
            review: AgentCommand::new("reviewer", vec![]),
        };
        let executor = PhaseExecutor::new(deps, commands, dir.path().join("logs"), thresholds);
        Harness {
            store,
            workspaces,
            runner,
            events,
            executor,
            condensations,
            queue,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Arc::new(Unlimited),
            ContextThresholds {
                over_bytes: 1_000_000,
                over_dependencies: 100,
            },
        )
    }

    async fn next_event(h: &mut Harness) -> PhaseEvent {
        tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .expect("timed out waiting for phase event")
            .expect("host channel closed")
    }

    #[tokio::test]
    async fn test_coding_success_reports_completion() {
        let mut h = harness();
        let task = h.store.create(NewTask::new("Add parser")).await.unwrap();

        h.executor
            .execute_coding_phase(task.clone(), "slot-0", None)
            .await;

        match next_event(&mut h).await {
            PhaseEvent::CodingComplete { task: done, workspace } => {
                assert_eq!(done.id, task.id);
                assert_eq!(done.status, TaskStatus::InProgress);
                assert_eq!(done.assignee.as_deref(), Some("slot-0"));
                assert_eq!(done.extensions.branch(), Some(workspace.branch.clone()));
                let input = std::fs::read_to_string(
                    artifact::input_path(&artifact::workspace_artifact_dir(&workspace.path)),
                )
                .unwrap();
                assert!(input.contains("\"coding\""));
                assert!(input.contains("Add parser"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let assignments = h.store.active_assignments().await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].phase, WorkPhase::Coding);
        assert_eq!(h.workspaces.commits(), 1);
        assert_eq!(h.runner.specs()[0].command, "coder");
    }

    #[tokio::test]
    async fn test_in_place_checkout_waits_for_commit_queue() {
        let mut h = build_harness(
            Arc::new(Unlimited),
            ContextThresholds {
                over_bytes: 1_000_000,
                over_dependencies: 100,
            },
            true,
        );
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        h.queue.enqueue("merge in flight", async move {
            let _ = released.await;
            Ok::<(), anyhow::Error>(())
        });

        let executor = h.executor.clone();
        let started = tokio::spawn(async move {
            executor.execute_coding_phase(task, "slot-0", None).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.workspaces.created().is_empty());

        release.send(()).unwrap();
        started.await.unwrap();
        assert!(matches!(
            next_event(&mut h).await,
            PhaseEvent::CodingComplete { .. }
        ));
        assert_eq!(h.workspaces.created().len(), 1);
    }

    #[tokio::test]
    async fn test_coding_exit_codes_map_to_failure_kinds() {
        let cases = [
            (MockRun::exit(1), FailureKind::AgentCrash),
            (MockRun::timeout(), FailureKind::AgentTimeout),
            (
                MockRun::with_result(serde_json::json!({"status": "failed", "test_output": "1 failed"})),
                FailureKind::TestFailure,
            ),
        ];
        for (run, expected) in cases {
            let mut h = harness();
            let task = h.store.create(NewTask::new("t")).await.unwrap();
            h.runner.push(run);
            h.executor.execute_coding_phase(task, "slot-0", None).await;
            match next_event(&mut h).await {
                PhaseEvent::Failed { kind, workspace, .. } => {
                    assert_eq!(kind, expected);
                    assert!(workspace.is_some());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_capacity_exhausted_leaves_no_side_effects() {
        let mut h = harness_with(
            Arc::new(NoCapacity),
            ContextThresholds {
                over_bytes: 1_000_000,
                over_dependencies: 100,
            },
        );
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        h.executor
            .execute_coding_phase(task.clone(), "slot-0", None)
            .await;

        assert!(matches!(
            next_event(&mut h).await,
            PhaseEvent::CapacityExhausted { .. }
        ));
        assert!(h.workspaces.created().is_empty());
        assert!(h.runner.specs().is_empty());
        assert_eq!(h.store.get(&task.id).await.unwrap().status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_setup_error_reports_crash() {
        let mut h = harness();
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        h.runner.fail_spawn();
        h.executor.execute_coding_phase(task, "slot-0", None).await;

        match next_event(&mut h).await {
            PhaseEvent::Failed { kind, reason, .. } => {
                assert_eq!(kind, FailureKind::AgentCrash);
                assert!(reason.contains("setup failed"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_reuses_branch_and_records_conflicts() {
        let mut h = harness();
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        let mut ext = Extensions::new();
        ext.set_branch(Some("taskforge/old"));
        h.store
            .update(&task.id, TaskUpdate::default().with_extensions(ext))
            .await
            .unwrap();
        h.workspaces.add_branch("taskforge/old");
        h.workspaces.push_rebase_conflict(vec!["src/a.rs".into()]);

        let retry = RetryContext {
            use_existing_branch: true,
            ..Default::default()
        };
        h.executor
            .execute_coding_phase(task.clone(), "slot-0", Some(retry))
            .await;

        match next_event(&mut h).await {
            PhaseEvent::CodingComplete { task, workspace } => {
                assert_eq!(workspace.branch, "taskforge/old");
                assert_eq!(task.extensions.conflict_files(), vec!["src/a.rs".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.workspaces.aborted(), 1);
    }

    #[tokio::test]
    async fn test_review_verdicts() {
        let mut h = harness();
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        h.executor
            .execute_coding_phase(task.clone(), "slot-0", None)
            .await;
        let PhaseEvent::CodingComplete { task, workspace } = next_event(&mut h).await else {
            panic!("coding did not complete");
        };

        h.runner.push(MockRun::with_result(
            serde_json::json!({"verdict": "reject", "feedback": "missing tests"}),
        ));
        h.executor
            .execute_review_phase(task.clone(), &workspace.branch)
            .await;
        match next_event(&mut h).await {
            PhaseEvent::Failed { task, kind, reason, .. } => {
                assert_eq!(kind, FailureKind::ReviewRejected);
                assert_eq!(reason, "missing tests");
                assert_eq!(task.extensions.review_feedback().as_deref(), Some("missing tests"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        h.runner
            .push(MockRun::with_result(serde_json::json!({"verdict": "approve"})));
        h.executor
            .execute_review_phase(task.clone(), &workspace.branch)
            .await;
        assert!(matches!(
            next_event(&mut h).await,
            PhaseEvent::ReviewComplete { .. }
        ));

        let reviews = h.store.reviews(&task.id).await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].verdict, ReviewVerdict::Reject);
        assert_eq!(reviews[1].verdict, ReviewVerdict::Approve);
        assert!(h.store.active_assignments().await.unwrap().is_empty());
        let input = std::fs::read_to_string(artifact::input_path(
            &artifact::workspace_artifact_dir(&workspace.path),
        ))
        .unwrap();
        assert!(input.contains("missing tests"));
    }

    #[tokio::test]
    async fn test_review_without_verdict_is_crash() {
        let mut h = harness();
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        h.executor
            .execute_coding_phase(task.clone(), "slot-0", None)
            .await;
        let PhaseEvent::CodingComplete { task, workspace } = next_event(&mut h).await else {
            panic!("coding did not complete");
        };

        h.executor
            .execute_review_phase(task, &workspace.branch)
            .await;
        match next_event(&mut h).await {
            PhaseEvent::Failed { kind, .. } => assert_eq!(kind, FailureKind::AgentCrash),
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn condensing_harness() -> Harness {
        harness_with(
            Arc::new(Unlimited),
            ContextThresholds {
                over_bytes: 0,
                over_dependencies: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_condensed_context_reused_across_retries() {
        let mut h = condensing_harness();
        let task = h.store.create(NewTask::new("t")).await.unwrap();
        h.executor
            .execute_coding_phase(task.clone(), "slot-0", None)
            .await;
        let PhaseEvent::CodingComplete { .. } = next_event(&mut h).await else {
            panic!("coding did not complete");
        };
        assert_eq!(h.condensations.load(Ordering::SeqCst), 1);

        let (task, _) = h
            .store
            .record_failure(&task.id, FailureKind::TestFailure, "red", &BackoffPolicy::default())
            .await
            .unwrap();
        assert_eq!(task.attempts(), 1);
        h.executor
            .execute_coding_phase(task.clone(), "slot-0", None)
            .await;
        let PhaseEvent::CodingComplete { task, workspace } = next_event(&mut h).await else {
            panic!("retry did not complete");
        };
        assert_eq!(task.attempts(), 1);
        assert_eq!(h.condensations.load(Ordering::SeqCst), 1);

        let input = std::fs::read_to_string(artifact::input_path(
            &artifact::workspace_artifact_dir(&workspace.path),
        ))
        .unwrap();
        assert!(input.contains("\"condensed\": true"));
    }

    #[tokio::test]
    async fn test_stale_condensed_context_is_rebuilt() {
        let h = condensing_harness();
        let dep = h.store.create(NewTask::new("dep")).await.unwrap();
        let task = h.store.create(NewTask::new("t")).await.unwrap();

        let first = h.executor.context_for(&task.id).await.unwrap();
        assert!(first.condensed);
        h.executor.context_for(&task.id).await.unwrap();
        assert_eq!(h.condensations.load(Ordering::SeqCst), 1);

        h.store
            .add_dependency(&task.id, &dep.id, DependencyType::Related)
            .await
            .unwrap();
        let refreshed = h.executor.context_for(&task.id).await.unwrap();
        assert_eq!(refreshed.dependencies.len(), 1);
        assert_eq!(h.condensations.load(Ordering::SeqCst), 2);

        h.executor.forget_task(&task.id).await;
        assert!(h.executor.inner.condensed.lock().await.is_empty());
        h.executor.context_for(&task.id).await.unwrap();
        assert_eq!(h.condensations.load(Ordering::SeqCst), 3);
    }
}
