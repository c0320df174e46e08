//! Dispatch loop for one project.
//!
//! The orchestrator owns the single worker slot. Each iteration sweeps due
//! auto-retries, dispatches the top ready task when the slot is free, and
//! then waits for a phase outcome, a wake-up, or the poll interval:
//!
//! ```text
//! ready ─► coding ─► review ─► merge ─► closed
//!            │         │         └────► reopened (conflict)
//!            └─────────┴──► revert + backoff ─► open | deprioritized | blocked
//! ```
//!
//! On shutdown the commit queue is drained and in-flight store writes are
//! awaited. A task caught mid-phase stays `in_progress` and is recovered on
//! the next start.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};

use crate::agent::{
    AgentCommand, AgentRunner, ConflictResolver, FinalReviewer, ProcessAgentRunner,
    ProcessConflictResolver, ProcessFinalReviewer,
};
use crate::backoff::{BackoffDecision, BackoffPolicy};
use crate::commit_queue::CommitQueue;
use crate::config::TaskforgeConfig;
use crate::context::{ContextBuilder, ContextThresholds, StoreContextBuilder};
use crate::errors::FailureKind;
use crate::executor::{
    AgentCommands, CapacityGate, ChannelHost, DEFAULT_SLOT, ExecutorDeps, PhaseEvent,
    PhaseExecutor, RetryContext, Unlimited,
};
use crate::merge::{EpicCompletionWatcher, MergeCoordinator, MergeOutcome};
use crate::store::{Task, TaskStore, TaskUpdate, ext};
use crate::workspace::{GitWorkspaceManager, Workspace, WorkspaceManager};

/// Everything an [`Orchestrator`] is assembled from.
pub struct OrchestratorParts {
    pub store: TaskStore,
    pub queue: CommitQueue,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub runner: Arc<dyn AgentRunner>,
    pub context: Arc<dyn ContextBuilder>,
    pub capacity: Arc<dyn CapacityGate>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub reviewer: Arc<dyn FinalReviewer>,
    pub commands: AgentCommands,
    pub policy: BackoffPolicy,
    pub thresholds: ContextThresholds,
    pub poll_interval: Duration,
    pub trunk: PathBuf,
    pub agent_log_dir: PathBuf,
}

/// Counters for one `run_project` session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub recovered: usize,
    pub dispatched: usize,
    pub merged: usize,
    pub reopened: usize,
    pub failed: usize,
    pub blocked: usize,
    pub auto_retried: usize,
}

pub struct Orchestrator {
    store: TaskStore,
    queue: CommitQueue,
    workspaces: Arc<dyn WorkspaceManager>,
    reviewer: Arc<dyn FinalReviewer>,
    executor: PhaseExecutor,
    merge: MergeCoordinator,
    policy: BackoffPolicy,
    poll_interval: Duration,
    trunk: PathBuf,
    notify: Arc<Notify>,
    events: mpsc::UnboundedReceiver<PhaseEvent>,
    active: Option<String>,
    paused: bool,
    /// Diffs of failed attempts whose branches were deleted on revert.
    prior_diffs: HashMap<String, String>,
    stats: RunStats,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let (host, events) = ChannelHost::new();
        let executor = PhaseExecutor::new(
            ExecutorDeps {
                store: parts.store.clone(),
                workspaces: Arc::clone(&parts.workspaces),
                runner: parts.runner,
                context: parts.context,
                capacity: parts.capacity,
                host: Arc::new(host),
                queue: parts.queue.clone(),
            },
            parts.commands,
            parts.agent_log_dir,
            parts.thresholds,
        );
        let merge = MergeCoordinator::new(
            parts.store.clone(),
            Arc::clone(&parts.workspaces),
            parts.resolver,
            parts.queue.clone(),
        );
        Self {
            store: parts.store,
            queue: parts.queue,
            workspaces: parts.workspaces,
            reviewer: parts.reviewer,
            executor,
            merge,
            policy: parts.policy,
            poll_interval: parts.poll_interval,
            trunk: parts.trunk,
            notify: Arc::new(Notify::new()),
            events,
            active: None,
            paused: false,
            prior_diffs: HashMap::new(),
            stats: RunStats::default(),
        }
    }

    /// Wire the git workspace manager and process-backed agents from
    /// configuration.
    pub fn from_config(config: &TaskforgeConfig, store: TaskStore, queue: CommitQueue) -> Self {
        let runner: Arc<dyn AgentRunner> =
            Arc::new(ProcessAgentRunner::new(config.inactivity_timeout()));
        let agent = &config.toml;
        let args = agent.agent.args.clone();
        let resolver = ProcessConflictResolver::new(
            Arc::clone(&runner),
            AgentCommand::new(agent.conflict_command(), args.clone()),
            config.agent_log_dir(),
        );
        let reviewer = ProcessFinalReviewer::new(
            Arc::clone(&runner),
            AgentCommand::new(agent.final_review_command(), args.clone()),
            store.clone(),
            config.taskforge_dir.clone(),
            config.agent_log_dir(),
        );
        Self::new(OrchestratorParts {
            context: Arc::new(StoreContextBuilder::new(store.clone())),
            store,
            queue,
            workspaces: Arc::new(GitWorkspaceManager::from_config(config)),
            runner,
            capacity: Arc::new(Unlimited),
            resolver: Arc::new(resolver),
            reviewer: Arc::new(reviewer),
            commands: AgentCommands {
                coding: AgentCommand::new(agent.agent_command(), args.clone()),
                review: AgentCommand::new(agent.review_command(), args),
            },
            policy: config.backoff().clone(),
            thresholds: ContextThresholds::from(&config.toml.context),
            poll_interval: config.poll_interval(),
            trunk: config.project_dir.clone(),
            agent_log_dir: config.agent_log_dir(),
        })
    }

    /// Wakes the dispatch loop. Also clears a capacity pause.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Run until `shutdown` resolves, then shut down gracefully.
    pub async fn run_project<F>(&mut self, shutdown: F) -> Result<RunStats>
    where
        F: Future<Output = ()>,
    {
        let recovered = self.store.recover_in_progress().await?;
        self.stats.recovered = recovered.len();
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "reverted tasks interrupted by a previous run");
        }

        let watcher = EpicCompletionWatcher::new(
            self.store.clone(),
            Arc::clone(&self.reviewer),
            self.trunk.clone(),
            Arc::clone(&self.notify),
        )
        .spawn();

        tracing::info!(project_id = %self.store.project_id(), "dispatch loop started");
        tokio::pin!(shutdown);
        let mut fatal = None;
        loop {
            if self.active.is_none() && !self.paused {
                self.sweep_auto_retries().await;
                if let Err(e) = self.dispatch_next().await {
                    tracing::error!(error = %format!("{:#}", e), "dispatch failed; shutting down");
                    fatal = Some(e);
                    break;
                }
            }
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = self.notify.notified() => {
                    if self.paused {
                        tracing::info!("capacity pause cleared");
                    }
                    self.paused = false;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.shutdown().await;
        watcher.abort();
        tracing::info!(stats = ?self.stats, "dispatch loop stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }

    async fn sweep_auto_retries(&mut self) {
        match self.store.auto_retry_sweep(Utc::now(), &self.policy).await {
            Ok(retried) => self.stats.auto_retried += retried.len(),
            Err(e) => tracing::error!(error = %e, "auto-retry sweep failed"),
        }
    }

    async fn dispatch_next(&mut self) -> Result<()> {
        let Some(task) = self.store.ready().await?.into_iter().next() else {
            return Ok(());
        };
        let mut retry = RetryContext::from_task(&task);
        if let Some(diff) = self.prior_diffs.remove(&task.id) {
            retry.get_or_insert_with(RetryContext::default).prior_diff = Some(diff);
        }
        tracing::info!(
            task_id = %task.id,
            priority = task.priority,
            attempt = task.attempts(),
            retry = retry.is_some(),
            "dispatching task"
        );
        self.active = Some(task.id.clone());
        self.stats.dispatched += 1;
        self.executor
            .execute_coding_phase(task, DEFAULT_SLOT, retry)
            .await;
        Ok(())
    }

    async fn handle_event(&mut self, event: PhaseEvent) {
        match event {
            PhaseEvent::CodingComplete { task, workspace } => {
                self.executor
                    .execute_review_phase(task, &workspace.branch)
                    .await;
            }
            PhaseEvent::ReviewComplete { task, workspace } => {
                match self
                    .merge
                    .perform_merge_and_done(&task, &workspace.branch)
                    .await
                {
                    Ok(MergeOutcome::Merged { .. }) => self.stats.merged += 1,
                    Ok(MergeOutcome::Reopened { .. }) => self.stats.reopened += 1,
                    Err(e) => {
                        tracing::error!(task_id = %task.id, error = %format!("{:#}", e), "merge bookkeeping failed");
                    }
                }
                // Trunk moved under the task either way.
                self.executor.forget_task(&task.id).await;
                self.active = None;
            }
            PhaseEvent::Failed {
                task,
                workspace,
                kind,
                reason,
            } => {
                self.fail(task, workspace, kind, reason).await;
                self.active = None;
            }
            PhaseEvent::CapacityExhausted { task } => {
                tracing::warn!(task_id = %task.id, "capacity exhausted; dispatch paused until woken");
                self.paused = true;
                self.active = None;
            }
        }
    }

    /// Revert the attempt's workspace and branch, then apply backoff.
    async fn fail(&mut self, task: Task, workspace: Option<Workspace>, kind: FailureKind, reason: String) {
        self.stats.failed += 1;
        if let Some(ws) = workspace {
            match self.workspaces.capture_diff(&ws.branch).await {
                Ok(diff) if !diff.trim().is_empty() => {
                    self.prior_diffs.insert(task.id.clone(), diff);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(task_id = %task.id, error = %e, "no diff to keep from failed attempt"),
            }
            let workspaces = Arc::clone(&self.workspaces);
            let task_id = task.id.clone();
            let branch = ws.branch.clone();
            if let Err(e) = self
                .queue
                .enqueue_and_wait(format!("discard {}", ws.branch), async move {
                    if let Err(e) = workspaces.remove_workspace(&task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to remove workspace of failed attempt");
                    }
                    workspaces.delete_branch(&branch).await?;
                    Ok::<(), anyhow::Error>(())
                })
                .await
            {
                tracing::warn!(task_id = %task.id, error = %format!("{:#}", e), "failed to delete branch of failed attempt");
            }
        }

        let mut update = TaskUpdate::default();
        update.remove_extensions = vec![ext::BRANCH.to_string(), ext::CONFLICT_FILES.to_string()];
        if let Err(e) = self.store.update(&task.id, update).await {
            tracing::error!(task_id = %task.id, error = %e, "failed to clear branch of failed attempt");
        }

        match self
            .store
            .record_failure(&task.id, kind, &reason, &self.policy)
            .await
        {
            Ok((_, BackoffDecision::Block)) => {
                self.stats.blocked += 1;
                self.prior_diffs.remove(&task.id);
                self.executor.forget_task(&task.id).await;
                tracing::warn!(task_id = %task.id, failure = %kind, "task blocked after repeated failures");
            }
            Ok((updated, decision)) => {
                tracing::info!(task_id = %task.id, decision = ?decision, attempts = updated.attempts(), "task requeued");
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "failed to record task failure");
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(task_id) = &self.active {
            tracing::warn!(task_id = %task_id, "task still running at shutdown; it will be recovered on next start");
        }
        self.queue.drain().await;
        self.store.idle().await;
    }
}
