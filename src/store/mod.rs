//! Task store: a persistent dependency graph with a computed ready queue.
//!
//! A [`TaskStore`] is bound to one project. Every mutation acquires the
//! project's [`WriteLock`] first, runs inside a single SQLite transaction,
//! and only after commit publishes a [`TaskEvent`] on the [`EventBus`].
//! Reads (`ready`, `get`, `list`, ...) never take the lock.

pub mod db;
pub mod events;
pub mod lock;
pub mod models;
pub mod ready;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::backoff::{BackoffDecision, BackoffPolicy};
use crate::errors::{FailureKind, StoreError};

pub use db::{DbHandle, TaskDb};
pub use events::{ChangeKind, ChangeSink, EventBus, LoggingSink, TaskEvent, spawn_sink};
pub use lock::{WriteGuard, WriteLock};
pub use models::*;
pub use ready::compute_ready;

/// Prefix for generated root task ids.
pub const DEFAULT_ID_PREFIX: &str = "tf";

type Changes = Vec<(ChangeKind, Task)>;

#[derive(Clone)]
pub struct TaskStore {
    project_id: String,
    db: DbHandle,
    lock: WriteLock,
    events: EventBus,
}

impl TaskStore {
    pub fn new(project_id: impl Into<String>, db: DbHandle, lock: WriteLock, events: EventBus) -> Self {
        Self {
            project_id: project_id.into(),
            db,
            lock,
            events,
        }
    }

    /// Open the database at `path` with a fresh lock and event bus.
    pub fn open(path: &Path, project_id: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self::new(
            project_id,
            DbHandle::open(path)?,
            WriteLock::new(),
            EventBus::default(),
        ))
    }

    pub fn in_memory(project_id: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self::new(
            project_id,
            DbHandle::in_memory()?,
            WriteLock::new(),
            EventBus::default(),
        ))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Resolve once every mutation queued before this call has finished.
    pub async fn idle(&self) {
        self.lock.idle().await
    }

    /// Serialize `f` behind the write lock, run it in one transaction, and
    /// publish its changes once committed.
    async fn mutate<R, F>(&self, op: &'static str, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&TaskDb, &str) -> Result<(R, Changes), StoreError> + Send + 'static,
    {
        let _guard = self.lock.acquire().await;
        let project = self.project_id.clone();
        let (result, changes) = self
            .db
            .call(move |db| db.transaction(|db| f(db, &project)))
            .await
            .inspect_err(|e| {
                tracing::debug!(project_id = %self.project_id, op, error = %e, "store mutation failed")
            })?;
        for (kind, task) in changes {
            self.events.publish(TaskEvent {
                project_id: self.project_id.clone(),
                kind,
                task,
            });
        }
        Ok(result)
    }

    // ── Create ────────────────────────────────────────────────────────

    pub async fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        self.mutate("create", move |db, project| {
            let task = build_task(db, project, new, Utc::now())?;
            db.insert_task(&task)?;
            tracing::info!(project_id = project, task_id = %task.id, status = %task.status, "task created");
            Ok((task.clone(), vec![(ChangeKind::Created, task)]))
        })
        .await
    }

    /// Create several tasks atomically; either all exist afterwards or none.
    pub async fn create_batch(&self, batch: Vec<NewTask>) -> Result<Vec<Task>, StoreError> {
        self.mutate("create_batch", move |db, project| {
            let now = Utc::now();
            let mut created = Vec::with_capacity(batch.len());
            for new in batch {
                let task = build_task(db, project, new, now)?;
                db.insert_task(&task)?;
                created.push(task);
            }
            tracing::info!(project_id = project, count = created.len(), "task batch created");
            let changes = created
                .iter()
                .cloned()
                .map(|t| (ChangeKind::Created, t))
                .collect();
            Ok((created, changes))
        })
        .await
    }

    // ── Update / lifecycle ────────────────────────────────────────────

    pub async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let id = id.to_string();
        self.mutate("update", move |db, project| {
            let now = Utc::now();
            let mut task = db.require_task(project, &id)?;
            let before = task.status;
            let was_gated = awaiting_approval(&task);
            update.apply(&mut task, now)?;
            db.save_task(&task)?;
            if task.status != TaskStatus::InProgress {
                db.delete_assignment(project, &id)?;
            }
            if before != task.status {
                tracing::info!(project_id = project, task_id = %id, from = %before, to = %task.status, "task status changed");
            }
            let kind = if task.status == TaskStatus::Closed {
                ChangeKind::Closed
            } else {
                ChangeKind::Updated
            };
            let mut changes = vec![(kind, task.clone())];
            if was_gated && task.is_epic() && task.status == TaskStatus::Open {
                let released = release_approval_gate(db, project, &id, now)?;
                changes.extend(released.into_iter().map(|t| (ChangeKind::Updated, t)));
            }
            Ok((task, changes))
        })
        .await
    }

    /// Close a task. Closing an already-closed task is rejected.
    pub async fn close(&self, id: &str, reason: Option<&str>) -> Result<Task, StoreError> {
        let id = id.to_string();
        let reason = reason.map(str::to_string);
        self.mutate("close", move |db, project| {
            let mut task = db.require_task(project, &id)?;
            task.transition(TaskStatus::Closed, Utc::now())?;
            if let Some(reason) = &reason {
                task.extensions
                    .insert(ext::CLOSE_REASON, serde_json::Value::from(reason.as_str()));
            }
            db.save_task(&task)?;
            db.delete_assignment(project, &id)?;
            tracing::info!(project_id = project, task_id = %id, "task closed");
            Ok((task.clone(), vec![(ChangeKind::Closed, task)]))
        })
        .await
    }

    pub async fn block(&self, id: &str, kind: BlockKind, reason: &str) -> Result<Task, StoreError> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.mutate("block", move |db, project| {
            let mut task = db.require_task(project, &id)?;
            task.transition(TaskStatus::Blocked, Utc::now())?;
            task.block_kind = Some(kind);
            task.block_reason = Some(reason);
            db.save_task(&task)?;
            tracing::warn!(project_id = project, task_id = %id, kind = kind.as_str(), "task blocked");
            Ok((task.clone(), vec![(ChangeKind::Updated, task)]))
        })
        .await
    }

    /// Manually clear a block. Starts a fresh attempt cycle. Unblocking an
    /// epic that awaits approval approves it.
    pub async fn unblock(&self, id: &str) -> Result<Task, StoreError> {
        let id = id.to_string();
        self.mutate("unblock", move |db, project| {
            let now = Utc::now();
            let mut task = db.require_task(project, &id)?;
            let was_gated = awaiting_approval(&task);
            task.transition(TaskStatus::Open, now)?;
            task.last_auto_retry_at = None;
            task.extensions.set_attempts(0);
            task.extensions.set_auto_retries(0);
            db.save_task(&task)?;
            tracing::info!(project_id = project, task_id = %id, "task unblocked");
            let mut changes = vec![(ChangeKind::Updated, task.clone())];
            if was_gated && task.is_epic() {
                let released = release_approval_gate(db, project, &id, now)?;
                changes.extend(released.into_iter().map(|t| (ChangeKind::Updated, t)));
            }
            Ok((task, changes))
        })
        .await
    }

    /// Open an epic and every descendant still waiting on its approval.
    pub async fn approve(&self, epic_id: &str) -> Result<Vec<Task>, StoreError> {
        let epic_id = epic_id.to_string();
        self.mutate("approve", move |db, project| {
            let epic = db.require_task(project, &epic_id)?;
            if !epic.is_epic() {
                return Err(StoreError::InvalidData(format!("{} is not an epic", epic_id)));
            }
            let opened = release_approval_gate(db, project, &epic_id, Utc::now())?;
            tracing::info!(project_id = project, epic_id = %epic_id, opened = opened.len(), "epic approved");
            let changes = opened
                .iter()
                .cloned()
                .map(|t| (ChangeKind::Updated, t))
                .collect();
            Ok((opened, changes))
        })
        .await
    }

    /// Record a failed attempt and apply the backoff decision in one
    /// mutation. An `in_progress` task is reverted to `open` first.
    pub async fn record_failure(
        &self,
        id: &str,
        kind: FailureKind,
        reason: &str,
        policy: &BackoffPolicy,
    ) -> Result<(Task, BackoffDecision), StoreError> {
        let id = id.to_string();
        let reason = reason.to_string();
        let policy = policy.clone();
        self.mutate("record_failure", move |db, project| {
            let now = Utc::now();
            let mut task = db.require_task(project, &id)?;
            if task.status == TaskStatus::InProgress {
                task.transition(TaskStatus::Open, now)?;
            }
            if kind.counts_as_attempt() {
                task.extensions.set_attempts(task.attempts() + 1);
            }
            task.extensions.set_last_failure(&FailureRecord {
                kind,
                reason: reason.clone(),
                at: now,
            });

            let attempts = task.attempts();
            let decision = policy.decide(attempts, task.priority, kind);
            match &decision {
                BackoffDecision::Retry { .. } => {}
                BackoffDecision::Deprioritize { priority } => task.priority = *priority,
                BackoffDecision::Block => {
                    task.transition(TaskStatus::Blocked, now)?;
                    task.block_kind = Some(if kind.is_technical() {
                        BlockKind::Technical
                    } else {
                        BlockKind::Human
                    });
                    task.block_reason =
                        Some(format!("{} failed attempts; last {}: {}", attempts, kind, reason));
                }
            }
            db.save_task(&task)?;
            db.delete_assignment(project, &id)?;
            tracing::info!(
                project_id = project,
                task_id = %id,
                failure = %kind,
                attempts,
                priority = task.priority,
                decision = ?decision,
                "task attempt failed"
            );
            Ok(((task.clone(), decision), vec![(ChangeKind::Updated, task)]))
        })
        .await
    }

    /// Re-open technical blocks whose idle interval has elapsed.
    pub async fn auto_retry_sweep(
        &self,
        now: DateTime<Utc>,
        policy: &BackoffPolicy,
    ) -> Result<Vec<Task>, StoreError> {
        let policy = policy.clone();
        self.mutate("auto_retry_sweep", move |db, project| {
            let filter = TaskFilter {
                status: Some(TaskStatus::Blocked),
                ..Default::default()
            };
            let mut retried = Vec::new();
            for mut task in db.list_tasks(project, &filter)? {
                if !policy.auto_retry_due(&task, now) {
                    continue;
                }
                task.transition(TaskStatus::Open, now)?;
                task.last_auto_retry_at = Some(now);
                task.extensions.set_attempts(0);
                task.extensions
                    .set_auto_retries(task.extensions.auto_retries() + 1);
                db.save_task(&task)?;
                tracing::info!(
                    project_id = project,
                    task_id = %task.id,
                    auto_retries = task.extensions.auto_retries(),
                    "blocked task automatically retried"
                );
                retried.push(task);
            }
            let changes = retried
                .iter()
                .cloned()
                .map(|t| (ChangeKind::Updated, t))
                .collect();
            Ok((retried, changes))
        })
        .await
    }

    /// Revert tasks a previous process left `in_progress`. Attempts are not
    /// incremented; the interrupted run is not the task's fault.
    pub async fn recover_in_progress(&self) -> Result<Vec<Task>, StoreError> {
        self.mutate("recover_in_progress", move |db, project| {
            let now = Utc::now();
            let filter = TaskFilter {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            };
            let mut recovered = Vec::new();
            for mut task in db.list_tasks(project, &filter)? {
                task.transition(TaskStatus::Open, now)?;
                db.save_task(&task)?;
                db.delete_assignment(project, &task.id)?;
                tracing::warn!(project_id = project, task_id = %task.id, "recovered stale in-progress task");
                recovered.push(task);
            }
            let changes = recovered
                .iter()
                .cloned()
                .map(|t| (ChangeKind::Updated, t))
                .collect();
            Ok((recovered, changes))
        })
        .await
    }

    // ── Dependencies ──────────────────────────────────────────────────

    pub async fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        dep_type: DependencyType,
    ) -> Result<Dependency, StoreError> {
        if task_id == depends_on {
            return Err(StoreError::SelfDependency {
                id: task_id.to_string(),
            });
        }
        let task_id = task_id.to_string();
        let depends_on = depends_on.to_string();
        self.mutate("add_dependency", move |db, project| {
            let task = db.require_task(project, &task_id)?;
            db.require_task(project, &depends_on)?;
            if dep_type.affects_scheduling() {
                let edges = db.all_dependencies(project)?;
                if blocks_path_exists(&edges, &depends_on, &task_id) {
                    return Err(StoreError::DependencyCycle {
                        id: task_id,
                        depends_on,
                    });
                }
            }
            let dep = Dependency {
                task_id: task_id.clone(),
                depends_on_id: depends_on.clone(),
                dep_type,
                created_at: Utc::now(),
            };
            db.insert_dependency(project, &dep)?;
            tracing::debug!(project_id = project, task_id = %task_id, depends_on = %depends_on, dep_type = %dep_type, "dependency added");
            Ok((dep, vec![(ChangeKind::Updated, task)]))
        })
        .await
    }

    pub async fn remove_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        dep_type: DependencyType,
    ) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        let depends_on = depends_on.to_string();
        self.mutate("remove_dependency", move |db, project| {
            let task = db.require_task(project, &task_id)?;
            let removed = db.delete_dependency(project, &task_id, &depends_on, dep_type)?;
            let changes = if removed {
                vec![(ChangeKind::Updated, task)]
            } else {
                Vec::new()
            };
            Ok((removed, changes))
        })
        .await
    }

    // ── Delete ────────────────────────────────────────────────────────

    /// Delete one task. Rejected while other tasks depend on it or it has
    /// children.
    pub async fn delete(&self, id: &str) -> Result<Task, StoreError> {
        let mut deleted = self.delete_batch(&[id]).await?;
        deleted
            .pop()
            .ok_or_else(|| StoreError::not_found(&self.project_id, id))
    }

    /// Delete a set of tasks atomically. References from inside the set are
    /// allowed; references from outside it reject the whole batch.
    pub async fn delete_batch(&self, ids: &[&str]) -> Result<Vec<Task>, StoreError> {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        self.mutate("delete_batch", move |db, project| {
            let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let all = db.list_tasks(project, &TaskFilter::default())?;
            let mut deleted = Vec::with_capacity(ids.len());
            for id in &ids {
                let task = db.require_task(project, id)?;
                let mut referenced_by: Vec<String> = db
                    .dependents_of(project, id)?
                    .into_iter()
                    .map(|d| d.task_id)
                    .filter(|t| !doomed.contains(t.as_str()))
                    .collect();
                referenced_by.extend(
                    all.iter()
                        .filter(|t| t.parent_id() == Some(id.as_str()))
                        .filter(|t| !doomed.contains(t.id.as_str()))
                        .map(|t| t.id.clone()),
                );
                if !referenced_by.is_empty() {
                    referenced_by.sort();
                    referenced_by.dedup();
                    return Err(StoreError::StillReferenced {
                        id: id.clone(),
                        referenced_by,
                    });
                }
                deleted.push(task);
            }
            // Outgoing edges go with their owner, and every incoming edge
            // was checked to come from inside the batch.
            for task in &deleted {
                db.delete_task(project, &task.id)?;
            }
            tracing::info!(project_id = project, count = deleted.len(), "tasks deleted");
            let changes = deleted
                .iter()
                .cloned()
                .map(|t| (ChangeKind::Deleted, t))
                .collect();
            Ok((deleted, changes))
        })
        .await
    }

    /// Remove this project's entire graph. Returns the number of tasks deleted.
    pub async fn delete_project(&self) -> Result<usize, StoreError> {
        self.mutate("delete_project", move |db, project| {
            let all = db.list_tasks(project, &TaskFilter::default())?;
            let count = db.delete_project(project)?;
            tracing::warn!(project_id = project, count, "project graph deleted");
            let changes = all.into_iter().map(|t| (ChangeKind::Deleted, t)).collect();
            Ok((count, changes))
        })
        .await
    }

    // ── Assignments & reviews ─────────────────────────────────────────

    pub async fn record_assignment(&self, assignment: Assignment) -> Result<(), StoreError> {
        self.mutate("record_assignment", move |db, project| {
            db.require_task(project, &assignment.task_id)?;
            db.upsert_assignment(project, &assignment)?;
            Ok(((), Vec::new()))
        })
        .await
    }

    /// Release the agent slot while the task itself stays `in_progress`.
    pub async fn clear_assignment(&self, task_id: &str) -> Result<(), StoreError> {
        let task_id = task_id.to_string();
        self.mutate("clear_assignment", move |db, project| {
            db.delete_assignment(project, &task_id)?;
            Ok(((), Vec::new()))
        })
        .await
    }

    pub async fn record_review(&self, review: ReviewRecord) -> Result<(), StoreError> {
        self.mutate("record_review", move |db, project| {
            db.require_task(project, &review.task_id)?;
            db.insert_review(project, &review)?;
            Ok(((), Vec::new()))
        })
        .await
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Result<Task, StoreError> {
        let project = self.project_id.clone();
        let id = id.to_string();
        self.db.call(move |db| db.require_task(&project, &id)).await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let project = self.project_id.clone();
        self.db.call(move |db| db.list_tasks(&project, &filter)).await
    }

    pub async fn children(&self, parent: &str) -> Result<Vec<Task>, StoreError> {
        self.list(TaskFilter {
            parent: Some(parent.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn blocked(&self) -> Result<Vec<Task>, StoreError> {
        self.list(TaskFilter {
            status: Some(TaskStatus::Blocked),
            ..Default::default()
        })
        .await
    }

    /// Tasks eligible for dispatch, highest priority first.
    pub async fn ready(&self) -> Result<Vec<Task>, StoreError> {
        let project = self.project_id.clone();
        let (tasks, deps) = self.db.call(move |db| db.snapshot(&project)).await?;
        Ok(compute_ready(&tasks, &deps))
    }

    pub async fn dependencies(&self, id: &str) -> Result<Vec<Dependency>, StoreError> {
        let project = self.project_id.clone();
        let id = id.to_string();
        self.db
            .call(move |db| {
                db.require_task(&project, &id)?;
                db.dependencies_of(&project, &id)
            })
            .await
    }

    pub async fn dependents(&self, id: &str) -> Result<Vec<Dependency>, StoreError> {
        let project = self.project_id.clone();
        let id = id.to_string();
        self.db
            .call(move |db| {
                db.require_task(&project, &id)?;
                db.dependents_of(&project, &id)
            })
            .await
    }

    pub async fn reviews(&self, id: &str) -> Result<Vec<ReviewRecord>, StoreError> {
        let project = self.project_id.clone();
        let id = id.to_string();
        self.db.call(move |db| db.list_reviews(&project, &id)).await
    }

    pub async fn active_assignments(&self) -> Result<Vec<Assignment>, StoreError> {
        let project = self.project_id.clone();
        self.db.call(move |db| db.list_assignments(&project)).await
    }
}

fn build_task(
    db: &TaskDb,
    project: &str,
    new: NewTask,
    now: DateTime<Utc>,
) -> Result<Task, StoreError> {
    if new.title.trim().is_empty() {
        return Err(StoreError::InvalidData("task title must not be empty".into()));
    }
    validate_priority(new.priority)?;

    let id = match &new.parent {
        Some(parent) => {
            db.require_task(project, parent)?;
            format!("{}.{}", parent, db.max_child_seq(project, parent)? + 1)
        }
        None => loop {
            let candidate = format!("{}-{}", DEFAULT_ID_PREFIX, &uuid::Uuid::new_v4().simple().to_string()[..8]);
            if db.get_task(project, &candidate)?.is_none() {
                break candidate;
            }
        },
    };

    let awaiting_approval = if new.task_type == TaskType::Epic {
        !new.approved
    } else {
        governing_epic_unapproved(db, project, &id)?
    };

    let mut task = Task {
        id,
        project_id: project.to_string(),
        title: new.title,
        description: new.description,
        task_type: new.task_type,
        status: TaskStatus::Open,
        priority: new.priority,
        assignee: None,
        labels: new.labels,
        extensions: new.extensions,
        block_kind: None,
        block_reason: None,
        blocked_at: None,
        last_auto_retry_at: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    };
    if awaiting_approval {
        task.transition(TaskStatus::Blocked, now)?;
        task.block_kind = Some(BlockKind::Approval);
        task.block_reason = Some("awaiting epic approval".into());
    }
    Ok(task)
}

fn awaiting_approval(task: &Task) -> bool {
    task.status == TaskStatus::Blocked && task.block_kind == Some(BlockKind::Approval)
}

fn governing_epic_unapproved(db: &TaskDb, project: &str, id: &str) -> Result<bool, StoreError> {
    for ancestor in ancestors(id) {
        if let Some(task) = db.get_task(project, ancestor)?
            && task.is_epic()
        {
            return Ok(awaiting_approval(&task));
        }
    }
    Ok(false)
}

/// Open every task still waiting on `epic_id`'s approval, the epic included
/// when it is itself still gated.
fn release_approval_gate(
    db: &TaskDb,
    project: &str,
    epic_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, StoreError> {
    let all = db.list_tasks(project, &TaskFilter::default())?;
    let by_id: HashMap<&str, &Task> = all.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut opened = Vec::new();
    for task in all.iter().filter(|t| awaiting_approval(t)) {
        let governed = task.id == epic_id
            || ready::nearest_epic(&task.id, &by_id).is_some_and(|e| e.id == epic_id);
        if governed {
            let mut task = task.clone();
            task.transition(TaskStatus::Open, now)?;
            db.save_task(&task)?;
            opened.push(task);
        }
    }
    Ok(opened)
}

/// Whether `from` already (transitively) waits on `to` through `blocks` edges.
fn blocks_path_exists(edges: &[Dependency], from: &str, to: &str) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges.iter().filter(|e| e.dep_type.affects_scheduling()) {
        adjacency
            .entry(edge.task_id.as_str())
            .or_default()
            .push(edge.depends_on_id.as_str());
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if current == to {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(current) {
            queue.extend(next.iter().copied());
        }
    }
    false
}
