use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use crate::agent::{FinalReviewStatus, FinalReviewer};
use crate::store::{
    ChangeKind, Task, TaskEvent, TaskFilter, TaskStatus, TaskStore, TaskType, ancestors,
};

/// Runs an epic's final review once its last open task closes. A closing
/// sub-epic counts as a closing task of the epic above it.
///
/// `pass` closes the epic. `issues` files the proposed follow-ups as new
/// children of the epic and wakes the scheduler through `notify`.
pub struct EpicCompletionWatcher {
    store: TaskStore,
    reviewer: Arc<dyn FinalReviewer>,
    trunk: PathBuf,
    notify: Arc<Notify>,
}

impl EpicCompletionWatcher {
    pub fn new(
        store: TaskStore,
        reviewer: Arc<dyn FinalReviewer>,
        trunk: PathBuf,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            reviewer,
            trunk,
            notify,
        }
    }

    /// Consume `Closed` events until the store's bus shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut rx = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Err(broadcast::error::RecvError::Closed) => break,
                    received => self.handle(received).await,
                }
            }
        })
    }

    async fn handle(&self, received: Result<TaskEvent, broadcast::error::RecvError>) {
        match received {
            Ok(event) if event.kind == ChangeKind::Closed => {
                if let Err(e) = self.on_task_closed(&event.task).await {
                    tracing::error!(task_id = %event.task.id, error = %format!("{:#}", e), "epic completion check failed");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "epic watcher lagged behind task events; rescanning epics");
                if let Err(e) = self.rescan().await {
                    tracing::error!(error = %format!("{:#}", e), "epic rescan failed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }

    /// Check the epic governing a closed task (for a closed epic, the epic
    /// above it) and review it if nothing under it is left open. Returns the
    /// review status when a review ran.
    async fn on_task_closed(&self, task: &Task) -> Result<Option<FinalReviewStatus>> {
        match self.governing_epic(task).await? {
            Some(epic) => self.evaluate(epic).await,
            None => Ok(None),
        }
    }

    /// Evaluate every open epic. Recovers reviews whose trigger event was
    /// dropped. Returns how many reviews ran.
    async fn rescan(&self) -> Result<usize> {
        let epics = self
            .store
            .list(TaskFilter {
                status: Some(TaskStatus::Open),
                task_type: Some(TaskType::Epic),
                ..Default::default()
            })
            .await?;
        let mut reviewed = 0;
        for epic in epics {
            if self.evaluate(epic).await?.is_some() {
                reviewed += 1;
            }
        }
        Ok(reviewed)
    }

    async fn evaluate(&self, epic: Task) -> Result<Option<FinalReviewStatus>> {
        if epic.status != TaskStatus::Open {
            return Ok(None);
        }

        let prefix = format!("{}.", epic.id);
        let descendants: Vec<Task> = self
            .store
            .list(TaskFilter::default())
            .await?
            .into_iter()
            .filter(|t| t.id.starts_with(&prefix))
            .collect();
        let outstanding = descendants
            .iter()
            .filter(|t| t.status != TaskStatus::Closed)
            .count();
        if descendants.is_empty() || outstanding > 0 {
            tracing::debug!(epic_id = %epic.id, outstanding, "epic still has open work");
            return Ok(None);
        }

        tracing::info!(epic_id = %epic.id, "all epic tasks closed; running final review");
        let project_id = self.store.project_id().to_string();
        let review = match self.reviewer.review(&project_id, &epic.id, &self.trunk).await {
            Ok(review) => review,
            Err(e) => {
                tracing::error!(epic_id = %epic.id, error = %e, "final review failed; epic left open");
                return Ok(None);
            }
        };

        match review.status {
            FinalReviewStatus::Pass => {
                self.store.close(&epic.id, Some("final review passed")).await?;
                tracing::info!(epic_id = %epic.id, "epic closed");
            }
            FinalReviewStatus::Issues if review.proposed_tasks.is_empty() => {
                tracing::warn!(epic_id = %epic.id, summary = ?review.summary, "final review found issues but proposed no tasks; epic left open");
            }
            FinalReviewStatus::Issues => {
                let batch = review
                    .proposed_tasks
                    .into_iter()
                    .map(|p| p.into_new_task(&epic.id))
                    .collect();
                let created = self.store.create_batch(batch).await?;
                tracing::info!(epic_id = %epic.id, created = created.len(), "final review filed follow-up tasks");
                self.notify.notify_one();
            }
        }
        Ok(Some(review.status))
    }

    async fn governing_epic(&self, task: &Task) -> Result<Option<Task>> {
        for id in ancestors(&task.id) {
            match self.store.get(id).await {
                Ok(ancestor) if ancestor.is_epic() => return Ok(Some(ancestor)),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FinalReview, ProposedTask};
    use crate::store::NewTask;
    use crate::testing::MockReviewer;
    use std::time::Duration;

    fn watcher(store: &TaskStore, reviewer: Arc<MockReviewer>) -> (EpicCompletionWatcher, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (
            EpicCompletionWatcher::new(store.clone(), reviewer, PathBuf::from("/trunk"), notify.clone()),
            notify,
        )
    }

    async fn close_in_progress(store: &TaskStore, id: &str) -> Task {
        store
            .update(id, crate::store::TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap();
        store.close(id, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_review_waits_for_last_child() {
        let store = TaskStore::in_memory("p").unwrap();
        let epic = store.create(NewTask::epic("E").approved()).await.unwrap();
        let a = store.create(NewTask::new("a").with_parent(&epic.id)).await.unwrap();
        let b = store.create(NewTask::new("b").with_parent(&epic.id)).await.unwrap();
        let reviewer = Arc::new(MockReviewer::new());
        let (watcher, _) = watcher(&store, reviewer.clone());

        let a = close_in_progress(&store, &a.id).await;
        assert_eq!(watcher.on_task_closed(&a).await.unwrap(), None);
        assert!(reviewer.calls().is_empty());

        let b = close_in_progress(&store, &b.id).await;
        assert_eq!(
            watcher.on_task_closed(&b).await.unwrap(),
            Some(FinalReviewStatus::Pass)
        );
        assert_eq!(reviewer.calls(), vec![epic.id.clone()]);
        assert_eq!(store.get(&epic.id).await.unwrap().status, TaskStatus::Closed);
    }

    #[tokio::test]
    async fn test_issues_create_children_and_notify() {
        let store = TaskStore::in_memory("p").unwrap();
        let epic = store.create(NewTask::epic("E").approved()).await.unwrap();
        let a = store.create(NewTask::new("a").with_parent(&epic.id)).await.unwrap();
        let reviewer = Arc::new(MockReviewer::new());
        reviewer.push(Ok(FinalReview {
            status: FinalReviewStatus::Issues,
            proposed_tasks: vec![ProposedTask {
                title: "Handle empty input".into(),
                description: String::new(),
                priority: Some(1),
                files: vec![],
            }],
            summary: None,
        }));
        let (watcher, notify) = watcher(&store, reviewer);
        let woken = notify.notified();

        let a = close_in_progress(&store, &a.id).await;
        assert_eq!(
            watcher.on_task_closed(&a).await.unwrap(),
            Some(FinalReviewStatus::Issues)
        );
        tokio::time::timeout(Duration::from_secs(1), woken)
            .await
            .expect("scheduler was not notified");

        assert_eq!(store.get(&epic.id).await.unwrap().status, TaskStatus::Open);
        let ready = store.ready().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].title, "Handle empty input");
        assert_eq!(ready[0].priority, 1);
        assert!(ready[0].id.starts_with(&format!("{}.", epic.id)));
    }

    #[tokio::test]
    async fn test_review_error_leaves_epic_open() {
        let store = TaskStore::in_memory("p").unwrap();
        let epic = store.create(NewTask::epic("E").approved()).await.unwrap();
        let a = store.create(NewTask::new("a").with_parent(&epic.id)).await.unwrap();
        let reviewer = Arc::new(MockReviewer::new());
        reviewer.push(Err("agent crashed".into()));
        let (watcher, _) = watcher(&store, reviewer);

        let a = close_in_progress(&store, &a.id).await;
        assert_eq!(watcher.on_task_closed(&a).await.unwrap(), None);
        assert_eq!(store.get(&epic.id).await.unwrap().status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_spawned_watcher_reacts_to_close_events() {
        let store = TaskStore::in_memory("p").unwrap();
        let epic = store.create(NewTask::epic("E").approved()).await.unwrap();
        let a = store.create(NewTask::new("a").with_parent(&epic.id)).await.unwrap();
        let reviewer = Arc::new(MockReviewer::new());
        let (watcher, _) = watcher(&store, reviewer);
        let _handle = watcher.spawn();

        close_in_progress(&store, &a.id).await;

        let mut closed = false;
        for _ in 0..50 {
            if store.get(&epic.id).await.unwrap().status == TaskStatus::Closed {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed, "epic was not closed by the watcher");
    }

    #[tokio::test]
    async fn test_closing_sub_epic_reviews_parent_epic() {
        let store = TaskStore::in_memory("p").unwrap();
        let outer = store.create(NewTask::epic("Outer").approved()).await.unwrap();
        let inner = store
            .create(NewTask::epic("Inner").approved().with_parent(&outer.id))
            .await
            .unwrap();
        let leaf = store.create(NewTask::new("leaf").with_parent(&inner.id)).await.unwrap();
        let reviewer = Arc::new(MockReviewer::new());
        let (watcher, _) = watcher(&store, reviewer.clone());

        let leaf = close_in_progress(&store, &leaf.id).await;
        assert_eq!(
            watcher.on_task_closed(&leaf).await.unwrap(),
            Some(FinalReviewStatus::Pass)
        );
        let inner = store.get(&inner.id).await.unwrap();
        assert_eq!(inner.status, TaskStatus::Closed);

        assert_eq!(
            watcher.on_task_closed(&inner).await.unwrap(),
            Some(FinalReviewStatus::Pass)
        );
        assert_eq!(reviewer.calls(), vec![inner.id.clone(), outer.id.clone()]);
        assert_eq!(store.get(&outer.id).await.unwrap().status, TaskStatus::Closed);
    }

    #[tokio::test]
    async fn test_lagged_watcher_rescans_finished_epics() {
        let store = TaskStore::in_memory("p").unwrap();
        let done = store.create(NewTask::epic("Done").approved()).await.unwrap();
        let busy = store.create(NewTask::epic("Busy").approved()).await.unwrap();
        let empty = store.create(NewTask::epic("Empty").approved()).await.unwrap();
        let a = store.create(NewTask::new("a").with_parent(&done.id)).await.unwrap();
        store.create(NewTask::new("b").with_parent(&busy.id)).await.unwrap();
        close_in_progress(&store, &a.id).await;
        let reviewer = Arc::new(MockReviewer::new());
        let (watcher, _) = watcher(&store, reviewer.clone());

        watcher
            .handle(Err(broadcast::error::RecvError::Lagged(3)))
            .await;

        assert_eq!(reviewer.calls(), vec![done.id.clone()]);
        assert_eq!(store.get(&done.id).await.unwrap().status, TaskStatus::Closed);
        assert_eq!(store.get(&busy.id).await.unwrap().status, TaskStatus::Open);
        assert_eq!(store.get(&empty.id).await.unwrap().status, TaskStatus::Open);
    }
}
