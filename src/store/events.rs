use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::models::Task;

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Closed,
    Deleted,
}

/// A committed change to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub project_id: String,
    pub kind: ChangeKind,
    pub task: Task,
}

/// Fan-out of task changes. Publishing never blocks and never fails: a slow
/// subscriber lags and loses old events instead of stalling the writer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        if self.tx.send(event).is_err() {
            tracing::trace!("task event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

/// Observer of task changes (UI push, metrics, audit...).
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn on_task_change(&self, event: &TaskEvent);
}

/// Writes every change to the tracing log.
pub struct LoggingSink;

#[async_trait]
impl ChangeSink for LoggingSink {
    async fn on_task_change(&self, event: &TaskEvent) {
        tracing::info!(
            project_id = %event.project_id,
            task_id = %event.task.id,
            kind = ?event.kind,
            status = %event.task.status,
            priority = event.task.priority,
            "task changed"
        );
    }
}

/// Drain `rx` into `sink` on its own task until the bus is dropped.
pub fn spawn_sink(
    mut rx: broadcast::Receiver<TaskEvent>,
    sink: Arc<dyn ChangeSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => sink.on_task_change(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change sink lagging; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
