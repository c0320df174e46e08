//! Context assembled for an agent alongside its task.
//!
//! A bundle carries the task's epic, the tasks it depends on (with the files
//! they actually touched), and its siblings. Large bundles are condensed
//! before handoff; see [`ContextThresholds`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ContextSection;
use crate::store::{Task, TaskStatus, TaskStore, ancestors};

/// Descriptions longer than this are cut when condensing.
const CONDENSED_DESCRIPTION_CHARS: usize = 400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Files the task touched when it merged, or its predicted scope.
    pub files: Vec<String>,
}

impl TaskSummary {
    pub fn of(task: &Task) -> Self {
        let actual = task.extensions.actual_files();
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            files: if actual.is_empty() {
                task.extensions.files()
            } else {
                actual
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextBundle {
    pub task_id: String,
    pub epic: Option<TaskSummary>,
    pub dependencies: Vec<TaskSummary>,
    pub siblings: Vec<TaskSummary>,
    pub predicted_files: Vec<String>,
    pub condensed: bool,
}

impl ContextBundle {
    /// Serialized size, the measure the condensation threshold applies to.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextThresholds {
    pub over_bytes: usize,
    pub over_dependencies: usize,
}

impl ContextThresholds {
    pub fn exceeded_by(&self, bundle: &ContextBundle) -> bool {
        !bundle.condensed
            && (bundle.dependencies.len() > self.over_dependencies
                || bundle.size_bytes() > self.over_bytes)
    }
}

impl From<&ContextSection> for ContextThresholds {
    fn from(section: &ContextSection) -> Self {
        Self {
            over_bytes: section.condense_over_bytes,
            over_dependencies: section.condense_over_dependencies,
        }
    }
}

#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build_context(&self, task_id: &str) -> Result<ContextBundle>;

    async fn condense_context(&self, bundle: ContextBundle) -> Result<ContextBundle>;
}

/// Builds bundles from the task graph.
pub struct StoreContextBuilder {
    store: TaskStore,
}

impl StoreContextBuilder {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContextBuilder for StoreContextBuilder {
    async fn build_context(&self, task_id: &str) -> Result<ContextBundle> {
        let task = self.store.get(task_id).await?;

        let mut epic = None;
        for ancestor in ancestors(&task.id) {
            let candidate = self.store.get(ancestor).await?;
            if candidate.is_epic() {
                epic = Some(TaskSummary::of(&candidate));
                break;
            }
        }

        let mut dependencies = Vec::new();
        for dep in self.store.dependencies(&task.id).await? {
            match self.store.get(&dep.depends_on_id).await {
                Ok(target) => dependencies.push(TaskSummary::of(&target)),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(task_id, missing = %dep.depends_on_id, "dependency target gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let siblings = match task.parent_id() {
            Some(parent) => self
                .store
                .children(parent)
                .await?
                .iter()
                .filter(|t| t.id != task.id)
                .map(TaskSummary::of)
                .collect(),
            None => Vec::new(),
        };

        Ok(ContextBundle {
            task_id: task.id.clone(),
            epic,
            dependencies,
            siblings,
            predicted_files: task.extensions.files(),
            condensed: false,
        })
    }

    /// Cut descriptions and keep only the sibling headlines.
    async fn condense_context(&self, mut bundle: ContextBundle) -> Result<ContextBundle> {
        if let Some(epic) = bundle.epic.as_mut() {
            truncate(&mut epic.description);
        }
        for dep in &mut bundle.dependencies {
            truncate(&mut dep.description);
        }
        for sibling in &mut bundle.siblings {
            sibling.description.clear();
            sibling.files.clear();
        }
        bundle.condensed = true;
        Ok(bundle)
    }
}

fn truncate(text: &mut String) {
    if let Some((idx, _)) = text.char_indices().nth(CONDENSED_DESCRIPTION_CHARS) {
        text.truncate(idx);
        text.push_str(" [...]");
    }
}
