//! Ready-queue computation.
//!
//! A task is ready iff it is `open`, not an epic, its nearest epic ancestor is
//! not `blocked`, and every `blocks` edge out of it points at a `closed` task.
//! Result is ordered by `(priority, created_at)`.

use std::collections::HashMap;

use super::models::{Dependency, Task, TaskStatus, ancestors};

pub fn compute_ready(tasks: &[Task], deps: &[Dependency]) -> Vec<Task> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut blockers: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in deps.iter().filter(|d| d.dep_type.affects_scheduling()) {
        blockers
            .entry(dep.task_id.as_str())
            .or_default()
            .push(dep.depends_on_id.as_str());
    }

    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Open && !t.is_epic())
        .filter(|t| !epic_blocked(&t.id, &by_id))
        .filter(|t| {
            blockers.get(t.id.as_str()).is_none_or(|targets| {
                targets.iter().all(|target| {
                    by_id
                        .get(target)
                        .is_some_and(|dep| dep.status == TaskStatus::Closed)
                })
            })
        })
        .cloned()
        .collect();

    // Stable: ties keep insertion order.
    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    ready
}

/// Nearest epic ancestor of `id`, if any.
pub fn nearest_epic<'a>(id: &str, by_id: &HashMap<&str, &'a Task>) -> Option<&'a Task> {
    ancestors(id)
        .filter_map(|ancestor| by_id.get(ancestor).copied())
        .find(|t| t.is_epic())
}

fn epic_blocked(id: &str, by_id: &HashMap<&str, &Task>) -> bool {
    nearest_epic(id, by_id).is_some_and(|epic| epic.status == TaskStatus::Blocked)
}
