use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FailureKind, StoreError};

/// Highest scheduling priority.
pub const HIGHEST_PRIORITY: u8 = 0;
/// Lowest scheduling priority; backoff never pushes a task below this.
pub const LOWEST_PRIORITY: u8 = 4;
/// Default priority for new tasks.
pub const DEFAULT_PRIORITY: u8 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Blocked => "blocked",
        }
    }

    /// Legal edges of the task state machine. Epics may additionally close
    /// straight from `open` once their final review passes.
    pub fn can_transition_to(&self, next: TaskStatus, is_epic: bool) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Open, InProgress) => !is_epic,
            (InProgress, Open) | (InProgress, Closed) => true,
            (Open, Blocked) | (Blocked, Open) => true,
            (Open, Closed) => is_epic,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "closed" => Ok(Self::Closed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Task,
    Bug,
    Feature,
    Chore,
    Epic,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Chore => "chore",
            Self::Epic => "epic",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "chore" => Ok(Self::Chore),
            "epic" => Ok(Self::Epic),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

/// Why a task sits in `blocked`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Epic (or child of an epic) not yet approved for execution.
    Approval,
    /// Quarantined by the backoff policy after repeated technical failures.
    Technical,
    /// Flagged by a human; never retried automatically.
    Human,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Technical => "technical",
            Self::Human => "human",
        }
    }
}

impl FromStr for BlockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(Self::Approval),
            "technical" => Ok(Self::Technical),
            "human" => Ok(Self::Human),
            _ => Err(format!("Invalid block kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    ParentChild,
    Related,
    DiscoveredFrom,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::Related => "related",
            Self::DiscoveredFrom => "discovered-from",
        }
    }

    /// Only `blocks` edges gate the ready queue.
    pub fn affects_scheduling(&self) -> bool {
        matches!(self, Self::Blocks)
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(Self::Blocks),
            "parent-child" => Ok(Self::ParentChild),
            "related" => Ok(Self::Related),
            "discovered-from" => Ok(Self::DiscoveredFrom),
            _ => Err(format!("Invalid dependency type: {}", s)),
        }
    }
}

/// Well-known extension keys.
pub mod ext {
    pub const ATTEMPTS: &str = "attempts";
    pub const FILES: &str = "files";
    pub const ACTUAL_FILES: &str = "actual_files";
    pub const CONFLICT_FILES: &str = "conflict_files";
    pub const BRANCH: &str = "branch";
    pub const LAST_FAILURE: &str = "last_failure";
    pub const AUTO_RETRIES: &str = "auto_retries";
    pub const REVIEW_FEEDBACK: &str = "review_feedback";
    pub const CLOSE_REASON: &str = "close_reason";
}

/// The most recent failed attempt, kept on the task for visibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Schema-less side channel on a task.
///
/// Values are JSON so new keys need no migration; the well-known keys in
/// [`ext`] get typed accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Extensions(BTreeMap<String, Value>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of `self`, key by key.
    pub fn merge(&mut self, other: Extensions) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn attempts(&self) -> u32 {
        self.get(ext::ATTEMPTS).unwrap_or(0)
    }

    pub fn set_attempts(&mut self, attempts: u32) {
        self.insert(ext::ATTEMPTS, Value::from(attempts));
    }

    pub fn files(&self) -> Vec<String> {
        self.get(ext::FILES).unwrap_or_default()
    }

    pub fn set_files(&mut self, files: Vec<String>) {
        self.insert(ext::FILES, Value::from(files));
    }

    pub fn actual_files(&self) -> Vec<String> {
        self.get(ext::ACTUAL_FILES).unwrap_or_default()
    }

    pub fn set_actual_files(&mut self, files: Vec<String>) {
        self.insert(ext::ACTUAL_FILES, Value::from(files));
    }

    pub fn conflict_files(&self) -> Vec<String> {
        self.get(ext::CONFLICT_FILES).unwrap_or_default()
    }

    pub fn set_conflict_files(&mut self, files: Vec<String>) {
        if files.is_empty() {
            self.remove(ext::CONFLICT_FILES);
        } else {
            self.insert(ext::CONFLICT_FILES, Value::from(files));
        }
    }

    pub fn branch(&self) -> Option<String> {
        self.get(ext::BRANCH)
    }

    pub fn set_branch(&mut self, branch: Option<&str>) {
        match branch {
            Some(b) => self.insert(ext::BRANCH, Value::from(b)),
            None => {
                self.remove(ext::BRANCH);
            }
        }
    }

    pub fn last_failure(&self) -> Option<FailureRecord> {
        self.get(ext::LAST_FAILURE)
    }

    pub fn set_last_failure(&mut self, record: &FailureRecord) {
        if let Ok(value) = serde_json::to_value(record) {
            self.insert(ext::LAST_FAILURE, value);
        }
    }

    pub fn auto_retries(&self) -> u32 {
        self.get(ext::AUTO_RETRIES).unwrap_or(0)
    }

    pub fn set_auto_retries(&mut self, count: u32) {
        self.insert(ext::AUTO_RETRIES, Value::from(count));
    }

    pub fn review_feedback(&self) -> Option<String> {
        self.get(ext::REVIEW_FEEDBACK)
    }

    pub fn set_review_feedback(&mut self, feedback: &str) {
        self.insert(ext::REVIEW_FEEDBACK, Value::from(feedback));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: u8,
    pub assignee: Option<String>,
    pub labels: BTreeSet<String>,
    pub extensions: Extensions,
    pub block_kind: Option<BlockKind>,
    pub block_reason: Option<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub last_auto_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_epic(&self) -> bool {
        self.task_type == TaskType::Epic
    }

    pub fn parent_id(&self) -> Option<&str> {
        parent_id(&self.id)
    }

    pub fn attempts(&self) -> u32 {
        self.extensions.attempts()
    }

    /// Move to `next`, maintaining the timestamp and assignment invariants.
    ///
    /// `started_at` and `completed_at` are written at most once.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next, self.is_epic()) {
            return Err(StoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let prev = self.status;
        self.status = next;
        self.updated_at = now;
        match next {
            TaskStatus::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            TaskStatus::Closed => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(now);
                }
                self.assignee = None;
            }
            TaskStatus::Open => {
                if prev == TaskStatus::InProgress {
                    self.assignee = None;
                }
                if prev == TaskStatus::Blocked {
                    self.block_kind = None;
                    self.block_reason = None;
                    self.blocked_at = None;
                }
            }
            TaskStatus::Blocked => {
                self.blocked_at = Some(now);
            }
        }
        Ok(())
    }
}

/// Parent of a hierarchical id: `tf-1a2b.3.1` → `tf-1a2b.3`.
pub fn parent_id(id: &str) -> Option<&str> {
    id.rsplit_once('.').map(|(parent, _)| parent)
}

/// Ancestors of a hierarchical id, nearest first.
pub fn ancestors(id: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_id(id), |current| parent_id(current))
}

/// Fields for a task about to be created.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: u8,
    pub parent: Option<String>,
    pub labels: BTreeSet<String>,
    pub extensions: Extensions,
    /// Epics start blocked awaiting approval unless this is set.
    pub approved: bool,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            priority: DEFAULT_PRIORITY,
            ..Default::default()
        }
    }

    pub fn epic(title: impl Into<String>) -> Self {
        Self {
            task_type: TaskType::Epic,
            ..Self::new(title)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn approved(mut self) -> Self {
        self.approved = true;
        self
    }
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub status: Option<TaskStatus>,
    pub assignee: Option<Option<String>>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub extensions: Option<Extensions>,
    pub remove_extensions: Vec<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn priority(priority: u8) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn with_assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Apply to `task`. Priority and status are validated before any field
    /// changes, so a rejected update leaves `task` untouched.
    pub fn apply(self, task: &mut Task, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        if let Some(status) = self.status
            && status != task.status
        {
            task.transition(status, now)?;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(title) = self.title {
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(assignee) = self.assignee {
            task.assignee = assignee;
        }
        for label in self.add_labels {
            task.labels.insert(label);
        }
        for label in &self.remove_labels {
            task.labels.remove(label);
        }
        if let Some(extensions) = self.extensions {
            task.extensions.merge(extensions);
        }
        for key in &self.remove_extensions {
            task.extensions.remove(key);
        }
        task.updated_at = now;
        Ok(())
    }
}

pub fn validate_priority(priority: u8) -> Result<(), StoreError> {
    if priority > LOWEST_PRIORITY {
        return Err(StoreError::InvalidData(format!(
            "priority {} out of range {}..={}",
            priority, HIGHEST_PRIORITY, LOWEST_PRIORITY
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    pub task_id: String,
    pub depends_on_id: String,
    pub dep_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkPhase {
    Coding,
    Review,
}

impl WorkPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Review => "review",
        }
    }
}

impl FromStr for WorkPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coding" => Ok(Self::Coding),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid work phase: {}", s)),
        }
    }
}

/// Who is working on a task and where; persisted so a restarted process can
/// see what was in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub task_id: String,
    pub slot: String,
    pub phase: WorkPhase,
    pub branch: String,
    pub workspace_path: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    Reject,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for ReviewVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            _ => Err(format!("Invalid review verdict: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRecord {
    pub task_id: String,
    pub attempt: u32,
    pub verdict: ReviewVerdict,
    pub feedback: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus, task_type: TaskType) -> Task {
        let now = Utc::now();
        Task {
            id: "tf-abcd.1".into(),
            project_id: "p".into(),
            title: "t".into(),
            description: String::new(),
            task_type,
            status,
            priority: 2,
            assignee: None,
            labels: BTreeSet::new(),
            extensions: Extensions::new(),
            block_kind: None,
            block_reason: None,
            blocked_at: None,
            last_auto_retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Closed,
            TaskStatus::Blocked,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;
        assert!(Open.can_transition_to(InProgress, false));
        assert!(InProgress.can_transition_to(Closed, false));
        assert!(InProgress.can_transition_to(Open, false));
        assert!(Open.can_transition_to(Blocked, false));
        assert!(Blocked.can_transition_to(Open, false));

        assert!(!Open.can_transition_to(Closed, false));
        assert!(!Blocked.can_transition_to(InProgress, false));
        assert!(!Closed.can_transition_to(Open, false));
        assert!(!Closed.can_transition_to(Closed, false));
    }

    #[test]
    fn test_epic_edges() {
        use TaskStatus::*;
        assert!(Open.can_transition_to(Closed, true));
        assert!(Blocked.can_transition_to(Open, true));
        assert!(!Open.can_transition_to(InProgress, true));
    }

    #[test]
    fn test_started_at_written_once() {
        let mut t = task(TaskStatus::Open, TaskType::Task);
        let first = Utc::now();
        t.transition(TaskStatus::InProgress, first).unwrap();
        t.assignee = Some("slot-0".into());
        t.transition(TaskStatus::Open, first).unwrap();
        assert!(t.assignee.is_none());

        let later = first + chrono::Duration::seconds(60);
        t.transition(TaskStatus::InProgress, later).unwrap();
        assert_eq!(t.started_at, Some(first));

        t.transition(TaskStatus::Closed, later).unwrap();
        assert_eq!(t.completed_at, Some(later));
    }

    #[test]
    fn test_unblock_clears_block_fields() {
        let mut t = task(TaskStatus::Open, TaskType::Task);
        let now = Utc::now();
        t.transition(TaskStatus::Blocked, now).unwrap();
        t.block_kind = Some(BlockKind::Technical);
        t.block_reason = Some("3 failures".into());
        assert_eq!(t.blocked_at, Some(now));

        t.transition(TaskStatus::Open, now).unwrap();
        assert!(t.block_kind.is_none());
        assert!(t.block_reason.is_none());
        assert!(t.blocked_at.is_none());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut t = task(TaskStatus::Closed, TaskType::Task);
        let err = t.transition(TaskStatus::Closed, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_hierarchical_ids() {
        assert_eq!(parent_id("tf-1a2b.3.1"), Some("tf-1a2b.3"));
        assert_eq!(parent_id("tf-1a2b"), None);
        let chain: Vec<&str> = ancestors("tf-1a2b.3.1").collect();
        assert_eq!(chain, vec!["tf-1a2b.3", "tf-1a2b"]);
    }

    #[test]
    fn test_extensions_typed_accessors() {
        let mut ext = Extensions::new();
        assert_eq!(ext.attempts(), 0);
        ext.set_attempts(2);
        ext.set_files(vec!["src/lib.rs".into()]);
        ext.set_branch(Some("taskforge/tf-1"));
        ext.insert("custom", serde_json::json!({"k": 1}));

        assert_eq!(ext.attempts(), 2);
        assert_eq!(ext.files(), vec!["src/lib.rs".to_string()]);
        assert_eq!(ext.branch().as_deref(), Some("taskforge/tf-1"));
        assert_eq!(ext.get_raw("custom").unwrap()["k"], 1);

        ext.set_conflict_files(vec![]);
        assert!(!ext.contains(ext::CONFLICT_FILES));
        ext.set_branch(None);
        assert!(ext.branch().is_none());
    }

    #[test]
    fn test_extensions_serialize_as_flat_map() {
        let mut ext = Extensions::new();
        ext.set_attempts(3);
        let json = serde_json::to_string(&ext).unwrap();
        assert_eq!(json, r#"{"attempts":3}"#);
        let back: Extensions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ext);
    }

    #[test]
    fn test_update_rejects_out_of_range_priority() {
        let mut t = task(TaskStatus::Open, TaskType::Task);
        let err = TaskUpdate::priority(5).apply(&mut t, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        assert_eq!(t.priority, 2);
    }

    #[test]
    fn test_rejected_transition_leaves_priority_untouched() {
        let mut t = task(TaskStatus::Open, TaskType::Task);
        let update = TaskUpdate {
            priority: Some(0),
            status: Some(TaskStatus::Closed),
            ..Default::default()
        };
        let err = update.apply(&mut t, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(t.priority, 2);
        assert_eq!(t.status, TaskStatus::Open);
    }

    #[test]
    fn test_update_merges_extensions_and_labels() {
        let mut t = task(TaskStatus::Open, TaskType::Task);
        t.extensions.set_attempts(1);
        let mut ext = Extensions::new();
        ext.set_files(vec!["a.rs".into()]);
        let update = TaskUpdate {
            add_labels: vec!["backend".into()],
            extensions: Some(ext),
            ..Default::default()
        };
        update.apply(&mut t, Utc::now()).unwrap();
        assert_eq!(t.attempts(), 1);
        assert_eq!(t.extensions.files(), vec!["a.rs".to_string()]);
        assert!(t.labels.contains("backend"));
    }
}
