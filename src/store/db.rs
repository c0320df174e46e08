use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::StoreError;

/// Async-safe handle to the task database.
///
/// Wraps `TaskDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskDb>>,
}

impl DbHandle {
    pub fn new(db: TaskDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(TaskDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(TaskDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&TaskDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

pub struct TaskDb {
    conn: Connection,
}

const TASK_COLUMNS: &str = "id, project_id, title, description, task_type, status, priority, \
     assignee, labels, extensions, block_kind, block_reason, blocked_at, last_auto_retry_at, \
     created_at, updated_at, started_at, completed_at";

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

impl TaskDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))
            .map_err(StoreError::Database)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(StoreError::Database)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                project_id TEXT NOT NULL,
                id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                task_type TEXT NOT NULL DEFAULT 'task',
                status TEXT NOT NULL DEFAULT 'open',
                priority INTEGER NOT NULL DEFAULT 2,
                assignee TEXT,
                labels TEXT NOT NULL DEFAULT '[]',
                extensions TEXT NOT NULL DEFAULT '{}',
                block_kind TEXT,
                block_reason TEXT,
                blocked_at TEXT,
                last_auto_retry_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                PRIMARY KEY (project_id, id)
            );

            CREATE TABLE IF NOT EXISTS dependencies (
                project_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                depends_on_id TEXT NOT NULL,
                dep_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (project_id, task_id, depends_on_id, dep_type)
            );

            CREATE TABLE IF NOT EXISTS assignments (
                project_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                slot TEXT NOT NULL,
                phase TEXT NOT NULL,
                branch TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                PRIMARY KEY (project_id, task_id)
            );

            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                verdict TEXT NOT NULL,
                feedback TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(project_id, status);
            CREATE INDEX IF NOT EXISTS idx_deps_target ON dependencies(project_id, depends_on_id);
            CREATE INDEX IF NOT EXISTS idx_reviews_task ON reviews(project_id, task_id);
            ",
        )?;
        Ok(())
    }

    /// Run `f` inside one transaction; any error rolls the whole batch back.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&TaskDb) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(self)?;
        tx.commit()?;
        Ok(result)
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let labels = serde_json::to_string(&task.labels)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let extensions = serde_json::to_string(&task.extensions)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        self.conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.project_id,
                task.title,
                task.description,
                task.task_type.as_str(),
                task.status.as_str(),
                task.priority,
                task.assignee,
                labels,
                extensions,
                task.block_kind.map(|k| k.as_str()),
                task.block_reason,
                task.blocked_at.as_ref().map(ts),
                task.last_auto_retry_at.as_ref().map(ts),
                ts(&task.created_at),
                ts(&task.updated_at),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Persist every mutable column of `task`.
    pub fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let labels = serde_json::to_string(&task.labels)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let extensions = serde_json::to_string(&task.extensions)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let changed = self.conn.execute(
            "UPDATE tasks SET title = ?3, description = ?4, status = ?5, priority = ?6,
                 assignee = ?7, labels = ?8, extensions = ?9, block_kind = ?10,
                 block_reason = ?11, blocked_at = ?12, last_auto_retry_at = ?13,
                 updated_at = ?14, started_at = ?15, completed_at = ?16
             WHERE project_id = ?1 AND id = ?2",
            params![
                task.project_id,
                task.id,
                task.title,
                task.description,
                task.status.as_str(),
                task.priority,
                task.assignee,
                labels,
                extensions,
                task.block_kind.map(|k| k.as_str()),
                task.block_reason,
                task.blocked_at.as_ref().map(ts),
                task.last_auto_retry_at.as_ref().map(ts),
                ts(&task.updated_at),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(&task.project_id, &task.id));
        }
        Ok(())
    }

    pub fn get_task(&self, project_id: &str, id: &str) -> Result<Option<Task>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE project_id = ?1 AND id = ?2",
            TASK_COLUMNS
        ))?;
        let row = stmt
            .query_row(params![project_id, id], TaskRow::from_row)
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn require_task(&self, project_id: &str, id: &str) -> Result<Task, StoreError> {
        self.get_task(project_id, id)?
            .ok_or_else(|| StoreError::not_found(project_id, id))
    }

    /// All tasks of a project in insertion order, narrowed by `filter`.
    pub fn list_tasks(&self, project_id: &str, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks
             WHERE project_id = ?1
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR task_type = ?3)
             ORDER BY rowid",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                project_id,
                filter.status.map(|s| s.as_str()),
                filter.task_type.map(|t| t.as_str()),
            ],
            TaskRow::from_row,
        )?;
        let mut tasks = Vec::new();
        for row in rows {
            let task = row?.into_task()?;
            if let Some(parent) = &filter.parent
                && task.parent_id() != Some(parent.as_str())
            {
                continue;
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Highest child sequence number under `parent`, or 0 if it has none.
    pub fn max_child_seq(&self, project_id: &str, parent: &str) -> Result<u32, StoreError> {
        let prefix = format!("{}.", parent);
        let mut stmt = self.conn.prepare(
            "SELECT id FROM tasks WHERE project_id = ?1 AND substr(id, 1, length(?2)) = ?2",
        )?;
        let rows = stmt.query_map(params![project_id, prefix], |row| row.get::<_, String>(0))?;
        let mut max = 0;
        for row in rows {
            let id = row?;
            if let Some(seq) = id[prefix.len()..]
                .split('.')
                .next()
                .and_then(|s| s.parse::<u32>().ok())
            {
                max = max.max(seq);
            }
        }
        Ok(max)
    }

    pub fn delete_task(&self, project_id: &str, id: &str) -> Result<bool, StoreError> {
        self.conn.execute(
            "DELETE FROM dependencies WHERE project_id = ?1 AND task_id = ?2",
            params![project_id, id],
        )?;
        self.conn.execute(
            "DELETE FROM assignments WHERE project_id = ?1 AND task_id = ?2",
            params![project_id, id],
        )?;
        self.conn.execute(
            "DELETE FROM reviews WHERE project_id = ?1 AND task_id = ?2",
            params![project_id, id],
        )?;
        let deleted = self.conn.execute(
            "DELETE FROM tasks WHERE project_id = ?1 AND id = ?2",
            params![project_id, id],
        )?;
        Ok(deleted > 0)
    }

    /// Remove a project's entire graph. Returns the number of tasks deleted.
    pub fn delete_project(&self, project_id: &str) -> Result<usize, StoreError> {
        for table in ["dependencies", "assignments", "reviews"] {
            self.conn.execute(
                &format!("DELETE FROM {} WHERE project_id = ?1", table),
                params![project_id],
            )?;
        }
        let deleted = self
            .conn
            .execute("DELETE FROM tasks WHERE project_id = ?1", params![project_id])?;
        Ok(deleted)
    }

    // ── Dependencies ──────────────────────────────────────────────────

    pub fn insert_dependency(&self, project_id: &str, dep: &Dependency) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO dependencies (project_id, task_id, depends_on_id, dep_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                dep.task_id,
                dep.depends_on_id,
                dep.dep_type.as_str(),
                ts(&dep.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn delete_dependency(
        &self,
        project_id: &str,
        task_id: &str,
        depends_on_id: &str,
        dep_type: DependencyType,
    ) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM dependencies
             WHERE project_id = ?1 AND task_id = ?2 AND depends_on_id = ?3 AND dep_type = ?4",
            params![project_id, task_id, depends_on_id, dep_type.as_str()],
        )?;
        Ok(deleted > 0)
    }

    /// Edges out of `task_id` (what it depends on).
    pub fn dependencies_of(&self, project_id: &str, task_id: &str) -> Result<Vec<Dependency>, StoreError> {
        self.query_dependencies(
            "SELECT task_id, depends_on_id, dep_type, created_at FROM dependencies
             WHERE project_id = ?1 AND task_id = ?2 ORDER BY rowid",
            params![project_id, task_id],
        )
    }

    /// Edges into `task_id` (what depends on it).
    pub fn dependents_of(&self, project_id: &str, task_id: &str) -> Result<Vec<Dependency>, StoreError> {
        self.query_dependencies(
            "SELECT task_id, depends_on_id, dep_type, created_at FROM dependencies
             WHERE project_id = ?1 AND depends_on_id = ?2 ORDER BY rowid",
            params![project_id, task_id],
        )
    }

    pub fn all_dependencies(&self, project_id: &str) -> Result<Vec<Dependency>, StoreError> {
        self.query_dependencies(
            "SELECT task_id, depends_on_id, dep_type, created_at FROM dependencies
             WHERE project_id = ?1 ORDER BY rowid",
            params![project_id],
        )
    }

    fn query_dependencies(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Dependency>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut deps = Vec::new();
        for row in rows {
            let (task_id, depends_on_id, dep_type, created_at) = row?;
            deps.push(Dependency {
                task_id,
                depends_on_id,
                dep_type: dep_type.parse().map_err(StoreError::InvalidData)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(deps)
    }

    /// Tasks and edges read inside one transaction, so the ready queue is
    /// computed from a consistent snapshot.
    pub fn snapshot(&self, project_id: &str) -> Result<(Vec<Task>, Vec<Dependency>), StoreError> {
        self.transaction(|db| {
            let tasks = db.list_tasks(project_id, &TaskFilter::default())?;
            let deps = db.all_dependencies(project_id)?;
            Ok((tasks, deps))
        })
    }

    // ── Assignments ───────────────────────────────────────────────────

    pub fn upsert_assignment(&self, project_id: &str, a: &Assignment) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO assignments (project_id, task_id, slot, phase, branch, workspace_path, attempt, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project_id, task_id) DO UPDATE SET
                 slot = excluded.slot, phase = excluded.phase, branch = excluded.branch,
                 workspace_path = excluded.workspace_path, attempt = excluded.attempt,
                 started_at = excluded.started_at",
            params![
                project_id,
                a.task_id,
                a.slot,
                a.phase.as_str(),
                a.branch,
                a.workspace_path,
                a.attempt,
                ts(&a.started_at)
            ],
        )?;
        Ok(())
    }

    pub fn delete_assignment(&self, project_id: &str, task_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM assignments WHERE project_id = ?1 AND task_id = ?2",
            params![project_id, task_id],
        )?;
        Ok(())
    }

    pub fn list_assignments(&self, project_id: &str) -> Result<Vec<Assignment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, slot, phase, branch, workspace_path, attempt, started_at
             FROM assignments WHERE project_id = ?1 ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (task_id, slot, phase, branch, workspace_path, attempt, started_at) = row?;
            out.push(Assignment {
                task_id,
                slot,
                phase: phase.parse().map_err(StoreError::InvalidData)?,
                branch,
                workspace_path,
                attempt,
                started_at: parse_ts(&started_at)?,
            });
        }
        Ok(out)
    }

    // ── Reviews ───────────────────────────────────────────────────────

    pub fn insert_review(&self, project_id: &str, review: &ReviewRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO reviews (project_id, task_id, attempt, verdict, feedback, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                review.task_id,
                review.attempt,
                review.verdict.as_str(),
                review.feedback,
                ts(&review.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn list_reviews(&self, project_id: &str, task_id: &str) -> Result<Vec<ReviewRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, attempt, verdict, feedback, created_at
             FROM reviews WHERE project_id = ?1 AND task_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_id, task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (task_id, attempt, verdict, feedback, created_at) = row?;
            out.push(ReviewRecord {
                task_id,
                attempt,
                verdict: verdict.parse().map_err(StoreError::InvalidData)?,
                feedback,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(out)
    }
}

/// Raw row shape, converted to `Task` after the statement is done.
struct TaskRow {
    id: String,
    project_id: String,
    title: String,
    description: String,
    task_type: String,
    status: String,
    priority: u8,
    assignee: Option<String>,
    labels: String,
    extensions: String,
    block_kind: Option<String>,
    block_reason: Option<String>,
    blocked_at: Option<String>,
    last_auto_retry_at: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            task_type: row.get(4)?,
            status: row.get(5)?,
            priority: row.get(6)?,
            assignee: row.get(7)?,
            labels: row.get(8)?,
            extensions: row.get(9)?,
            block_kind: row.get(10)?,
            block_reason: row.get(11)?,
            blocked_at: row.get(12)?,
            last_auto_retry_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            started_at: row.get(16)?,
            completed_at: row.get(17)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let labels: BTreeSet<String> = serde_json::from_str(&self.labels)
            .map_err(|e| StoreError::InvalidData(format!("labels of {}: {}", self.id, e)))?;
        let extensions: Extensions = serde_json::from_str(&self.extensions)
            .map_err(|e| StoreError::InvalidData(format!("extensions of {}: {}", self.id, e)))?;
        Ok(Task {
            task_type: self.task_type.parse().map_err(StoreError::InvalidData)?,
            status: self.status.parse().map_err(StoreError::InvalidData)?,
            block_kind: self
                .block_kind
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(StoreError::InvalidData)?,
            blocked_at: parse_opt_ts(self.blocked_at)?,
            last_auto_retry_at: parse_opt_ts(self.last_auto_retry_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            priority: self.priority,
            assignee: self.assignee,
            labels,
            extensions,
            block_reason: self.block_reason,
        })
    }
}
