//! Configuration for taskforge.
//!
//! Reads `.taskforge/taskforge.toml`. Every field has a default, so a missing
//! file yields a complete configuration. Values are layered file → environment
//! → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! id = "default"
//! trunk_branch = "main"
//! work_mode = "worktree"
//!
//! [agent]
//! command = "claude"
//! args = ["--print"]
//! review_command = "claude-review"
//! inactivity_timeout_secs = 900
//!
//! [backoff]
//! attempts_per_cycle = 3
//! auto_retry_interval_secs = 7200
//! max_auto_retries = 3
//!
//! [context]
//! condense_over_bytes = 48000
//! condense_over_dependencies = 8
//!
//! [scheduler]
//! poll_interval_secs = 30
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Name of the per-project state directory.
pub const TASKFORGE_DIR: &str = ".taskforge";
/// Name of the config file inside [`TASKFORGE_DIR`].
pub const CONFIG_FILE: &str = "taskforge.toml";
/// Name of the task database inside [`TASKFORGE_DIR`].
pub const DB_FILE: &str = "tasks.db";

/// Where agents do their work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    /// One git worktree per task under `.taskforge/workspaces/`.
    #[default]
    Worktree,
    /// Work on a task branch checked out in the repository itself.
    InPlace,
}

impl std::fmt::Display for WorkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkMode::Worktree => write!(f, "worktree"),
            WorkMode::InPlace => write!(f, "in_place"),
        }
    }
}

impl std::str::FromStr for WorkMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "worktree" => Ok(WorkMode::Worktree),
            "in_place" | "in-place" => Ok(WorkMode::InPlace),
            _ => anyhow::bail!("Invalid work mode '{}'. Valid values: worktree, in_place", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project id used to scope the task graph
    #[serde(default = "default_project_id")]
    pub id: String,
    /// Branch completed work is merged into
    #[serde(default = "default_trunk_branch")]
    pub trunk_branch: String,
    #[serde(default)]
    pub work_mode: WorkMode,
}

fn default_project_id() -> String {
    "default".to_string()
}

fn default_trunk_branch() -> String {
    "main".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            id: default_project_id(),
            trunk_branch: default_trunk_branch(),
            work_mode: WorkMode::default(),
        }
    }
}

/// Agent process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Coding agent command (default: "claude")
    #[serde(default)]
    pub command: Option<String>,
    /// Extra arguments passed before the input artifact path
    #[serde(default)]
    pub args: Vec<String>,
    /// Review agent command; falls back to `command`
    #[serde(default)]
    pub review_command: Option<String>,
    /// Conflict-resolution agent command; falls back to `command`
    #[serde(default)]
    pub conflict_command: Option<String>,
    /// Epic final-review agent command; falls back to `command`
    #[serde(default)]
    pub final_review_command: Option<String>,
    /// Kill an agent that produces no output for this long
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

fn default_inactivity_timeout() -> u64 {
    900
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            review_command: None,
            conflict_command: None,
            final_review_command: None,
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

/// Thresholds above which the task context is condensed before handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_condense_over_bytes")]
    pub condense_over_bytes: usize,
    #[serde(default = "default_condense_over_dependencies")]
    pub condense_over_dependencies: usize,
}

fn default_condense_over_bytes() -> usize {
    48_000
}

fn default_condense_over_dependencies() -> usize {
    8
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            condense_over_bytes: default_condense_over_bytes(),
            condense_over_dependencies: default_condense_over_dependencies(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Upper bound on how long the dispatch loop sleeps between checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// The complete taskforge.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskforgeToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

impl TaskforgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse taskforge.toml")
    }

    /// Load `taskforge.toml` from `taskforge_dir`, or defaults if absent.
    pub fn load_or_default(taskforge_dir: &Path) -> Result<Self> {
        let config_path = taskforge_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize taskforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Coding agent command (file → `TASKFORGE_AGENT_CMD` → "claude").
    pub fn agent_command(&self) -> String {
        self.agent
            .command
            .clone()
            .or_else(|| std::env::var("TASKFORGE_AGENT_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn review_command(&self) -> String {
        self.agent
            .review_command
            .clone()
            .unwrap_or_else(|| self.agent_command())
    }

    pub fn conflict_command(&self) -> String {
        self.agent
            .conflict_command
            .clone()
            .unwrap_or_else(|| self.agent_command())
    }

    pub fn final_review_command(&self) -> String {
        self.agent
            .final_review_command
            .clone()
            .unwrap_or_else(|| self.agent_command())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.project.id.trim().is_empty() {
            warnings.push("project.id must not be empty".to_string());
        }
        if self.project.trunk_branch.trim().is_empty() {
            warnings.push("project.trunk_branch must not be empty".to_string());
        }
        if self.agent.inactivity_timeout_secs == 0 {
            warnings.push("agent.inactivity_timeout_secs must be greater than 0".to_string());
        }
        if self.backoff.attempts_per_cycle == 0 {
            warnings.push("backoff.attempts_per_cycle must be greater than 0".to_string());
        }
        if self.backoff.auto_retry_interval_secs < 0 {
            warnings.push(format!(
                "backoff.auto_retry_interval_secs is negative ({})",
                self.backoff.auto_retry_interval_secs
            ));
        }
        if self.scheduler.poll_interval_secs == 0 {
            warnings.push("scheduler.poll_interval_secs must be greater than 0".to_string());
        }

        warnings
    }
}

/// Resolved configuration: `TaskforgeToml` plus runtime settings.
#[derive(Debug, Clone)]
pub struct TaskforgeConfig {
    /// Path to the project (trunk repository) directory
    pub project_dir: PathBuf,
    /// Path to the .taskforge directory
    pub taskforge_dir: PathBuf,
    /// Parsed taskforge.toml configuration
    pub toml: TaskforgeToml,
    /// CLI override: verbose mode
    pub verbose: bool,
    /// CLI override: skip confirmations
    pub yes: bool,
    /// CLI override for the project id
    pub cli_project: Option<String>,
}

impl TaskforgeConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let taskforge_dir = project_dir.join(TASKFORGE_DIR);
        let toml = TaskforgeToml::load_or_default(&taskforge_dir)?;

        Ok(Self {
            project_dir,
            taskforge_dir,
            toml,
            verbose: false,
            yes: false,
            cli_project: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        yes: bool,
        project: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.yes = yes;
        config.cli_project = project;
        Ok(config)
    }

    /// Project id (CLI → `TASKFORGE_PROJECT` → file).
    pub fn project_id(&self) -> String {
        self.cli_project
            .clone()
            .or_else(|| std::env::var("TASKFORGE_PROJECT").ok())
            .unwrap_or_else(|| self.toml.project.id.clone())
    }

    pub fn trunk_branch(&self) -> &str {
        &self.toml.project.trunk_branch
    }

    pub fn work_mode(&self) -> WorkMode {
        self.toml.project.work_mode
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.toml.backoff
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.agent.inactivity_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.toml.scheduler.poll_interval_secs)
    }

    pub fn config_file(&self) -> PathBuf {
        self.taskforge_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.taskforge_dir.join(DB_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.taskforge_dir.join("logs")
    }

    /// Per-invocation agent output logs.
    pub fn agent_log_dir(&self) -> PathBuf {
        self.log_dir().join("agents")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.taskforge_dir.join("workspaces")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_empty_yields_defaults() {
        let toml = TaskforgeToml::parse("").unwrap();
        assert_eq!(toml.project.id, "default");
        assert_eq!(toml.project.trunk_branch, "main");
        assert_eq!(toml.project.work_mode, WorkMode::Worktree);
        assert_eq!(toml.agent.inactivity_timeout_secs, 900);
        assert_eq!(toml.backoff, BackoffPolicy::default());
        assert_eq!(toml.context.condense_over_bytes, 48_000);
        assert_eq!(toml.scheduler.poll_interval_secs, 30);
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[project]
id = "web"
work_mode = "in_place"

[backoff]
attempts_per_cycle = 5

[agent]
args = ["--print", "--verbose"]
"#;
        let toml = TaskforgeToml::parse(content).unwrap();
        assert_eq!(toml.project.id, "web");
        assert_eq!(toml.project.trunk_branch, "main");
        assert_eq!(toml.project.work_mode, WorkMode::InPlace);
        assert_eq!(toml.backoff.attempts_per_cycle, 5);
        assert_eq!(toml.backoff.max_auto_retries, 3);
        assert_eq!(toml.agent.args, vec!["--print", "--verbose"]);
    }

    #[test]
    fn test_parse_rejects_unknown_work_mode() {
        let content = r#"
[project]
work_mode = "cloud"
"#;
        assert!(TaskforgeToml::parse(content).is_err());
        assert!("cloud".parse::<WorkMode>().is_err());
        assert_eq!("in-place".parse::<WorkMode>().unwrap(), WorkMode::InPlace);
    }

    #[test]
    fn test_agent_command_priority() {
        let _guard = ENV_MUTEX.lock().unwrap();

        let saved = std::env::var("TASKFORGE_AGENT_CMD").ok();
        unsafe { std::env::remove_var("TASKFORGE_AGENT_CMD") };

        let toml = TaskforgeToml::default();
        assert_eq!(toml.agent_command(), "claude");
        assert_eq!(toml.review_command(), "claude");

        let toml = TaskforgeToml::parse(
            r#"
[agent]
command = "my-agent"
conflict_command = "resolver"
"#,
        )
        .unwrap();
        assert_eq!(toml.agent_command(), "my-agent");
        assert_eq!(toml.final_review_command(), "my-agent");
        assert_eq!(toml.conflict_command(), "resolver");

        if let Some(val) = saved {
            unsafe { std::env::set_var("TASKFORGE_AGENT_CMD", val) };
        }
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let toml = TaskforgeToml::default();
        assert!(toml.validate().is_empty());

        let toml = TaskforgeToml::parse(
            r#"
[backoff]
attempts_per_cycle = 0

[scheduler]
poll_interval_secs = 0
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("attempts_per_cycle"));
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut toml = TaskforgeToml::default();
        toml.project.id = "api".to_string();
        toml.backoff.max_auto_retries = 7;
        toml.save(&path).unwrap();

        let loaded = TaskforgeToml::load(&path).unwrap();
        assert_eq!(loaded.project.id, "api");
        assert_eq!(loaded.backoff.max_auto_retries, 7);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = TaskforgeToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.project.id, "default");
    }

    #[test]
    fn test_config_paths_and_cli_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("TASKFORGE_PROJECT").ok();
        unsafe { std::env::remove_var("TASKFORGE_PROJECT") };

        let dir = tempdir().unwrap();
        let tf_dir = dir.path().join(TASKFORGE_DIR);
        std::fs::create_dir_all(&tf_dir).unwrap();
        std::fs::write(tf_dir.join(CONFIG_FILE), "[project]\nid = \"from-file\"\n").unwrap();

        let config = TaskforgeConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.project_id(), "from-file");
        assert!(config.db_path().ends_with(".taskforge/tasks.db"));
        assert!(config.agent_log_dir().ends_with(".taskforge/logs/agents"));
        assert!(config.workspaces_dir().ends_with(".taskforge/workspaces"));

        let config = TaskforgeConfig::with_cli_args(
            dir.path().to_path_buf(),
            true,
            false,
            Some("from-cli".into()),
        )
        .unwrap();
        assert_eq!(config.project_id(), "from-cli");
        assert!(config.verbose);

        if let Some(val) = saved {
            unsafe { std::env::set_var("TASKFORGE_PROJECT", val) };
        }
    }
}
