//! CLI command implementations.
//!
//! | Module      | Commands handled                                              |
//! |-------------|---------------------------------------------------------------|
//! | `project`   | `Init`                                                        |
//! | `tasks`     | `Create`, `Show`, `List`, `Ready`, `Update`, `Close`, `Delete`, `Purge` |
//! | `lifecycle` | `Approve`, `Unblock`, `Block`, `Blocked`, `Dep`               |
//! | `run`       | `Run`                                                         |
//! | `config`    | `Config`                                                      |

pub mod config;
pub mod lifecycle;
pub mod project;
pub mod run;
pub mod tasks;

pub use config::cmd_config;
pub use lifecycle::{cmd_approve, cmd_block, cmd_blocked, cmd_dep, cmd_unblock};
pub use project::cmd_init;
pub use run::cmd_run;
pub use tasks::{
    CreateArgs, UpdateArgs, cmd_close, cmd_create, cmd_delete, cmd_list, cmd_purge, cmd_ready,
    cmd_show, cmd_update,
};

use anyhow::{Context, Result};
use std::path::Path;

use taskforge::config::TaskforgeConfig;
use taskforge::init::is_initialized;
use taskforge::store::{Task, TaskStatus, TaskStore};

use super::Cli;

/// Resolve configuration for an initialized project.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<TaskforgeConfig> {
    if !is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'taskforge init' first.");
    }
    TaskforgeConfig::with_cli_args(
        project_dir.to_path_buf(),
        cli.verbose,
        cli.yes,
        cli.project.clone(),
    )
}

pub fn open_store(config: &TaskforgeConfig) -> Result<TaskStore> {
    let path = config.db_path();
    TaskStore::open(&path, config.project_id())
        .with_context(|| format!("Failed to open task database: {}", path.display()))
}

/// Ask before a destructive action unless `--yes` was given.
pub fn confirm(cli: &Cli, prompt: &str) -> bool {
    if cli.yes {
        return true;
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

pub fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        TaskStatus::Open => console::style(label).green(),
        TaskStatus::InProgress => console::style(label).cyan(),
        TaskStatus::Blocked => console::style(label).red(),
        TaskStatus::Closed => console::style(label).dim(),
    }
}

/// One-line listing format shared by `list`, `ready` and `blocked`.
pub fn print_task_line(task: &Task) {
    println!(
        "  {:<16} P{} {:<12} {:<8} {}",
        console::style(&task.id).bold(),
        task.priority,
        styled_status(task.status),
        task.task_type.as_str(),
        task.title
    );
}
