//! `taskforge init`: create the `.taskforge/` directory in a repository.
//!
//! ```text
//! .taskforge/
//! ├── taskforge.toml   # Configuration (written with defaults)
//! ├── tasks.db         # Task graph (created on first open)
//! ├── logs/
//! │   └── agents/      # Per-invocation agent output
//! └── workspaces/      # Per-task git worktrees
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, DB_FILE, TASKFORGE_DIR, TaskforgeToml};
use crate::store::TaskDb;

/// Result of initializing a taskforge project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the .taskforge directory
    pub taskforge_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
}

/// Initialize taskforge in `project_dir`. Safe to re-run: missing pieces are
/// filled in and an existing config is left untouched.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let taskforge_dir = project_dir.join(TASKFORGE_DIR);
    let created = !taskforge_dir.exists();

    std::fs::create_dir_all(&taskforge_dir).with_context(|| {
        format!("Failed to create directory: {}", taskforge_dir.display())
    })?;
    ensure_directory_structure(&taskforge_dir)?;

    Ok(InitResult {
        taskforge_dir,
        created,
    })
}

fn ensure_directory_structure(taskforge_dir: &Path) -> Result<()> {
    for sub in ["logs/agents", "workspaces"] {
        let dir = taskforge_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_file = taskforge_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        TaskforgeToml::default().save(&config_file)?;
    }

    // Opening runs the migrations.
    let db_path = taskforge_dir.join(DB_FILE);
    TaskDb::new(&db_path)
        .with_context(|| format!("Failed to initialize task database: {}", db_path.display()))?;

    // Worktrees are scratch space; keep them out of the trunk.
    let ignore = taskforge_dir.join(".gitignore");
    if !ignore.exists() {
        std::fs::write(&ignore, "workspaces/\nlogs/\ntasks.db*\n")
            .with_context(|| format!("Failed to write {}", ignore.display()))?;
    }

    Ok(())
}

/// Check if a project is already initialized.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(TASKFORGE_DIR).join(DB_FILE).exists()
}
