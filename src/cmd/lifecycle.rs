//! Scheduling-state commands: `approve`, `unblock`, `block`, `blocked`, `dep`.

use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use taskforge::store::{BlockKind, DependencyType};

use super::super::{Cli, DepCommands};
use super::{load_config, open_store, print_task_line};

pub async fn cmd_approve(cli: &Cli, project_dir: &Path, epic_id: &str) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let opened = store.approve(epic_id).await?;
    store.idle().await;
    println!(
        "Approved {}; {} task(s) opened",
        style(epic_id).bold(),
        opened.len()
    );
    Ok(())
}

pub async fn cmd_unblock(cli: &Cli, project_dir: &Path, id: &str) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let task = store.unblock(id).await?;
    store.idle().await;
    println!("Unblocked {} {}", style(&task.id).bold(), task.title);
    Ok(())
}

pub async fn cmd_block(cli: &Cli, project_dir: &Path, id: &str, reason: &str) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let task = store.block(id, BlockKind::Human, reason).await?;
    store.idle().await;
    println!("Blocked {}: {}", style(&task.id).bold(), reason);
    Ok(())
}

pub async fn cmd_blocked(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let blocked = store.blocked().await?;
    if blocked.is_empty() {
        println!("No blocked tasks.");
        return Ok(());
    }
    for task in &blocked {
        print_task_line(task);
        if let Some(reason) = &task.block_reason {
            let kind = task.block_kind.map(|k| k.as_str()).unwrap_or("unknown");
            println!("      {} {}", style(format!("[{}]", kind)).yellow(), reason);
        }
    }
    Ok(())
}

pub async fn cmd_dep(cli: &Cli, project_dir: &Path, command: DepCommands) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    match command {
        DepCommands::Add {
            id,
            depends_on,
            dep_type,
        } => {
            let dep_type: DependencyType = dep_type.parse().map_err(|e: String| anyhow!(e))?;
            store.add_dependency(&id, &depends_on, dep_type).await?;
            println!("{} now depends on {} ({})", style(&id).bold(), depends_on, dep_type);
        }
        DepCommands::Remove {
            id,
            depends_on,
            dep_type,
        } => {
            let dep_type: DependencyType = dep_type.parse().map_err(|e: String| anyhow!(e))?;
            if store.remove_dependency(&id, &depends_on, dep_type).await? {
                println!("Removed dependency {} -> {}", id, depends_on);
            } else {
                println!("No such dependency {} -> {} ({})", id, depends_on, dep_type);
            }
        }
    }
    store.idle().await;
    Ok(())
}
