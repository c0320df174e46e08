//! Task CRUD commands: `create`, `show`, `list`, `ready`, `update`, `close`,
//! `delete`, `purge`.

use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use taskforge::store::{NewTask, TaskFilter, TaskStatus, TaskType, TaskUpdate};

use super::super::Cli;
use super::{confirm, load_config, open_store, print_task_line, styled_status};

pub struct CreateArgs {
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub task_type: String,
    pub parent: Option<String>,
    pub labels: Vec<String>,
    pub files: Vec<String>,
    pub approved: bool,
}

pub struct UpdateArgs {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub status: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

pub async fn cmd_create(cli: &Cli, project_dir: &Path, args: CreateArgs) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let task_type: TaskType = args.task_type.parse().map_err(|e: String| anyhow!(e))?;
    let mut new = NewTask::new(args.title)
        .with_description(args.description)
        .with_priority(args.priority)
        .with_type(task_type);
    if let Some(parent) = args.parent {
        new = new.with_parent(parent);
    }
    for label in args.labels {
        new = new.with_label(label);
    }
    if !args.files.is_empty() {
        new.extensions.set_files(args.files);
    }
    if args.approved {
        new = new.approved();
    }

    let task = store.create(new).await?;
    store.idle().await;
    println!("Created {} {}", style(&task.id).bold(), task.title);
    if task.status == TaskStatus::Blocked {
        println!(
            "  {} awaiting epic approval ({})",
            styled_status(task.status),
            style("taskforge approve <epic>").dim()
        );
    }
    Ok(())
}

pub async fn cmd_show(cli: &Cli, project_dir: &Path, id: &str) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;
    let task = store.get(id).await?;

    println!();
    println!("{} {}", style(&task.id).bold().cyan(), style(&task.title).bold());
    println!("  status:    {}", styled_status(task.status));
    println!("  type:      {}", task.task_type);
    println!("  priority:  P{}", task.priority);
    if let Some(assignee) = &task.assignee {
        println!("  assignee:  {}", assignee);
    }
    if let Some(a) = store
        .active_assignments()
        .await?
        .into_iter()
        .find(|a| a.task_id == task.id)
    {
        println!(
            "  running:   {} phase on {} since {}",
            a.phase.as_str(),
            a.branch,
            a.started_at.to_rfc3339()
        );
    }
    if let (Some(kind), Some(reason)) = (task.block_kind, &task.block_reason) {
        println!("  blocked:   {} ({})", reason, kind.as_str());
    }
    if !task.labels.is_empty() {
        let labels: Vec<&str> = task.labels.iter().map(String::as_str).collect();
        println!("  labels:    {}", labels.join(", "));
    }
    println!("  attempts:  {}", task.attempts());
    println!("  created:   {}", task.created_at.to_rfc3339());
    if let Some(completed) = task.completed_at {
        println!("  completed: {}", completed.to_rfc3339());
    }
    if !task.description.is_empty() {
        println!();
        println!("{}", task.description);
    }

    let deps = store.dependencies(&task.id).await?;
    if !deps.is_empty() {
        println!();
        println!("Depends on:");
        for dep in deps {
            println!("  {} ({})", dep.depends_on_id, dep.dep_type);
        }
    }

    if !task.extensions.is_empty() {
        println!();
        println!("Extensions:");
        for (key, value) in task.extensions.iter() {
            println!("  {} = {}", key, value);
        }
    }

    let reviews = store.reviews(&task.id).await?;
    if !reviews.is_empty() {
        println!();
        println!("Reviews:");
        for review in reviews {
            let feedback = if review.feedback.is_empty() {
                "-"
            } else {
                review.feedback.as_str()
            };
            println!(
                "  attempt {} {}: {}",
                review.attempt,
                review.verdict.as_str(),
                feedback
            );
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_list(
    cli: &Cli,
    project_dir: &Path,
    status: Option<&str>,
    task_type: Option<&str>,
    parent: Option<String>,
) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let filter = TaskFilter {
        status: status
            .map(str::parse)
            .transpose()
            .map_err(|e: String| anyhow!(e))?,
        task_type: task_type
            .map(str::parse)
            .transpose()
            .map_err(|e: String| anyhow!(e))?,
        parent,
    };
    let tasks = store.list(filter).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in &tasks {
        print_task_line(task);
    }
    println!();
    println!("{} task(s)", tasks.len());
    Ok(())
}

pub async fn cmd_ready(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let ready = store.ready().await?;
    if ready.is_empty() {
        println!("No ready tasks.");
        return Ok(());
    }
    for task in &ready {
        print_task_line(task);
    }
    Ok(())
}

pub async fn cmd_update(cli: &Cli, project_dir: &Path, id: &str, args: UpdateArgs) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let update = TaskUpdate {
        title: args.title,
        description: args.description,
        priority: args.priority,
        status: args
            .status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: String| anyhow!(e))?,
        add_labels: args.add_labels,
        remove_labels: args.remove_labels,
        ..Default::default()
    };
    let task = store.update(id, update).await?;
    store.idle().await;
    println!("Updated {} ({})", style(&task.id).bold(), styled_status(task.status));
    Ok(())
}

pub async fn cmd_close(cli: &Cli, project_dir: &Path, id: &str, reason: Option<&str>) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let task = store.close(id, reason).await?;
    store.idle().await;
    println!("Closed {} {}", style(&task.id).bold(), task.title);
    Ok(())
}

pub async fn cmd_delete(cli: &Cli, project_dir: &Path, ids: &[String]) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let prompt = format!("Delete {} task(s): {}?", ids.len(), ids.join(", "));
    if !confirm(cli, &prompt) {
        println!("Delete cancelled");
        return Ok(());
    }
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let deleted = store.delete_batch(&refs).await?;
    store.idle().await;
    println!("Deleted {} task(s)", deleted.len());
    Ok(())
}

pub async fn cmd_purge(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = open_store(&config)?;

    let prompt = format!(
        "This will delete every task in project '{}'. Are you sure?",
        store.project_id()
    );
    if !confirm(cli, &prompt) {
        println!("Purge cancelled");
        return Ok(());
    }
    let removed = store.delete_project().await?;
    store.idle().await;
    println!("Purged {} task(s) from project '{}'", removed, store.project_id());
    Ok(())
}
