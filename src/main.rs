use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "taskforge")]
#[command(version, about = "Task-graph orchestrator for coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Project id in the task store. Overrides taskforge.toml and TASKFORGE_PROJECT.
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new taskforge project
    Init,
    /// Create a task
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// 0 (highest) to 4 (lowest)
        #[arg(short, long, default_value = "2")]
        priority: u8,
        /// task, bug, feature, chore or epic
        #[arg(short = 't', long = "type", default_value = "task")]
        task_type: String,
        /// Create as a child of this task
        #[arg(long)]
        parent: Option<String>,
        #[arg(short, long)]
        label: Vec<String>,
        /// Predicted files this task will touch
        #[arg(short, long)]
        file: Vec<String>,
        /// Create an epic already approved for execution
        #[arg(long)]
        approved: bool,
    },
    /// Show one task with its dependencies and review history
    Show { id: String },
    /// List tasks
    List {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short = 't', long = "type")]
        task_type: Option<String>,
        #[arg(long)]
        parent: Option<String>,
    },
    /// List tasks ready for dispatch, highest priority first
    Ready,
    /// Update task fields
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        priority: Option<u8>,
        #[arg(short, long)]
        status: Option<String>,
        #[arg(long)]
        add_label: Vec<String>,
        #[arg(long)]
        remove_label: Vec<String>,
    },
    /// Close a task
    Close {
        id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Manage dependencies
    Dep {
        #[command(subcommand)]
        command: DepCommands,
    },
    /// Delete tasks
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete every task of the project
    Purge,
    /// Approve an epic and open its waiting tasks
    Approve { epic_id: String },
    /// Clear a block and start a new attempt cycle
    Unblock { id: String },
    /// Flag a task as blocked by a human
    Block { id: String, reason: String },
    /// List blocked tasks
    Blocked,
    /// Run the dispatch loop until interrupted
    Run,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum DepCommands {
    /// `id` depends on `depends_on`
    Add {
        id: String,
        depends_on: String,
        /// blocks, parent-child, related or discovered-from
        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },
    Remove {
        id: String,
        depends_on: String,
        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default taskforge.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if !matches!(cli.command, Commands::Run) {
        taskforge::logging::init(taskforge::logging::LogOptions {
            verbose: cli.verbose,
            json: cli.log_json,
        });
    }

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Create {
            title,
            description,
            priority,
            task_type,
            parent,
            label,
            file,
            approved,
        } => {
            let args = cmd::CreateArgs {
                title: title.clone(),
                description: description.clone(),
                priority: *priority,
                task_type: task_type.clone(),
                parent: parent.clone(),
                labels: label.clone(),
                files: file.clone(),
                approved: *approved,
            };
            cmd::cmd_create(&cli, &project_dir, args).await?;
        }
        Commands::Show { id } => cmd::cmd_show(&cli, &project_dir, id).await?,
        Commands::List {
            status,
            task_type,
            parent,
        } => {
            cmd::cmd_list(
                &cli,
                &project_dir,
                status.as_deref(),
                task_type.as_deref(),
                parent.clone(),
            )
            .await?
        }
        Commands::Ready => cmd::cmd_ready(&cli, &project_dir).await?,
        Commands::Update {
            id,
            title,
            description,
            priority,
            status,
            add_label,
            remove_label,
        } => {
            let args = cmd::UpdateArgs {
                title: title.clone(),
                description: description.clone(),
                priority: *priority,
                status: status.clone(),
                add_labels: add_label.clone(),
                remove_labels: remove_label.clone(),
            };
            cmd::cmd_update(&cli, &project_dir, id, args).await?;
        }
        Commands::Close { id, reason } => {
            cmd::cmd_close(&cli, &project_dir, id, reason.as_deref()).await?
        }
        Commands::Dep { command } => cmd::cmd_dep(&cli, &project_dir, command.clone()).await?,
        Commands::Delete { ids } => cmd::cmd_delete(&cli, &project_dir, ids).await?,
        Commands::Purge => cmd::cmd_purge(&cli, &project_dir).await?,
        Commands::Approve { epic_id } => cmd::cmd_approve(&cli, &project_dir, epic_id).await?,
        Commands::Unblock { id } => cmd::cmd_unblock(&cli, &project_dir, id).await?,
        Commands::Block { id, reason } => cmd::cmd_block(&cli, &project_dir, id, reason).await?,
        Commands::Blocked => cmd::cmd_blocked(&cli, &project_dir).await?,
        Commands::Run => cmd::cmd_run(&cli, project_dir).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
