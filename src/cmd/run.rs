//! The long-running dispatch loop: `taskforge run`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use taskforge::commit_queue::CommitQueue;
use taskforge::logging::{LogOptions, init_with_file};
use taskforge::orchestrator::Orchestrator;
use taskforge::store::{LoggingSink, spawn_sink};

use super::super::Cli;
use super::{load_config, open_store};

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = load_config(cli, &project_dir)?;
    let warnings = config.validate();
    if !warnings.is_empty() {
        for warning in &warnings {
            eprintln!("{} {}", style("Config warning:").yellow(), warning);
        }
    }

    let _log_guard = init_with_file(
        LogOptions {
            verbose: cli.verbose,
            json: cli.log_json,
        },
        &config.log_dir(),
    )
    .context("Failed to set up logging")?;

    let store = open_store(&config)?;
    let _sink = spawn_sink(store.subscribe(), Arc::new(LoggingSink));
    let (queue, worker) = CommitQueue::start();

    println!(
        "{} project '{}' on {} ({})",
        style("taskforge").bold().cyan(),
        store.project_id(),
        config.trunk_branch(),
        config.project_dir.display()
    );
    println!("Press Ctrl-C to stop after the current step.");

    let mut orchestrator = Orchestrator::from_config(&config, store, queue);
    let stats = orchestrator
        .run_project(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    worker.abort();

    println!();
    println!("Dispatched: {}", stats.dispatched);
    println!("Merged:     {}", style(stats.merged).green());
    println!("Reopened:   {}", stats.reopened);
    println!("Failed:     {}", style(stats.failed).red());
    println!("Blocked:    {}", stats.blocked);
    Ok(())
}
