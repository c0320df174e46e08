//! Configuration view and validation commands: `taskforge config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use taskforge::config::{CONFIG_FILE, TASKFORGE_DIR, TaskforgeConfig, TaskforgeToml};

    let taskforge_dir = project_dir.join(TASKFORGE_DIR);
    let config_path = taskforge_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Taskforge Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                TaskforgeToml::load(&config_path)?
            } else {
                println!("No taskforge.toml found at {}", config_path.display());
                println!("Using default configuration.");
                TaskforgeToml::default()
            };
            println!();

            println!("[project]");
            println!("  id = \"{}\"", toml.project.id);
            println!("  trunk_branch = \"{}\"", toml.project.trunk_branch);
            println!("  work_mode = \"{}\"", toml.project.work_mode);
            println!();

            println!("[agent]");
            println!("  command = \"{}\"", toml.agent_command());
            if !toml.agent.args.is_empty() {
                println!("  args = {:?}", toml.agent.args);
            }
            println!("  review_command = \"{}\"", toml.review_command());
            println!("  conflict_command = \"{}\"", toml.conflict_command());
            println!("  final_review_command = \"{}\"", toml.final_review_command());
            println!(
                "  inactivity_timeout_secs = {}",
                toml.agent.inactivity_timeout_secs
            );
            println!();

            println!("[backoff]");
            println!("  attempts_per_cycle = {}", toml.backoff.attempts_per_cycle);
            println!(
                "  auto_retry_interval_secs = {}",
                toml.backoff.auto_retry_interval_secs
            );
            println!("  max_auto_retries = {}", toml.backoff.max_auto_retries);
            println!();

            println!("[context]");
            println!("  condense_over_bytes = {}", toml.context.condense_over_bytes);
            println!(
                "  condense_over_dependencies = {}",
                toml.context.condense_over_dependencies
            );
            println!();

            println!("[scheduler]");
            println!("  poll_interval_secs = {}", toml.scheduler.poll_interval_secs);
            println!();

            if project_dir.exists() {
                let config = TaskforgeConfig::new(project_dir.to_path_buf())?;
                println!("Effective values (with env/CLI overrides):");
                println!("  project = \"{}\"", config.project_id());
                println!("  agent command = \"{}\"", config.toml.agent_command());
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No taskforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = TaskforgeToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("taskforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !taskforge_dir.exists() {
                std::fs::create_dir_all(&taskforge_dir)?;
            }

            TaskforgeToml::default().save(&config_path)?;

            println!("Created taskforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] id, trunk_branch, work_mode");
            println!("  - [agent] command and per-role overrides");
            println!("  - [backoff], [context] and [scheduler] tuning");
            println!();
        }
    }

    Ok(())
}
