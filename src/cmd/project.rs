//! Project initialization: `taskforge init`.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use taskforge::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized taskforge project at {}",
            result.taskforge_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .taskforge/");
        println!("  ├── taskforge.toml   # Configuration (see `taskforge config show`)");
        println!("  ├── tasks.db         # Task graph");
        println!("  ├── logs/agents/     # Agent output per invocation");
        println!("  └── workspaces/      # Per-task worktrees");
        println!();
        println!("Next steps:");
        println!("  1. Run `taskforge create <title>` to add tasks");
        println!("  2. Run `taskforge ready` to see what will be dispatched");
        println!("  3. Run `taskforge run` to start the dispatch loop");
    } else if was_initialized {
        println!(
            "Taskforge project already initialized at {}",
            result.taskforge_dir.display()
        );
        println!("Directory structure verified.");
    } else {
        println!(
            "Completed taskforge initialization at {}",
            result.taskforge_dir.display()
        );
    }

    Ok(())
}
