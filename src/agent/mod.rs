//! Agent invocation.
//!
//! An agent is an external process. It receives its input as a JSON artifact
//! (path in `TASKFORGE_INPUT`), may write a JSON result artifact (path in
//! `TASKFORGE_RESULT`), and signals completion by exiting. The runner's
//! `on_done` callback is the only completion signal the rest of taskforge
//! consumes.

pub mod artifact;
mod process;
mod reviewers;

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::errors::AgentError;

pub use process::ProcessAgentRunner;
pub use reviewers::{
    ConflictResolver, FinalReview, FinalReviewStatus, FinalReviewer, ProcessConflictResolver,
    ProcessFinalReviewer, ProposedTask,
};

/// Environment variable carrying the input artifact path.
pub const ENV_INPUT: &str = "TASKFORGE_INPUT";
/// Environment variable carrying the result artifact path.
pub const ENV_RESULT: &str = "TASKFORGE_RESULT";

/// Program and fixed arguments used to launch one kind of agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a spec for this command. `artifact_dir` holds `input.json` and
    /// `result.json`.
    pub fn spec(
        &self,
        label: impl Into<String>,
        workdir: &Path,
        artifact_dir: &Path,
        log_path: PathBuf,
    ) -> AgentSpec {
        AgentSpec {
            label: label.into(),
            command: self.program.clone(),
            args: self.args.clone(),
            workdir: workdir.to_path_buf(),
            input_path: artifact::input_path(artifact_dir),
            result_path: artifact::result_path(artifact_dir),
            log_path,
        }
    }
}

/// Everything needed to launch one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    /// Human-readable tag for logs, e.g. `tf-1a2b3c4d/coding`.
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub input_path: PathBuf,
    pub result_path: PathBuf,
    /// Combined stdout/stderr capture.
    pub log_path: PathBuf,
}

/// How an agent process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Killed by the inactivity watchdog.
    pub timed_out: bool,
    /// Last lines of stderr, for failure reasons.
    pub stderr_tail: String,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        let status = if self.timed_out {
            "killed after inactivity timeout".to_string()
        } else {
            match self.code {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            }
        };
        if self.stderr_tail.trim().is_empty() {
            status
        } else {
            format!("{}: {}", status, self.stderr_tail.trim())
        }
    }
}

/// Completion callback handed to [`AgentRunner::run`].
pub type OnDone = Box<dyn FnOnce(AgentExit) -> BoxFuture<'static, ()> + Send>;

/// Launches agent processes.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start the agent and return once it is running. `on_done` is invoked
    /// exactly once when it exits. An error means nothing was started and
    /// `on_done` will not be called.
    async fn run(&self, spec: AgentSpec, on_done: OnDone) -> Result<(), AgentError>;
}

/// Run an agent and wait for it to exit.
pub async fn run_to_completion(
    runner: &dyn AgentRunner,
    spec: AgentSpec,
) -> Result<AgentExit, AgentError> {
    let (tx, rx) = oneshot::channel();
    runner
        .run(
            spec,
            Box::new(move |exit| {
                async move {
                    let _ = tx.send(exit);
                }
                .boxed()
            }),
        )
        .await?;
    rx.await
        .map_err(|_| AgentError::Other(anyhow!("agent runner dropped its completion callback")))
}

/// Per-invocation log file: `<dir>/<task>-<phase>-<timestamp>.log`.
pub fn log_file(log_dir: &Path, task_id: &str, phase: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    log_dir.join(format!("{}-{}-{}.log", task_id, phase, stamp))
}
