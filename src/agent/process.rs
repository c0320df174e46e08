use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{AgentExit, AgentRunner, AgentSpec, ENV_INPUT, ENV_RESULT, OnDone};
use crate::errors::AgentError;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "out",
            Self::Stderr => "err",
        }
    }
}

/// Runs agents as child processes with an inactivity watchdog: a process
/// that writes nothing to stdout or stderr for `inactivity_timeout` is
/// killed, regardless of total runtime.
pub struct ProcessAgentRunner {
    inactivity_timeout: Duration,
}

impl ProcessAgentRunner {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self { inactivity_timeout }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, spec: AgentSpec, on_done: OnDone) -> Result<(), AgentError> {
        if let Some(parent) = spec.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AgentError::ArtifactWriteFailed {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let log = File::create(&spec.log_path)
            .await
            .map_err(|source| AgentError::ArtifactWriteFailed {
                path: spec.log_path.clone(),
                source,
            })?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.workdir)
            .env(ENV_INPUT, &spec.input_path)
            .env(ENV_RESULT, &spec.result_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| AgentError::SpawnFailed {
            command: spec.command.clone(),
            source,
        })?;
        tracing::info!(
            label = %spec.label,
            command = %spec.command,
            pid = child.id(),
            log = %spec.log_path.display(),
            "agent spawned"
        );

        let timeout = self.inactivity_timeout;
        tokio::spawn(async move {
            let exit = supervise(child, log, timeout, &spec.label).await;
            tracing::info!(
                label = %spec.label,
                code = exit.code,
                timed_out = exit.timed_out,
                "agent exited"
            );
            on_done(exit).await;
        });
        Ok(())
    }
}

/// Stream output into the log until the process exits or the watchdog fires,
/// then reap the process. Any bytes read count as activity, whether or not
/// they end a line, and the watchdog keeps running after the agent closes its
/// pipes.
async fn supervise(mut child: Child, log: File, inactivity: Duration, label: &str) -> AgentExit {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Stream, Vec<u8>)>();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Stream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Stream::Stderr, tx.clone());
    }
    drop(tx);

    let mut output = OutputLog::new(log, label);
    let mut streams_open = true;
    let mut timed_out = false;
    let mut deadline = Instant::now() + inactivity;

    let status = loop {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some((stream, bytes)) => {
                    deadline = Instant::now() + inactivity;
                    output.record(stream, &bytes).await;
                }
                None => streams_open = false,
            },
            status = child.wait() => break status,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(label, secs = inactivity.as_secs(), "agent produced no output; killing");
                if let Err(e) = child.kill().await {
                    tracing::error!(label, error = %e, "failed to kill inactive agent");
                }
                timed_out = true;
                break child.wait().await;
            }
        }
    };

    // Output still buffered in the pipes when the process exited. A
    // descendant holding the pipes open gets one more inactivity window.
    while streams_open {
        match tokio::time::timeout(inactivity, rx.recv()).await {
            Ok(Some((stream, bytes))) => output.record(stream, &bytes).await,
            Ok(None) | Err(_) => streams_open = false,
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(label, error = %e, "failed to reap agent process");
            None
        }
    };
    AgentExit {
        code,
        timed_out,
        stderr_tail: output.finish().await,
    }
}

/// Splits raw output into prefixed log lines and keeps a stderr tail.
struct OutputLog<'a> {
    log: File,
    log_ok: bool,
    label: &'a str,
    pending_out: Vec<u8>,
    pending_err: Vec<u8>,
    tail: VecDeque<String>,
}

impl<'a> OutputLog<'a> {
    fn new(log: File, label: &'a str) -> Self {
        Self {
            log,
            log_ok: true,
            label,
            pending_out: Vec::new(),
            pending_err: Vec::new(),
            tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    async fn record(&mut self, stream: Stream, bytes: &[u8]) {
        let pending = match stream {
            Stream::Stdout => &mut self.pending_out,
            Stream::Stderr => &mut self.pending_err,
        };
        pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).trim_end_matches('\r').to_string());
        }
        for line in lines {
            self.write_line(stream, line).await;
        }
    }

    async fn write_line(&mut self, stream: Stream, line: String) {
        if self.log_ok {
            let entry = format!("[{}] {}\n", stream.as_str(), line);
            if let Err(e) = self.log.write_all(entry.as_bytes()).await {
                tracing::warn!(label = self.label, error = %e, "agent log write failed; further output not captured");
                self.log_ok = false;
            }
        }
        if stream == Stream::Stderr {
            if self.tail.len() == STDERR_TAIL_LINES {
                self.tail.pop_front();
            }
            self.tail.push_back(line);
        }
    }

    /// Write any unterminated trailing output and return the stderr tail.
    async fn finish(mut self) -> String {
        for stream in [Stream::Stdout, Stream::Stderr] {
            let rest = match stream {
                Stream::Stdout => std::mem::take(&mut self.pending_out),
                Stream::Stderr => std::mem::take(&mut self.pending_err),
            };
            if !rest.is_empty() {
                self.write_line(stream, String::from_utf8_lossy(&rest).into_owned())
                    .await;
            }
        }
        if let Err(e) = self.log.flush().await {
            tracing::warn!(label = self.label, error = %e, "agent log flush failed");
        }
        self.tail.into_iter().collect::<Vec<_>>().join("\n")
    }
}

fn spawn_reader<R>(mut reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
