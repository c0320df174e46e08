//! Tracing subscriber setup.
//!
//! - Interactive commands: stderr only, compact (or JSON with `--log-json`).
//! - `taskforge run`: additionally a daily-rolling file under `.taskforge/logs/`.
//!
//! `RUST_LOG` always wins. Without it the level is `taskforge=info` when
//! `--verbose` is set, `warn` otherwise.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
}

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "taskforge=info" } else { "warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn stderr_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json {
        fmt::layer().with_writer(std::io::stderr).json().boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).compact().boxed()
    }
}

/// Initialize stderr logging. Safe to call more than once; later calls are
/// ignored.
pub fn init(opts: LogOptions) {
    let _ = tracing_subscriber::registry()
        .with(filter(opts.verbose))
        .with(stderr_layer(opts.json))
        .try_init();
}

/// Initialize stderr logging plus a daily-rolling file in `log_dir`.
///
/// The returned guard flushes the file writer on drop; hold it for the life
/// of the process.
pub fn init_with_file(opts: LogOptions, log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "taskforge.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer().with_writer(writer).with_ansi(false).json();
    let _ = tracing_subscriber::registry()
        .with(filter(opts.verbose))
        .with(stderr_layer(opts.json))
        .with(file_layer)
        .try_init();
    Ok(guard)
}
