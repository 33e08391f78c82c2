//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable naming an optional log file.
pub const LOG_PATH_ENV_VAR: &str = "NODE_AGENT_LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Events always go to stderr. When `log_file` is given they are also written
/// to a daily rolling file next to it; keep the returned guard alive until exit
/// so buffered lines get flushed.
pub fn init(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    match log_file.and_then(rolling_writer) {
        Some((writer, guard)) => {
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            registry().with(stderr_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            registry().with(stderr_layer).init();
            None
        }
    }
}

/// Directory the rolling files go to; a bare file name logs to the working directory.
fn log_dir(log_file: &Path) -> &Path {
    match log_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn rolling_writer(log_file: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let dir = log_dir(log_file);
    let prefix = log_file.file_name()?.to_str()?;

    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("failed to create rolling file appender in {dir:?}: {e}");
            return None;
        }
    };

    Some(tracing_appender::non_blocking(appender))
}
