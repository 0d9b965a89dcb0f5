//! Logging setup.
//!
//! Every subcommand writes human-readable `tracing` output to stderr. When a
//! logs directory is configured, events are also written as JSON lines to
//! `{logs_dir}/smsgate.log.YYYY-MM-DD`, rotated daily. `RUST_LOG` filters
//! both outputs and defaults to `info`.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for rotated log files.
const LOG_FILE_PREFIX: &str = "smsgate.log";

/// Flushes buffered file output when dropped. Hold it until exit.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_writer: WorkerGuard,
}

/// Install the global subscriber.
///
/// Returns a guard when file logging is enabled.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or a global subscriber is already
/// installed.
pub fn init(logs_dir: Option<&Path>) -> anyhow::Result<Option<LoggingGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file, guard) = match logs_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create logs directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().json().with_writer(writer);
            (Some(layer), Some(LoggingGuard { _file_writer: guard }))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
