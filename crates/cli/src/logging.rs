//! Subscriber setup: stderr always, plus a log file when a directory is configured.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// The returned guard must be held until exit so buffered file output is
/// flushed.
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let file_appender = rolling::never(log_dir, "mergemend.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(Some(guard))
}
