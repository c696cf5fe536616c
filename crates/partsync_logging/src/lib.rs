//! Shared logging utilities for PartSync binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "partsync=info,partsync_engine=info,partsync_scheduler=info,partsync_db=info";

/// Logging configuration shared by PartSync binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a daily-rolling file writer and stderr output.
///
/// The returned guard must stay alive for the life of the process; dropping
/// it stops the background log writer and loses buffered lines.
pub fn init_logging(config: LogConfig<'_>) -> Result<WorkerGuard> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", config.app_name));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(guard)
}

/// Get the PartSync home directory: ~/.partsync
pub fn partsync_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("PARTSYNC_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".partsync")
}

/// Get the logs directory: ~/.partsync/logs
pub fn logs_dir() -> PathBuf {
    partsync_home().join("logs")
}

/// Default scratch root for pipeline runs: ~/.partsync/scratch
pub fn scratch_root() -> PathBuf {
    partsync_home().join("scratch")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_respects_override() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("PARTSYNC_HOME", dir.path());
        assert_eq!(partsync_home(), dir.path());
        assert_eq!(logs_dir(), dir.path().join("logs"));
        assert_eq!(scratch_root(), dir.path().join("scratch"));
        std::env::remove_var("PARTSYNC_HOME");
    }
}
