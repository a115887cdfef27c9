//! # Logger
//!
//! Installs the global `tracing` subscriber: a coloured console layer and a
//! plain-text file layer written through a non-blocking appender. One log file
//! is created per process start; older files in the directory are pruned so
//! only the previous run's log is kept beside the new one.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_PREFIX: &str = "server_mastodon";

/// Sets up logging for the process.
///
/// `log_level` is an `EnvFilter` directive; `RUST_LOG` takes precedence when set.
///
/// # Returns
/// The appender guard. Buffered file output is flushed when it is dropped, so
/// the caller keeps it alive until exit.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    }

    // Keep only the most recent existing log before starting a new one
    cleanup_old_logs(log_dir, 1)?;

    let log_file_name = format!("{}_{}.log", LOG_PREFIX, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let file_appender = tracing_appender::rolling::never(log_dir, log_file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_target(true)
        .with_filter(build_env_filter(log_level)?);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_target(true)
        .with_filter(build_env_filter(log_level)?);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing global tracing subscriber")?;

    tracing::debug!("Logging initialized: level={}, dir={}", log_level, log_dir.display());
    Ok(guard)
}

fn build_env_filter(log_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level.to_lowercase())
            .with_context(|| format!("invalid log level {:?}", log_level)),
    }
}

/// Deletes all but the `keep` newest `.log` files in `log_dir`.
///
/// # Returns
/// The number of files removed.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}
