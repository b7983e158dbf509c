//! Logging for the margin CLI.
//!
//! Logs go to a file so they never interleave with streamed agent output on
//! stdout. When the log file cannot be opened we fall back to stderr.

use config::PathManager;
use std::fs::OpenOptions;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,margin_core=debug,margin_cli=debug";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize file logging. Safe to call more than once.
pub fn init_logging() {
    if GUARD.get().is_some() {
        return;
    }

    let Some(log_path) = PathManager::log_file_path() else {
        init_stderr_logging();
        return;
    };

    if let Some(parent) = log_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("[margin] Failed to create log directory: {}", e);
            init_stderr_logging();
            return;
        }
    }

    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[margin] Failed to open log file {:?}: {}", log_path, e);
            init_stderr_logging();
            return;
        }
    };

    let (writer, guard) = tracing_appender::non_blocking(file);
    if GUARD.set(guard).is_err() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init();

    tracing::info!(path = ?log_path, "Logging initialized");
}

fn init_stderr_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init();
}
