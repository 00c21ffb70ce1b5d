//! Logging for the exchange and pickup engines.
//!
//! Engines log every transition at debug level; the file layer keeps those
//! while the console only shows what the filter lets through.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Daily log files are named `<prefix>.<date>`.
pub const LOG_FILE_PREFIX: &str = "tinyexchange.log";

/// Environment variable overriding the filter, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "TINYEXCHANGE_LOG";

const DEFAULT_FILTER: &str = "info,tinyexchange::exchange=debug,tinyexchange::pickup=debug";

/// Initialize logging with a rolling file and console output.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = log_dir()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(DEFAULT_FILTER))
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Log directory: {}", log_dir.display());

    Ok((guard, log_dir))
}

/// Directory holding the daily log files.
pub fn log_dir() -> Result<PathBuf> {
    let home = directories::ProjectDirs::from("com", "tinyexchange", "tinyexchange")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(home.data_dir().join("logs"))
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Console-only logging for tests. Safe to call repeatedly.
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_log_dir_is_under_data_dir() {
        // No home directory in some sandboxes.
        if let Ok(dir) = log_dir() {
            assert!(dir.ends_with("logs"));
        }
    }
}
