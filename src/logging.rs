//! Logging Module
//!
//! Sets up `tracing` output for applications embedding the cache: a compact
//! console layer plus, when a log directory is configured, a daily rolling
//! log file.

use crate::config::LoggingConfig;
use crate::{CacheError, Result};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "hybrid-cache.log";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. Calling this again once a
/// subscriber is installed is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                CacheError::IoError(format!("Failed to create log directory {:?}: {}", log_dir, e))
            })?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        }
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
        .compact();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    match result {
        Ok(()) => {
            info!("Logging initialized at level {}", config.log_level);
            if let Some(log_dir) = &config.log_dir {
                info!("Logs will be written to: {:?}", log_dir);
            }
        }
        Err(_) => {
            // Already initialized, likely in tests
            debug!("Tracing subscriber already initialized, skipping");
        }
    }

    Ok(())
}

/// Remove log files in `log_dir` not modified within `keep_days`.
///
/// Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: u32) -> Result<usize> {
    let cutoff_time = SystemTime::now()
        .checked_sub(Duration::from_secs(u64::from(keep_days) * 24 * 3600))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let is_log = entry
            .file_name()
            .to_string_lossy()
            .starts_with(LOG_FILE_PREFIX);
        if !is_log {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified >= cutoff_time {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("Removed old log file: {:?}", entry.path());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove old log file {:?}: {}", entry.path(), e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_logging_twice_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            log_level: "debug".to_string(),
            log_dir: Some(temp_dir.path().join("logs")),
        };

        init_logging(&config).unwrap();
        init_logging(&LoggingConfig::default()).unwrap();
        assert!(temp_dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_cleanup_keeps_recent_and_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("hybrid-cache.log.2026-10-16"), "recent").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "other").unwrap();

        assert_eq!(cleanup_old_logs(temp_dir.path(), 30).unwrap(), 0);
        assert!(temp_dir.path().join("hybrid-cache.log.2026-10-16").exists());
        assert!(temp_dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(cleanup_old_logs(&temp_dir.path().join("absent"), 1).unwrap(), 0);
    }
}
