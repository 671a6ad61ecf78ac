//! Logging for forkline
//!
//! Session, run and store events go to daily files named
//! `forkline.log.YYYY-MM-DD` under `$XDG_STATE_HOME/forkline/`. Nothing is
//! written to the terminal, so CLI output stays clean.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix shared by every rotated log file.
pub const LOG_FILE_PREFIX: &str = "forkline.log";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `logging.level`. Keep the returned guard alive for
/// the life of the process; dropping it flushes pending lines.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config, &log_dir)?);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Daily appender in `dir`. Stale `forkline.log.*` files beyond
/// `max_files` are pruned when it opens; `max_files = 0` keeps one.
fn file_appender(config: &LoggingConfig, dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {e}")))
}

/// Keeps the background log writer alive.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn log_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(LOG_FILE_PREFIX))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_appender_writes_prefixed_daily_file() {
        let dir = TempDir::new().unwrap();
        let mut appender = file_appender(&LoggingConfig::default(), dir.path()).unwrap();
        appender.write_all(b"run started\n").unwrap();
        appender.flush().unwrap();

        let files = log_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("forkline.log."), "got {files:?}");
        let content = std::fs::read_to_string(dir.path().join(&files[0])).unwrap();
        assert_eq!(content, "run started\n");
        assert!(Config::log_path().ends_with(LOG_FILE_PREFIX));
    }

    #[test]
    fn test_appender_prunes_to_max_files() {
        let dir = TempDir::new().unwrap();
        for day in 1..=4 {
            std::fs::write(dir.path().join(format!("forkline.log.2020-01-0{day}")), "old\n").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "keep\n").unwrap();

        let config = LoggingConfig {
            max_files: 2,
            ..LoggingConfig::default()
        };
        let _appender = file_appender(&config, dir.path()).unwrap();

        // one stale file survives next to today's
        assert_eq!(log_files(dir.path()).len(), 2);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_zero_max_files_still_prunes() {
        let dir = TempDir::new().unwrap();
        for day in 1..=3 {
            std::fs::write(dir.path().join(format!("forkline.log.2020-01-0{day}")), "old\n").unwrap();
        }

        let config = LoggingConfig {
            max_files: 0,
            ..LoggingConfig::default()
        };
        let _appender = file_appender(&config, dir.path()).unwrap();

        let files = log_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(!files[0].starts_with("forkline.log.2020"), "got {files:?}");
    }
}
