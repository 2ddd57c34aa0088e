//! Tracing setup for the daemon and the queue tool
//!
//! Both binaries log to `$XDG_STATE_HOME/devtrack/`, one file per UTC day
//! named `devtrack.YYYY-MM-DD.log`. Old days are pruned down to
//! `logging.max_files`.

use crate::config::{Config, LoggingConfig};
use crate::error::Error;
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_PREFIX: &str = "devtrack";
const LOG_SUFFIX: &str = "log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level` when set. Fails if a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();

    // Create log directory if it doesn't exist
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Logging(format!("failed to create log appender: {}", e)))?;

    // Non-blocking writer so a slow disk never stalls delivery
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Build the filter from config or env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // File layer - structured logging with timestamps
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
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing::info!(
        log_file = %current_log_file().display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// File the appender writes to on `date`
pub fn log_file_for(date: NaiveDate) -> PathBuf {
    Config::state_dir().join(format!(
        "{}.{}.{}",
        LOG_PREFIX,
        date.format("%Y-%m-%d"),
        LOG_SUFFIX
    ))
}

/// File receiving today's log lines
pub fn current_log_file() -> PathBuf {
    log_file_for(Utc::now().date_naive())
}
