use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::CoreError;

const LOG_FILE_PREFIX: &str = "parley.log";

/// Default directive when `RUST_LOG` is not set.
fn default_directive(level: &str) -> String {
    format!("parley_core={},warn", level)
}

/// Initialize console logging and, optionally, a daily-rotated JSON file.
///
/// Returns a guard that must be kept alive for the duration of the process.
/// When the guard is dropped, any remaining logs are flushed.
pub fn init_logging(
    logs_dir: &Path,
    level: &str,
    file_logging: bool,
    max_files: u32,
) -> Result<Option<WorkerGuard>, CoreError> {
    if file_logging {
        fs::create_dir_all(logs_dir)?;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NONE)
        .with_filter(env_filter);

    if !file_logging {
        // try_init: a second call (tests, embedding hosts) keeps the first subscriber
        let _ = tracing_subscriber::registry().with(console_layer).try_init();
        tracing::info!(level, "Logging initialized (console only)");
        return Ok(None);
    }

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1) as usize)
        .build(logs_dir)
        .map_err(|e| CoreError::Io(format!("Failed to create log file: {}", e)))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(EnvFilter::new(format!("parley_core={}", level)));

    if tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
    {
        tracing::info!(logs_dir = ?logs_dir, level, max_files, "Logging initialized with file output");
    }

    Ok(Some(guard))
}
