//! Logging setup and structured log macros.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the embedding application. [`init_logging`] is a convenience for
//! binaries (the bundled CLI uses it).

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{TrackerError, TrackerResult};

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

/// Build a filter from a directive string such as `info,perftrack=debug`.
pub fn filter_from_level(level: &str) -> TrackerResult<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| TrackerError::Internal(format!("Invalid log filter '{}': {}", level, e)))
}

/// Initialize the global subscriber based on configuration.
///
/// `RUST_LOG` overrides `config.level` when set. When `config.file` is set,
/// output goes to that file through a non-blocking writer; keep the returned
/// guard alive until shutdown so buffered lines are flushed.
pub fn init_logging(config: &LoggingConfig) -> TrackerResult<Option<WorkerGuard>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => filter_from_level(&config.level)?,
    };

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(path)?);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, config.colors),
    };

    // Build the subscriber based on format
    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            // Pretty format (default)
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| TrackerError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "perftrack::tracker",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

fn file_appender(path: &Path) -> TrackerResult<RollingFileAppender> {
    let file_name = path.file_name().ok_or_else(|| {
        TrackerError::Internal(format!("Log path '{}' has no file name", path.display()))
    })?;
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy().into_owned())
        .build(directory)
        .map_err(|e| TrackerError::Internal(format!("Failed to open log file '{}': {}", path.display(), e)))
}

// ----------------------------------------------------------------------------
// Logging Macros
// ----------------------------------------------------------------------------

/// Log a recorded Measurement
#[macro_export]
macro_rules! log_measurement {
    ($measurement:expr) => {
        tracing::trace!(
            target: "perftrack::metrics",
            operation = %$measurement.operation,
            duration_ms = $measurement.duration_ms,
            success = $measurement.success,
            "Measurement recorded"
        )
    };
    ($measurement:expr, $($field:tt)*) => {
        tracing::trace!(
            target: "perftrack::metrics",
            operation = %$measurement.operation,
            duration_ms = $measurement.duration_ms,
            success = $measurement.success,
            $($field)*,
            "Measurement recorded"
        )
    };
}

/// Log a raised alert
#[macro_export]
macro_rules! log_alert {
    ($alert:expr) => {
        tracing::warn!(
            target: "perftrack::alerts",
            alert_id = %$alert.id,
            operation = %$alert.operation,
            severity = %$alert.severity,
            message = %$alert.message(),
            "Alert triggered"
        )
    };
    ($alert:expr, $($field:tt)*) => {
        tracing::warn!(
            target: "perftrack::alerts",
            alert_id = %$alert.id,
            operation = %$alert.operation,
            severity = %$alert.severity,
            message = %$alert.message(),
            $($field)*,
            "Alert triggered"
        )
    };
}
