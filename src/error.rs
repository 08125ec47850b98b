//! Error types for the tracker and its subsystems.
//!
//! Failures of the *wrapped* operation never appear here: they travel back to
//! the caller untouched. These types only describe misuse of the tracker and
//! defects in its own machinery.

use std::path::PathBuf;
use std::string::FromUtf8Error;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Tracker Errors
// ----------------------------------------------------------------------------

/// The main error type for the tracker.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum TrackerError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Caller Contract Violations ----
    #[error("Invalid operation name '{name}': {reason}")]
    InvalidOperation { name: String, reason: String },

    #[error("Invalid tracking options: {message}")]
    InvalidOptions { message: String },

    #[error("Invalid threshold for pattern '{pattern}': {message}")]
    InvalidThreshold { pattern: String, message: String },

    // ---- Export Errors ----
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    // ---- Lifecycle ----
    #[error("Tracker has been disposed")]
    Disposed,

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    pub fn invalid_operation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        TrackerError::InvalidOperation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_options(message: impl Into<String>) -> Self {
        TrackerError::InvalidOptions {
            message: message.into(),
        }
    }

    pub fn invalid_threshold(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        TrackerError::InvalidThreshold {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Check if the caller can fix the call and retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TrackerError::Config(_) => false,
            TrackerError::InvalidOperation { .. } => true,
            TrackerError::InvalidOptions { .. } => true,
            TrackerError::InvalidThreshold { .. } => true,
            TrackerError::Export(_) => false,
            TrackerError::Disposed => false,
            TrackerError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            TrackerError::Config(_) => "config",
            TrackerError::InvalidOperation { .. } => "invalid_operation",
            TrackerError::InvalidOptions { .. } => "invalid_options",
            TrackerError::InvalidThreshold { .. } => "invalid_threshold",
            TrackerError::Export(_) => "export",
            TrackerError::Disposed => "disposed",
            TrackerError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to render configuration: {message}")]
    RenderFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Export Errors
// ----------------------------------------------------------------------------

/// Errors from the export renderers.
///
/// Well-formed tracker state always serializes, so any of these indicates a
/// defect rather than a condition callers are expected to handle.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unsupported export format: '{format}'")]
    UnsupportedFormat { format: String },

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Prometheus encoding failed: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Exposition is not valid UTF-8: {0}")]
    Encoding(#[from] FromUtf8Error),
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;
