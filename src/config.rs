//! Tracker configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Files may be TOML or JSON; `PERFTRACK_`-prefixed environment variables
//! override file values, with `__` separating nested keys
//! (`PERFTRACK_RETENTION__MAX_ALERTS=500`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::alerts::Threshold;
use crate::error::{ConfigError, ConfigResult};

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for a tracker instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// System health classification bands
    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Thresholds registered when the tracker is built
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thresholds: Vec<Threshold>,
}

impl TrackerConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let figment = if is_json {
            Figment::new().merge(Json::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };

        let config: Self = figment
            .merge(Env::prefixed("PERFTRACK_").split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document (no environment overrides).
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let retention = &self.retention;
        if retention.max_measurements_per_operation == 0 {
            return Err(ConfigError::invalid_value(
                "retention.max_measurements_per_operation",
                "window size must be at least 1",
            ));
        }
        if retention.max_alerts == 0 {
            return Err(ConfigError::invalid_value(
                "retention.max_alerts",
                "alert history must hold at least 1 alert",
            ));
        }
        if retention.max_age == Some(Duration::ZERO) {
            return Err(ConfigError::invalid_value(
                "retention.max_age",
                "max age must be greater than zero when set",
            ));
        }

        let tracking = &self.tracking;
        if tracking.stale_after.is_zero() {
            return Err(ConfigError::invalid_value(
                "tracking.stale_after",
                "staleness threshold must be greater than zero",
            ));
        }
        if !is_valid_rate(tracking.default_sample_rate) {
            return Err(ConfigError::invalid_value(
                "tracking.default_sample_rate",
                format!("must be within [0, 1] (got {})", tracking.default_sample_rate),
            ));
        }

        if self.dashboard.top_operations == 0 {
            return Err(ConfigError::invalid_value(
                "dashboard.top_operations",
                "must be at least 1",
            ));
        }
        if self.dashboard.recent_alerts == 0 {
            return Err(ConfigError::invalid_value(
                "dashboard.recent_alerts",
                "must be at least 1",
            ));
        }

        self.health.validate()?;

        if !is_valid_metric_namespace(&self.export.namespace) {
            return Err(ConfigError::invalid_value(
                "export.namespace",
                format!(
                    "'{}' is not a valid Prometheus metric name prefix",
                    self.export.namespace
                ),
            ));
        }

        if self.events.broadcast_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "events.broadcast_capacity",
                "must be at least 1",
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "compact" | "pretty") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("expected json, compact or pretty (got '{}')", self.logging.format),
            ));
        }

        for (idx, threshold) in self.thresholds.iter().enumerate() {
            threshold
                .validate()
                .map_err(|e| ConfigError::invalid_value(format!("thresholds[{idx}]"), e.to_string()))?;
        }

        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn generate_default_config() -> ConfigResult<String> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::RenderFailed {
            message: e.to_string(),
        })
    }
}

pub(crate) fn is_valid_rate(rate: f64) -> bool {
    rate.is_finite() && (0.0..=1.0).contains(&rate)
}

fn is_valid_metric_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    match chars.next() {
        None => true,
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        Some(_) => false,
    }
}

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Window size per operation
    #[serde(default = "default_max_measurements")]
    pub max_measurements_per_operation: usize,

    /// Bounded alert history
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,

    /// Measurements older than this are dropped by cleanup
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_measurements_per_operation: default_max_measurements(),
            max_alerts: default_max_alerts(),
            max_age: None,
        }
    }
}

fn default_max_measurements() -> usize {
    crate::DEFAULT_MAX_MEASUREMENTS_PER_OPERATION
}

fn default_max_alerts() -> usize {
    crate::DEFAULT_MAX_ALERTS
}

// ----------------------------------------------------------------------------
// Tracking
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Active contexts older than this are reclaimed by cleanup
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    /// Sample rate used when options carry none
    #[serde(default = "default_sample_rate")]
    pub default_sample_rate: f64,

    /// Upper bound on tags per invocation
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            default_sample_rate: default_sample_rate(),
            max_tags: default_max_tags(),
        }
    }
}

fn default_stale_after() -> Duration {
    crate::DEFAULT_STALE_AFTER
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_max_tags() -> usize {
    crate::MAX_TAGS_PER_MEASUREMENT
}

// ----------------------------------------------------------------------------
// Dashboard
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_top_n")]
    pub top_operations: usize,

    #[serde(default = "default_top_n")]
    pub recent_alerts: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            top_operations: default_top_n(),
            recent_alerts: default_top_n(),
        }
    }
}

fn default_top_n() -> usize {
    10
}

// ----------------------------------------------------------------------------
// Health Bands
// ----------------------------------------------------------------------------

/// Cut-offs for the coarse system health classification.
///
/// Error-rate bands are fractions of windowed Measurements that failed.
/// Alert bands count unacknowledged alerts; info alerts are never counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_error_rate_degraded")]
    pub error_rate_degraded: f64,

    #[serde(default = "default_error_rate_unhealthy")]
    pub error_rate_unhealthy: f64,

    #[serde(default = "default_error_rate_critical")]
    pub error_rate_critical: f64,

    #[serde(default = "default_one")]
    pub warning_alerts_degraded: usize,

    #[serde(default = "default_warning_alerts_unhealthy")]
    pub warning_alerts_unhealthy: usize,

    #[serde(default = "default_one")]
    pub error_alerts_unhealthy: usize,

    #[serde(default = "default_error_alerts_critical")]
    pub error_alerts_critical: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_rate_degraded: default_error_rate_degraded(),
            error_rate_unhealthy: default_error_rate_unhealthy(),
            error_rate_critical: default_error_rate_critical(),
            warning_alerts_degraded: default_one(),
            warning_alerts_unhealthy: default_warning_alerts_unhealthy(),
            error_alerts_unhealthy: default_one(),
            error_alerts_critical: default_error_alerts_critical(),
        }
    }
}

impl HealthConfig {
    /// Bands must be non-decreasing, otherwise more errors could improve health.
    pub fn validate(&self) -> ConfigResult<()> {
        let rates = [
            self.error_rate_degraded,
            self.error_rate_unhealthy,
            self.error_rate_critical,
        ];
        if !rates.iter().all(|r| is_valid_rate(*r)) {
            return Err(ConfigError::invalid_value(
                "health.error_rate_*",
                "error-rate bands must be within [0, 1]",
            ));
        }
        if !(rates[0] <= rates[1] && rates[1] <= rates[2]) {
            return Err(ConfigError::invalid_value(
                "health.error_rate_*",
                "error-rate bands must satisfy degraded <= unhealthy <= critical",
            ));
        }
        if self.warning_alerts_degraded == 0 || self.error_alerts_unhealthy == 0 {
            return Err(ConfigError::invalid_value(
                "health",
                "alert-count bands must be at least 1",
            ));
        }
        if self.warning_alerts_degraded > self.warning_alerts_unhealthy {
            return Err(ConfigError::invalid_value(
                "health.warning_alerts_unhealthy",
                "must be at least warning_alerts_degraded",
            ));
        }
        if self.error_alerts_unhealthy > self.error_alerts_critical {
            return Err(ConfigError::invalid_value(
                "health.error_alerts_critical",
                "must be at least error_alerts_unhealthy",
            ));
        }
        Ok(())
    }
}

fn default_error_rate_degraded() -> f64 {
    0.01
}

fn default_error_rate_unhealthy() -> f64 {
    0.05
}

fn default_error_rate_critical() -> f64 {
    0.15
}

fn default_one() -> usize {
    1
}

fn default_warning_alerts_unhealthy() -> usize {
    5
}

fn default_error_alerts_critical() -> usize {
    3
}

// ----------------------------------------------------------------------------
// Export & Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Cap on raw Measurements included in JSON exports
    #[serde(default = "default_export_measurements")]
    pub max_measurements: usize,

    /// Prefix for Prometheus metric names; empty for none
    #[serde(default)]
    pub namespace: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_measurements: default_export_measurements(),
            namespace: String::new(),
        }
    }
}

fn default_export_measurements() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Queue depth for async subscribers
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_broadcast_capacity() -> usize {
    1024
}

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to this file instead of stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}
