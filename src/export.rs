//! JSON and Prometheus text renderers.
//!
//! Both renderers work from an [`ExportSnapshot`] assembled by the tracker,
//! so rendering never touches live state.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::alerts::{Alert, AlertSeverity, Threshold};
use crate::config::ExportConfig;
use crate::dashboard::Overview;
use crate::error::{ExportError, ExportResult};
use crate::measurement::Measurement;
use crate::stats::OperationStats;

// ----------------------------------------------------------------------------
// Export Format
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Json,
    Prometheus,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Prometheus => "prometheus",
        }
    }
}

impl Display for ExportFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "prometheus" | "prom" => Ok(ExportFormat::Prometheus),
            _ => Err(ExportError::UnsupportedFormat { format: s.to_string() }),
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Everything an export needs, captured at one point in time.
#[derive(Debug, Clone)]
pub struct ExportSnapshot {
    /// Most recent Measurements across operations, oldest first
    pub metrics: Vec<Arc<Measurement>>,
    /// Per-operation stats sorted by operation name
    pub stats: Vec<OperationStats>,
    /// Retained alert history, oldest first
    pub alerts: Vec<Alert>,
    pub thresholds: Vec<Threshold>,
    pub overview: Overview,
    pub active_trackings: usize,
}

/// Render `snapshot` in the requested format.
pub fn render(format: ExportFormat, snapshot: &ExportSnapshot, config: &ExportConfig) -> ExportResult<String> {
    match format {
        ExportFormat::Json => render_json(snapshot),
        ExportFormat::Prometheus => render_prometheus(snapshot, config),
    }
}

// ----------------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct JsonExport<'a> {
    timestamp: DateTime<Utc>,
    engine: &'static str,
    version: &'static str,
    overview: &'a Overview,
    metrics: &'a [Arc<Measurement>],
    stats: &'a [OperationStats],
    alerts: &'a [Alert],
    thresholds: &'a [Threshold],
}

pub fn render_json(snapshot: &ExportSnapshot) -> ExportResult<String> {
    let document = JsonExport {
        timestamp: Utc::now(),
        engine: crate::ENGINE_NAME,
        version: crate::ENGINE_VERSION,
        overview: &snapshot.overview,
        metrics: &snapshot.metrics,
        stats: &snapshot.stats,
        alerts: &snapshot.alerts,
        thresholds: &snapshot.thresholds,
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------

/// Quantiles exposed for `operation_duration_seconds`.
const DURATION_QUANTILES: [&str; 5] = ["0", "0.5", "0.95", "0.99", "1"];

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> ExportResult<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Render the text exposition format.
///
/// A fresh registry is built per call so that operations that have left the
/// window do not linger as stale series.
pub fn render_prometheus(snapshot: &ExportSnapshot, config: &ExportConfig) -> ExportResult<String> {
    let prefix = (!config.namespace.is_empty()).then(|| config.namespace.clone());
    let registry = Registry::new_custom(prefix, None)?;

    let duration = gauge_vec(
        &registry,
        "operation_duration_seconds",
        "Windowed operation duration in seconds by quantile",
        &["operation", "quantile"],
    )?;
    let average = gauge_vec(
        &registry,
        "operation_duration_seconds_average",
        "Windowed mean operation duration in seconds",
        &["operation"],
    )?;
    let calls = gauge_vec(
        &registry,
        "operation_calls",
        "Measurements in the operation window",
        &["operation"],
    )?;
    let errors = gauge_vec(
        &registry,
        "operation_errors",
        "Failed Measurements in the operation window",
        &["operation"],
    )?;
    let success_ratio = gauge_vec(
        &registry,
        "operation_success_ratio",
        "Fraction of successful Measurements in the operation window",
        &["operation"],
    )?;
    let memory = gauge_vec(
        &registry,
        "operation_memory_delta_bytes_average",
        "Mean memory delta of Measurements that captured memory",
        &["operation"],
    )?;
    let alerts = gauge_vec(
        &registry,
        "performance_alerts",
        "Retained performance alerts by severity and state",
        &["severity", "state"],
    )?;
    let active = Gauge::with_opts(Opts::new("active_trackings", "Operations currently in flight"))?;
    registry.register(Box::new(active.clone()))?;

    for stats in &snapshot.stats {
        let op = stats.operation.as_str();
        let quantiles = [
            stats.min_duration_ms,
            stats.p50_duration_ms,
            stats.p95_duration_ms,
            stats.p99_duration_ms,
            stats.max_duration_ms,
        ];
        for (quantile, value_ms) in DURATION_QUANTILES.iter().zip(quantiles) {
            duration
                .with_label_values(&[op, quantile])
                .set(value_ms / 1_000.0);
        }
        average
            .with_label_values(&[op])
            .set(stats.average_duration_ms / 1_000.0);
        calls.with_label_values(&[op]).set(stats.count as f64);
        errors.with_label_values(&[op]).set(stats.error_count as f64);
        success_ratio.with_label_values(&[op]).set(stats.success_rate);
        if let Some(avg) = stats.memory_stats.average_delta {
            memory.with_label_values(&[op]).set(avg);
        }
    }

    for severity in AlertSeverity::ALL {
        let (acknowledged, active_count) = snapshot
            .alerts
            .iter()
            .filter(|a| a.severity == severity)
            .fold((0u64, 0u64), |(ack, act), a| {
                if a.acknowledged {
                    (ack + 1, act)
                } else {
                    (ack, act + 1)
                }
            });
        alerts
            .with_label_values(&[severity.as_str(), "active"])
            .set(active_count as f64);
        alerts
            .with_label_values(&[severity.as_str(), "acknowledged"])
            .set(acknowledged as f64);
    }

    active.set(snapshot.active_trackings as f64);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
