//! Read-only dashboard snapshot: overview, top operations, recent alerts and
//! a coarse health classification.

use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::alerts::{ActiveAlertCounts, Alert};
use crate::config::{DashboardConfig, HealthConfig};
use crate::stats::OperationStats;
use crate::time::Timestamp;

// ----------------------------------------------------------------------------
// System Health
// ----------------------------------------------------------------------------

/// Coarse health classification, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// Error rate and alerts within normal bounds
    Healthy,
    /// Some issues, but operational
    Degraded,
    /// Major issues
    Unhealthy,
    Critical,
}

impl SystemHealth {
    /// Classify from the aggregate error rate and unacknowledged alert counts.
    ///
    /// The result is the worse of the two individual levels, so raising either
    /// input never improves it.
    pub fn classify(error_rate: f64, alerts: &ActiveAlertCounts, bands: &HealthConfig) -> Self {
        Self::from_error_rate(error_rate, bands).max(Self::from_alerts(alerts, bands))
    }

    pub fn from_error_rate(error_rate: f64, bands: &HealthConfig) -> Self {
        if error_rate.is_nan() || error_rate <= 0.0 {
            SystemHealth::Healthy
        } else if error_rate >= bands.error_rate_critical {
            SystemHealth::Critical
        } else if error_rate >= bands.error_rate_unhealthy {
            SystemHealth::Unhealthy
        } else if error_rate >= bands.error_rate_degraded {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }

    pub fn from_alerts(alerts: &ActiveAlertCounts, bands: &HealthConfig) -> Self {
        if alerts.error >= bands.error_alerts_critical {
            SystemHealth::Critical
        } else if alerts.error >= bands.error_alerts_unhealthy
            || alerts.warning >= bands.warning_alerts_unhealthy
        {
            SystemHealth::Unhealthy
        } else if alerts.warning >= bands.warning_alerts_degraded {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemHealth::Healthy => "healthy",
            SystemHealth::Degraded => "degraded",
            SystemHealth::Unhealthy => "unhealthy",
            SystemHealth::Critical => "critical",
        }
    }
}

impl Display for SystemHealth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Dashboard Data
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    /// Sum of windowed Measurement counts across every operation
    pub total_operations: u64,
    /// Distinct operation names with data
    pub tracked_operations: usize,
    /// Count-weighted mean of per-operation average durations (ms)
    pub average_response_time: f64,
    pub error_rate: f64,
    pub active_trackings: usize,
    /// Unacknowledged alerts
    pub active_alerts: usize,
    pub total_alerts: usize,
}

/// One row of the top-operations ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation: CompactString,
    pub count: usize,
    pub error_count: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub p95_duration_ms: f64,
}

impl From<&OperationStats> for OperationSummary {
    fn from(stats: &OperationStats) -> Self {
        Self {
            operation: stats.operation.clone(),
            count: stats.count,
            error_count: stats.error_count,
            success_rate: stats.success_rate,
            average_duration_ms: stats.average_duration_ms,
            p95_duration_ms: stats.p95_duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    pub overview: Overview,
    pub top_operations: Vec<OperationSummary>,
    /// Newest first
    pub recent_alerts: Vec<Alert>,
    pub system_health: SystemHealth,
    pub generated_at: Timestamp,
}

/// Inputs gathered by the tracker for one dashboard snapshot.
pub struct DashboardInputs<'a> {
    pub stats: &'a [OperationStats],
    pub recent_alerts: Vec<Alert>,
    pub alert_counts: ActiveAlertCounts,
    pub total_alerts: usize,
    pub active_trackings: usize,
}

impl DashboardData {
    pub fn build(inputs: DashboardInputs<'_>, dashboard: &DashboardConfig, health: &HealthConfig) -> Self {
        let overview = overview(&inputs);
        let system_health = SystemHealth::classify(overview.error_rate, &inputs.alert_counts, health);

        let mut ranked: Vec<&OperationStats> = inputs.stats.iter().collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.operation.cmp(&b.operation)));
        let top_operations = ranked
            .into_iter()
            .take(dashboard.top_operations)
            .map(OperationSummary::from)
            .collect();

        let mut recent_alerts = inputs.recent_alerts;
        recent_alerts.truncate(dashboard.recent_alerts);

        Self {
            overview,
            top_operations,
            recent_alerts,
            system_health,
            generated_at: Timestamp::now(),
        }
    }

    /// Snapshot of a tracker with no data.
    pub fn empty() -> Self {
        Self {
            overview: Overview {
                total_operations: 0,
                tracked_operations: 0,
                average_response_time: 0.0,
                error_rate: 0.0,
                active_trackings: 0,
                active_alerts: 0,
                total_alerts: 0,
            },
            top_operations: Vec::new(),
            recent_alerts: Vec::new(),
            system_health: SystemHealth::Healthy,
            generated_at: Timestamp::now(),
        }
    }
}

fn overview(inputs: &DashboardInputs<'_>) -> Overview {
    let total: u64 = inputs.stats.iter().map(|s| s.count as u64).sum();
    let errors: u64 = inputs.stats.iter().map(|s| s.error_count as u64).sum();
    let weighted: f64 = inputs
        .stats
        .iter()
        .map(|s| s.average_duration_ms * s.count as f64)
        .sum();

    let (average_response_time, error_rate) = if total == 0 {
        (0.0, 0.0)
    } else {
        ((weighted / total as f64).max(0.0), errors as f64 / total as f64)
    };

    Overview {
        total_operations: total,
        tracked_operations: inputs.stats.len(),
        average_response_time,
        error_rate,
        active_trackings: inputs.active_trackings,
        active_alerts: inputs.alert_counts.total(),
        total_alerts: inputs.total_alerts,
    }
}
