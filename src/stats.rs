//! Windowed statistics over an operation's retained Measurements.
//!
//! Everything is recomputed from a series snapshot on each call. The window is
//! bounded, so a full sort for the percentiles is cheap.

use std::collections::BTreeMap;

use compact_str::CompactString;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::store::SeriesSnapshot;
use crate::time::Timestamp;

// ----------------------------------------------------------------------------
// Stats Types
// ----------------------------------------------------------------------------

/// Aggregate view of one operation's window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation: CompactString,
    /// Measurements in the window
    pub count: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// `success_count / count`
    pub success_rate: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub average_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub total_duration_ms: f64,
    pub memory_stats: MemoryStats,
    pub cpu_stats: CpuStats,
    pub custom_metrics: BTreeMap<CompactString, CustomMetricStats>,
    /// Measurements ever recorded, including those evicted from the window
    pub lifetime_count: u64,
    pub lifetime_errors: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

impl OperationStats {
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.count as f64
        }
    }
}

/// Memory deltas over the Measurements that captured one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Measurements that carried a memory delta
    pub samples: usize,
    /// `None` when no Measurement captured memory
    pub average_delta: Option<f64>,
    pub min_delta: Option<i64>,
    pub max_delta: Option<i64>,
}

/// CPU time deltas over the Measurements that captured one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub samples: usize,
    pub average_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetricStats {
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

// ----------------------------------------------------------------------------
// Computation
// ----------------------------------------------------------------------------

/// Nearest-rank percentile of an ascending slice: index `ceil(p * n) - 1`,
/// clamped to the slice. Returns 0.0 for an empty slice.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

/// Compute stats for one series. `None` when the window is empty.
pub fn compute(snapshot: &SeriesSnapshot) -> Option<OperationStats> {
    let window = &snapshot.measurements;
    if window.is_empty() {
        return None;
    }

    let count = window.len();
    let success_count = window.iter().filter(|m| m.success).count();
    let error_count = count - success_count;

    let mut durations: Vec<f64> = window.iter().map(|m| m.duration_ms.max(0.0)).collect();
    durations.sort_unstable_by_key(|d| OrderedFloat(*d));

    let min = durations[0];
    let max = durations[count - 1];
    let total: f64 = durations.iter().sum();
    // Rounding in the sum can nudge the mean just outside [min, max].
    let average = (total / count as f64).clamp(min, max);

    Some(OperationStats {
        operation: snapshot.operation.clone(),
        count,
        success_count,
        error_count,
        success_rate: success_count as f64 / count as f64,
        min_duration_ms: min,
        max_duration_ms: max,
        average_duration_ms: average,
        p50_duration_ms: nearest_rank(&durations, 0.50),
        p95_duration_ms: nearest_rank(&durations, 0.95),
        p99_duration_ms: nearest_rank(&durations, 0.99),
        total_duration_ms: total,
        memory_stats: memory_stats(window.iter().filter_map(|m| m.memory_delta_bytes)),
        cpu_stats: cpu_stats(window.iter().filter_map(|m| m.cpu_delta_ms)),
        custom_metrics: custom_metric_stats(snapshot),
        lifetime_count: snapshot.lifetime_count,
        lifetime_errors: snapshot.lifetime_errors,
        first_seen: snapshot.first_seen,
        last_seen: snapshot.last_seen,
    })
}

fn memory_stats(deltas: impl Iterator<Item = i64>) -> MemoryStats {
    let mut stats = MemoryStats::default();
    let mut sum = 0i128;
    for delta in deltas {
        stats.samples += 1;
        sum += delta as i128;
        stats.min_delta = Some(stats.min_delta.map_or(delta, |m| m.min(delta)));
        stats.max_delta = Some(stats.max_delta.map_or(delta, |m| m.max(delta)));
    }
    if stats.samples > 0 {
        stats.average_delta = Some(sum as f64 / stats.samples as f64);
    }
    stats
}

fn cpu_stats(deltas: impl Iterator<Item = f64>) -> CpuStats {
    let mut stats = CpuStats::default();
    let mut sum = 0.0;
    for delta in deltas {
        stats.samples += 1;
        sum += delta;
        stats.max_ms = Some(stats.max_ms.map_or(delta, |m| m.max(delta)));
    }
    if stats.samples > 0 {
        stats.average_ms = Some(sum / stats.samples as f64);
    }
    stats
}

fn custom_metric_stats(snapshot: &SeriesSnapshot) -> BTreeMap<CompactString, CustomMetricStats> {
    let mut acc: BTreeMap<CompactString, (usize, f64, f64, f64)> = BTreeMap::new();
    for (name, value) in snapshot.measurements.iter().flat_map(|m| m.custom_metrics.iter()) {
        let entry = acc
            .entry(name.clone())
            .or_insert((0, f64::INFINITY, f64::NEG_INFINITY, 0.0));
        entry.0 += 1;
        entry.1 = entry.1.min(*value);
        entry.2 = entry.2.max(*value);
        entry.3 += value;
    }

    acc.into_iter()
        .map(|(name, (samples, min, max, sum))| {
            let average = (sum / samples as f64).clamp(min, max);
            (name, CustomMetricStats { samples, min, max, average })
        })
        .collect()
}
