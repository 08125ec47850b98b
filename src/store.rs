//! Per-operation measurement windows.
//!
//! Each operation name owns a bounded, completion-ordered series. Appends
//! evict the oldest entry once the window is full, so memory stays bounded
//! under sustained load and statistics are computed over the window only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;
use serde::Serialize;

use crate::measurement::Measurement;
use crate::time::Timestamp;

// ----------------------------------------------------------------------------
// Operation Series
// ----------------------------------------------------------------------------

/// Bounded window of recent Measurements for one operation.
#[derive(Debug, Clone)]
pub struct OperationSeries {
    /// Measurements in completion order, oldest first
    measurements: VecDeque<Arc<Measurement>>,
    /// Every Measurement ever appended, including evicted ones
    lifetime_count: u64,
    lifetime_errors: u64,
    first_seen: Timestamp,
    last_seen: Timestamp,
}

impl OperationSeries {
    fn new(first: &Measurement) -> Self {
        Self {
            measurements: VecDeque::new(),
            lifetime_count: 0,
            lifetime_errors: 0,
            first_seen: first.end_time,
            last_seen: first.end_time,
        }
    }

    /// Append and evict down to `capacity`. Returns the number evicted.
    fn push(&mut self, measurement: Arc<Measurement>, capacity: usize) -> usize {
        self.lifetime_count += 1;
        if !measurement.success {
            self.lifetime_errors += 1;
        }
        self.last_seen = self.last_seen.max(measurement.end_time);
        self.measurements.push_back(measurement);
        self.truncate(capacity)
    }

    fn truncate(&mut self, capacity: usize) -> usize {
        let excess = self.measurements.len().saturating_sub(capacity.max(1));
        self.measurements.drain(..excess);
        excess
    }

    /// Drop Measurements that completed before `cutoff`.
    fn expire(&mut self, cutoff: Timestamp) -> usize {
        let before = self.measurements.len();
        self.measurements.retain(|m| m.end_time >= cutoff);
        before - self.measurements.len()
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

/// Point-in-time copy of one series, safe to compute over without locks.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub operation: CompactString,
    pub measurements: Vec<Arc<Measurement>>,
    pub lifetime_count: u64,
    pub lifetime_errors: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

impl SeriesSnapshot {
    fn capture(operation: &CompactString, series: &OperationSeries) -> Self {
        Self {
            operation: operation.clone(),
            measurements: series.measurements.iter().cloned().collect(),
            lifetime_count: series.lifetime_count,
            lifetime_errors: series.lifetime_errors,
            first_seen: series.first_seen,
            last_seen: series.last_seen,
        }
    }
}

// ----------------------------------------------------------------------------
// Metric Store
// ----------------------------------------------------------------------------

/// Result of a pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub measurements_pruned: usize,
    pub series_removed: usize,
}

/// Concurrent store of operation series keyed by operation name.
///
/// A series is only ever mutated under its shard's write lock, so readers
/// never observe a partially appended window.
pub struct MetricStore {
    series: DashMap<CompactString, OperationSeries, ahash::RandomState>,
    /// Total Measurements appended
    total_pushed: AtomicU64,
    /// Total Measurements evicted by window overflow
    total_evicted: AtomicU64,
}

impl MetricStore {
    pub fn new() -> Self {
        Self {
            series: DashMap::with_hasher(ahash::RandomState::new()),
            total_pushed: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    /// Append a completed Measurement to its operation's window.
    pub fn push(&self, measurement: Arc<Measurement>, capacity: usize) -> usize {
        let evicted = self
            .series
            .entry(measurement.operation.clone())
            .or_insert_with(|| OperationSeries::new(&measurement))
            .push(measurement, capacity);

        self.total_pushed.fetch_add(1, AtomicOrdering::Relaxed);
        if evicted > 0 {
            self.total_evicted.fetch_add(evicted as u64, AtomicOrdering::Relaxed);
        }
        evicted
    }

    /// Consistent copy of one operation's window.
    pub fn snapshot(&self, operation: &str) -> Option<SeriesSnapshot> {
        self.series
            .get(operation)
            .filter(|series| !series.is_empty())
            .map(|series| SeriesSnapshot::capture(series.key(), series.value()))
    }

    /// Copies of every non-empty window, sorted by operation name.
    pub fn snapshots(&self) -> Vec<SeriesSnapshot> {
        let mut snapshots: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .filter(|entry| !entry.is_empty())
            .map(|entry| SeriesSnapshot::capture(entry.key(), entry.value()))
            .collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }

    /// The `limit` most recently completed Measurements across all operations,
    /// oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<Measurement>> {
        let mut all: Vec<Arc<Measurement>> = self
            .series
            .iter()
            .flat_map(|entry| entry.measurements.iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| {
            a.end_time
                .cmp(&b.end_time)
                .then_with(|| a.operation.cmp(&b.operation))
        });
        let skip = all.len().saturating_sub(limit);
        all.drain(..skip);
        all
    }

    /// Enforce `capacity` on every window and drop Measurements older than
    /// `cutoff`. Series left empty are removed.
    pub fn prune(&self, capacity: usize, cutoff: Option<Timestamp>) -> PruneOutcome {
        let mut measurements_pruned = 0;
        for mut entry in self.series.iter_mut() {
            measurements_pruned += entry.truncate(capacity);
            if let Some(cutoff) = cutoff {
                measurements_pruned += entry.expire(cutoff);
            }
        }

        let before = self.series.len();
        self.series.retain(|_, series| !series.is_empty());
        let series_removed = before.saturating_sub(self.series.len());

        PruneOutcome {
            measurements_pruned,
            series_removed,
        }
    }

    /// Number of retained Measurements across all windows.
    pub fn measurement_count(&self) -> usize {
        self.series.iter().map(|entry| entry.len()).sum()
    }

    /// Number of operations with a series.
    pub fn operation_count(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn clear(&self) {
        self.series.clear();
    }

    pub fn store_stats(&self) -> MetricStoreStats {
        MetricStoreStats {
            operations: self.operation_count(),
            retained_measurements: self.measurement_count(),
            total_pushed: self.total_pushed.load(AtomicOrdering::Relaxed),
            total_evicted: self.total_evicted.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the metric store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricStoreStats {
    pub operations: usize,
    pub retained_measurements: usize,
    pub total_pushed: u64,
    pub total_evicted: u64,
}
