//! The tracker facade: wrapper and manual entry points, queries, cleanup and
//! lifecycle.
//!
//! A [`PerformanceTracker`] is an explicit object; callers share it by
//! reference or `Arc`. All work happens inside caller-invoked methods, there
//! is no background task.

use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::FutureExt;
use quanta::Clock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::alerts::{Alert, AlertEngine, AlertId, Threshold};
use crate::config::{is_valid_rate, TrackerConfig};
use crate::dashboard::{DashboardData, DashboardInputs};
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventBus, EventKind, ListenerId, TrackerEvent};
use crate::export::{self, ExportFormat, ExportSnapshot};
use crate::measurement::{ErrorInfo, Measurement, TrackOptions};
use crate::resources::{ProcessProbe, ResourceProbe, ResourceSample};
use crate::sampling::{RandomSampler, Sampler};
use crate::stats::{self, OperationStats};
use crate::store::{MetricStore, MetricStoreStats};
use crate::time::{duration_ms, Timestamp};
use crate::tracking::{ActiveTrackingTable, TrackingContext, TrackingId};
use crate::MAX_OPERATION_NAME_LENGTH;

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Assembles a tracker with optional replacements for the clock, resource
/// probe and sampler.
pub struct TrackerBuilder {
    config: TrackerConfig,
    clock: Option<Clock>,
    probe: Option<Arc<dyn ResourceProbe>>,
    sampler: Option<Arc<dyn Sampler>>,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self {
            config: TrackerConfig::default(),
            clock: None,
            probe: None,
            sampler: None,
        }
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Monotonic clock used for durations and staleness.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Some(Arc::new(sampler));
        self
    }

    /// Validate the configuration and build the tracker. Thresholds listed in
    /// the configuration are registered before the tracker is returned.
    pub fn build(self) -> TrackerResult<PerformanceTracker> {
        self.config.validate()?;

        let alerts = AlertEngine::new();
        for threshold in &self.config.thresholds {
            alerts.set_threshold(threshold.clone())?;
        }

        let tracker = PerformanceTracker {
            events: EventBus::new(self.config.events.broadcast_capacity),
            config: ArcSwap::from_pointee(self.config),
            clock: self.clock.unwrap_or_else(Clock::new),
            probe: self.probe.unwrap_or_else(|| Arc::new(ProcessProbe::new())),
            sampler: self.sampler.unwrap_or_else(|| Arc::new(RandomSampler)),
            store: MetricStore::new(),
            active: ActiveTrackingTable::new(),
            alerts,
            disposed: AtomicBool::new(false),
            created_at: Timestamp::now(),
        };

        info!(
            target: "perftrack::tracker",
            version = crate::ENGINE_VERSION,
            thresholds = tracker.alerts.thresholds().len(),
            "Performance tracker created"
        );
        Ok(tracker)
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

/// What a [`PerformanceTracker::cleanup`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Abandoned contexts discarded without producing a Measurement
    pub stale_trackings_evicted: usize,
    pub measurements_pruned: usize,
    pub alerts_pruned: usize,
    /// Operations whose window became empty
    pub series_removed: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Display for CleanupReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stale trackings, {} measurements, {} alerts, {} series",
            self.stale_trackings_evicted, self.measurements_pruned, self.alerts_pruned, self.series_removed
        )
    }
}

/// Internal counters of a tracker instance.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub disposed: bool,
    pub store: MetricStoreStats,
    pub active_trackings: usize,
    /// Age of the longest-running in-flight context
    #[serde(with = "humantime_serde")]
    pub oldest_tracking_age: Option<Duration>,
    pub thresholds: usize,
    pub alerts_retained: usize,
    pub alerts_raised: u64,
    pub alerts_evicted: u64,
    pub events_emitted: u64,
    pub listener_panics: u64,
}

// ----------------------------------------------------------------------------
// Performance Tracker
// ----------------------------------------------------------------------------

pub struct PerformanceTracker {
    config: ArcSwap<TrackerConfig>,
    clock: Clock,
    probe: Arc<dyn ResourceProbe>,
    sampler: Arc<dyn Sampler>,
    store: MetricStore,
    active: ActiveTrackingTable,
    alerts: AlertEngine,
    events: EventBus,
    disposed: AtomicBool,
    created_at: Timestamp,
}

impl PerformanceTracker {
    /// Tracker with the given configuration and default seams.
    pub fn new(config: TrackerConfig) -> TrackerResult<Self> {
        TrackerBuilder::new().config(config).build()
    }

    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    /// Current configuration
    pub fn config(&self) -> Arc<TrackerConfig> {
        self.config.load_full()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(AtomicOrdering::Acquire)
    }

    fn ensure_active(&self) -> TrackerResult<()> {
        if self.is_disposed() {
            Err(TrackerError::Disposed)
        } else {
            Ok(())
        }
    }

    // ---- Wrapped Operations ----

    /// Run `work` once, recording a Measurement if the invocation is sampled.
    ///
    /// The outer result reports tracker misuse, in which case `work` never
    /// runs. The inner result is exactly what `work` returned. A panic in
    /// `work` is recorded as a failure and then resumed.
    pub fn track<T, E, F>(&self, operation: &str, options: TrackOptions, work: F) -> TrackerResult<Result<T, E>>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let id = self.begin(operation, options)?;
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(outcome) => {
                self.finish(&id, outcome.as_ref().err().map(|e| ErrorInfo::from_error(e)));
                Ok(outcome)
            }
            Err(payload) => {
                self.finish(&id, Some(ErrorInfo::from_panic(&*payload)));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Async form of [`track`](Self::track). No lock is held while `work` is
    /// pending; if the returned future is dropped early the context stays in
    /// flight until `cleanup` reclaims it.
    pub async fn track_async<T, E, Fut>(
        &self,
        operation: &str,
        options: TrackOptions,
        work: Fut,
    ) -> TrackerResult<Result<T, E>>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let id = self.begin(operation, options)?;
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => {
                self.finish(&id, outcome.as_ref().err().map(|e| ErrorInfo::from_error(e)));
                Ok(outcome)
            }
            Err(payload) => {
                self.finish(&id, Some(ErrorInfo::from_panic(&*payload)));
                panic::resume_unwind(payload)
            }
        }
    }

    // ---- Manual Tracking ----

    /// Open a tracking context with default options.
    pub fn start_tracking(&self, operation: &str) -> TrackerResult<TrackingId> {
        self.begin(operation, TrackOptions::default())
    }

    pub fn start_tracking_with(&self, operation: &str, options: TrackOptions) -> TrackerResult<TrackingId> {
        self.begin(operation, options)
    }

    /// Close a tracking context.
    ///
    /// Returns `None` without side effects when the handle is unknown, was
    /// already ended, or was reclaimed as stale. Also `None` when the
    /// invocation was not sampled. `error` is ignored on success; a failure
    /// without details is recorded as unspecified.
    pub fn end_tracking(&self, id: TrackingId, success: bool, error: Option<ErrorInfo>) -> Option<Arc<Measurement>> {
        let error = if success {
            None
        } else {
            Some(error.unwrap_or_else(ErrorInfo::unspecified))
        };
        let measurement = self.finish(&id, error);
        if measurement.is_none() {
            debug!(target: "perftrack::tracker", tracking_id = %id, "end_tracking produced no measurement");
        }
        measurement
    }

    pub fn is_tracking(&self, id: TrackingId) -> bool {
        self.active.contains(&id)
    }

    pub fn active_tracking_count(&self) -> usize {
        self.active.len()
    }

    fn begin(&self, operation: &str, options: TrackOptions) -> TrackerResult<TrackingId> {
        self.ensure_active()?;
        validate_operation(operation)?;

        let config = self.config.load();
        let rate = options.sample_rate.unwrap_or(config.tracking.default_sample_rate);
        if !is_valid_rate(rate) {
            return Err(TrackerError::invalid_options(format!(
                "sample rate must be a finite number in [0, 1], got {}",
                rate
            )));
        }
        if options.tags.len() > config.tracking.max_tags {
            return Err(TrackerError::invalid_options(format!(
                "{} tags exceed the limit of {}",
                options.tags.len(),
                config.tracking.max_tags
            )));
        }

        let sampled = self.sampler.should_sample(rate);
        let baseline = ResourceSample::capture(
            self.probe.as_ref(),
            options.include_memory_usage,
            options.include_cpu_usage,
        );
        let context = TrackingContext {
            operation: operation.into(),
            started_wall: Timestamp::now(),
            started: self.clock.now(),
            baseline,
            options,
            sampled,
        };
        Ok(self.active.insert(context))
    }

    /// Consume the context and, if sampled, record its Measurement.
    fn finish(&self, id: &TrackingId, error: Option<ErrorInfo>) -> Option<Arc<Measurement>> {
        let context = self.active.remove(id)?;
        let ended = self.clock.now();
        if !context.sampled || self.is_disposed() {
            return None;
        }

        let after = ResourceSample::capture(
            self.probe.as_ref(),
            context.options.include_memory_usage,
            context.options.include_cpu_usage,
        );
        let delta = context.baseline.delta_to(&after);
        let duration = context.age(ended);
        let custom_metrics = context.options.evaluate_custom_metrics(&context.operation);
        // Custom metrics run caller code, which may have disposed the tracker.
        if self.is_disposed() {
            return None;
        }

        let measurement = Arc::new(Measurement {
            start_time: context.started_wall,
            end_time: context.started_wall.add_duration(duration),
            duration_ms: duration_ms(duration),
            success: error.is_none(),
            error,
            memory_delta_bytes: delta.memory_bytes,
            cpu_delta_ms: delta.cpu_ms,
            custom_metrics,
            tags: context.options.tags,
            sampled: true,
            operation: context.operation,
        });
        self.record(measurement.clone());
        Some(measurement)
    }

    /// Store, evaluate thresholds, then publish: the metric event first, then
    /// one alert event per raised alert.
    fn record(&self, measurement: Arc<Measurement>) {
        let config = self.config.load();
        self.store
            .push(measurement.clone(), config.retention.max_measurements_per_operation);
        let raised = self.alerts.evaluate(&measurement, config.retention.max_alerts);

        crate::log_measurement!(measurement, alerts = raised.len());
        self.events.emit(TrackerEvent::Metric(measurement));

        for alert in raised {
            crate::log_alert!(alert);
            self.events.emit(TrackerEvent::Alert(Arc::new(alert)));
        }
    }

    // ---- Thresholds & Alerts ----

    /// Register a threshold, replacing any with an identical pattern.
    pub fn set_threshold(&self, threshold: Threshold) -> TrackerResult<()> {
        self.ensure_active()?;
        let pattern = threshold.operation_pattern.clone();
        self.alerts.set_threshold(threshold)?;
        debug!(target: "perftrack::alerts", %pattern, "Threshold registered");
        Ok(())
    }

    pub fn remove_threshold(&self, pattern: &str) -> bool {
        self.alerts.remove_threshold(pattern)
    }

    pub fn thresholds(&self) -> Vec<Threshold> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.alerts.thresholds()
    }

    /// Mark an alert acknowledged. Re-acknowledging still returns true;
    /// unknown or evicted ids return false.
    pub fn acknowledge_alert(&self, id: AlertId) -> bool {
        match self.alerts.acknowledge(id) {
            Some(alert) => {
                debug!(target: "perftrack::alerts", alert_id = %id, "Alert acknowledged");
                self.events.emit(TrackerEvent::AlertAcknowledged(Arc::new(alert)));
                true
            }
            None => false,
        }
    }

    /// Newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.alerts.recent(limit)
    }

    /// Unacknowledged alerts, newest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.alerts.active()
    }

    pub fn alert(&self, id: AlertId) -> Option<Alert> {
        if self.is_disposed() {
            return None;
        }
        self.alerts.get(id)
    }

    // ---- Queries ----

    /// Windowed statistics for `operation`, or `None` if it has no data.
    /// Always `None` once disposed, even if a late record slipped in.
    pub fn get_stats(&self, operation: &str) -> Option<OperationStats> {
        if self.is_disposed() {
            return None;
        }
        self.store
            .snapshot(operation)
            .and_then(|snapshot| stats::compute(&snapshot))
    }

    /// Statistics for every operation with data, sorted by operation name.
    pub fn all_stats(&self) -> Vec<OperationStats> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.store
            .snapshots()
            .iter()
            .filter_map(stats::compute)
            .collect()
    }

    pub fn get_dashboard_data(&self) -> DashboardData {
        if self.is_disposed() {
            return DashboardData::empty();
        }
        let config = self.config.load();
        let stats = self.all_stats();
        self.dashboard_from(&stats, &config)
    }

    fn dashboard_from(&self, stats: &[OperationStats], config: &TrackerConfig) -> DashboardData {
        DashboardData::build(
            DashboardInputs {
                stats,
                recent_alerts: self.alerts.recent(config.dashboard.recent_alerts),
                alert_counts: self.alerts.active_counts(),
                total_alerts: self.alerts.len(),
                active_trackings: self.active.len(),
            },
            &config.dashboard,
            &config.health,
        )
    }

    /// Serialize current state in `format`.
    pub fn export_metrics(&self, format: ExportFormat) -> TrackerResult<String> {
        let config = self.config.load();
        let stats = self.all_stats();
        let overview = self.dashboard_from(&stats, &config).overview;
        let snapshot = ExportSnapshot {
            metrics: self.store.recent(config.export.max_measurements),
            stats,
            alerts: self.alerts.all(),
            thresholds: self.alerts.thresholds(),
            overview,
            active_trackings: self.active.len(),
        };
        Ok(export::render(format, &snapshot, &config.export)?)
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        TrackerStats {
            uptime: Timestamp::now().duration_since(self.created_at),
            disposed: self.is_disposed(),
            store: self.store.store_stats(),
            active_trackings: self.active.len(),
            oldest_tracking_age: self.active.oldest_age(self.clock.now()),
            thresholds: self.alerts.thresholds().len(),
            alerts_retained: self.alerts.len(),
            alerts_raised: self.alerts.total_raised(),
            alerts_evicted: self.alerts.total_evicted(),
            events_emitted: self.events.emitted(),
            listener_panics: self.events.listener_panics(),
        }
    }

    // ---- Events ----

    pub fn on<F>(&self, kind: EventKind, callback: F) -> TrackerResult<ListenerId>
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        Ok(self.events.on(kind, callback))
    }

    pub fn once<F>(&self, kind: EventKind, callback: F) -> TrackerResult<ListenerId>
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        Ok(self.events.once(kind, callback))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Broadcast receiver for async consumers; closed after `dispose`.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    // ---- Maintenance & Lifecycle ----

    /// Reclaim stale contexts and enforce retention bounds. Safe to call at
    /// any time, including concurrently with tracking.
    pub fn cleanup(&self) -> CleanupReport {
        let config = self.config.load();

        let stale_trackings_evicted = self
            .active
            .evict_stale(self.clock.now(), config.tracking.stale_after);
        let cutoff = config
            .retention
            .max_age
            .map(|age| Timestamp::now().sub_duration(age));
        let pruned = self
            .store
            .prune(config.retention.max_measurements_per_operation, cutoff);
        let alerts_pruned = self.alerts.prune(config.retention.max_alerts);

        let report = CleanupReport {
            stale_trackings_evicted,
            measurements_pruned: pruned.measurements_pruned,
            alerts_pruned,
            series_removed: pruned.series_removed,
        };
        if report.is_empty() {
            debug!(target: "perftrack::cleanup", "Cleanup found nothing to remove");
        } else {
            info!(
                target: "perftrack::cleanup",
                stale_trackings = report.stale_trackings_evicted,
                measurements = report.measurements_pruned,
                alerts = report.alerts_pruned,
                series = report.series_removed,
                "Cleanup completed"
            );
        }
        report
    }

    /// Swap in a new configuration. Thresholds it lists are registered;
    /// smaller retention bounds take effect on the next `cleanup`.
    pub fn reconfigure(&self, config: TrackerConfig) -> TrackerResult<()> {
        self.ensure_active()?;
        config.validate()?;
        for threshold in &config.thresholds {
            self.alerts.set_threshold(threshold.clone())?;
        }
        self.config.store(Arc::new(config));
        info!(target: "perftrack::config", "Tracker reconfigured");
        Ok(())
    }

    /// Detach listeners, close subscriptions and clear all state.
    ///
    /// Work already in flight still completes and returns its outcome, but
    /// records nothing. Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.events.close();
        self.active.clear();
        self.store.clear();
        self.alerts.clear();
        self.alerts.clear_thresholds();
        info!(target: "perftrack::tracker", "Performance tracker disposed");
    }
}

impl Debug for PerformanceTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("operations", &self.store.operation_count())
            .field("active_trackings", &self.active.len())
            .field("alerts", &self.alerts.len())
            .field("events", &self.events)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn validate_operation(operation: &str) -> TrackerResult<()> {
    if operation.trim().is_empty() {
        return Err(TrackerError::invalid_operation(operation, "operation name must not be empty"));
    }
    if operation.len() > MAX_OPERATION_NAME_LENGTH {
        return Err(TrackerError::invalid_operation(
            operation,
            format!("operation name exceeds {} bytes", MAX_OPERATION_NAME_LENGTH),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::alerts::{AlertSeverity, Violation};
    use crate::dashboard::SystemHealth;
    use crate::sampling::{FixedSampler, SeededSampler};

    /// Memory grows by a fixed step on every reading.
    #[derive(Debug, Default)]
    struct SteppingProbe {
        memory: AtomicU64,
    }

    impl ResourceProbe for SteppingProbe {
        fn memory_bytes(&self) -> Option<u64> {
            Some(self.memory.fetch_add(4096, AtomicOrdering::SeqCst) + 4096)
        }

        fn cpu_time(&self) -> Option<Duration> {
            None
        }
    }

    fn tracker() -> PerformanceTracker {
        PerformanceTracker::builder()
            .probe(SteppingProbe::default())
            .build()
            .unwrap()
    }

    fn mocked() -> (PerformanceTracker, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let tracker = PerformanceTracker::builder()
            .clock(clock)
            .probe(SteppingProbe::default())
            .build()
            .unwrap();
        (tracker, mock)
    }

    fn ok(tracker: &PerformanceTracker, operation: &str) {
        tracker
            .track(operation, TrackOptions::new(), || Ok::<_, String>(()))
            .unwrap()
            .unwrap();
    }

    fn fail(tracker: &PerformanceTracker, operation: &str) {
        let outcome = tracker
            .track(operation, TrackOptions::new(), || Err::<(), _>("boom".to_string()))
            .unwrap();
        assert_eq!(outcome, Err("boom".to_string()));
    }

    fn event_log(tracker: &PerformanceTracker) -> Arc<Mutex<Vec<EventKind>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Metric, EventKind::Alert, EventKind::AlertAcknowledged] {
            let log = log.clone();
            tracker.on(kind, move |event| log.lock().push(event.kind())).unwrap();
        }
        log
    }

    #[test]
    fn test_track_returns_work_outcome_unchanged() {
        let tracker = tracker();
        let value = tracker
            .track("api.getUserData", TrackOptions::new(), || Ok::<_, String>(42))
            .unwrap();
        assert_eq!(value, Ok(42));
        assert_eq!(tracker.active_tracking_count(), 0);
    }

    #[test]
    fn test_count_matches_invocations() {
        let tracker = tracker();
        for _ in 0..25 {
            ok(&tracker, "db.query");
        }
        assert_eq!(tracker.get_stats("db.query").unwrap().count, 25);
        assert!(tracker.get_stats("never.measured").is_none());
    }

    #[test]
    fn test_success_rate_is_exact() {
        let tracker = tracker();
        for i in 0..10 {
            if i % 3 == 0 {
                fail(&tracker, "mixed");
            } else {
                ok(&tracker, "mixed");
            }
        }

        let stats = tracker.get_stats("mixed").unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!(stats.error_count, 4);
        assert_eq!(stats.success_count, 6);
        assert_eq!(stats.success_rate, 6.0 / 10.0);
    }

    #[test]
    fn test_failure_records_error_info() {
        let tracker = tracker();
        fail(&tracker, "fails");

        let recent = tracker.store.recent(1);
        let error = recent[0].error.as_ref().unwrap();
        assert!(!recent[0].success);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn test_ordering_invariants_with_mock_clock() {
        let (tracker, mock) = mocked();
        for ms in [5u64, 80, 12, 300, 41, 7, 150] {
            tracker
                .track("varied", TrackOptions::new(), || {
                    mock.increment(Duration::from_millis(ms));
                    Ok::<_, String>(())
                })
                .unwrap()
                .unwrap();
        }

        let stats = tracker.get_stats("varied").unwrap();
        assert_eq!(stats.min_duration_ms, 5.0);
        assert_eq!(stats.max_duration_ms, 300.0);
        assert!(stats.min_duration_ms <= stats.average_duration_ms);
        assert!(stats.average_duration_ms <= stats.max_duration_ms);
        assert!(stats.p50_duration_ms <= stats.p95_duration_ms);
        assert!(stats.p95_duration_ms <= stats.p99_duration_ms);
    }

    #[test]
    fn test_sampling_rate_half() {
        let tracker = PerformanceTracker::builder()
            .sampler(SeededSampler::new(7))
            .build()
            .unwrap();
        for _ in 0..100 {
            tracker
                .track("sampled", TrackOptions::new().sample_rate(0.5), || Ok::<_, String>(()))
                .unwrap()
                .unwrap();
        }

        let count = tracker.get_stats("sampled").map(|s| s.count).unwrap_or(0);
        assert!(count > 30 && count < 100, "recorded {count} of 100");
    }

    #[test]
    fn test_unsampled_work_still_runs() {
        let tracker = PerformanceTracker::builder()
            .sampler(FixedSampler(false))
            .build()
            .unwrap();
        let ran = AtomicUsize::new(0);
        let outcome = tracker
            .track("skipped", TrackOptions::new().sample_rate(0.1), || {
                ran.fetch_add(1, AtomicOrdering::SeqCst);
                Ok::<_, String>("done")
            })
            .unwrap();

        assert_eq!(outcome, Ok("done"));
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert!(tracker.get_stats("skipped").is_none());

        let id = tracker.start_tracking("manual.skipped").unwrap();
        assert!(tracker.end_tracking(id, true, None).is_none());
    }

    #[test]
    fn test_slow_threshold_fires_exactly_once() {
        let (tracker, mock) = mocked();
        tracker
            .set_threshold(Threshold::new("slow.*").max_duration_ms(50.0))
            .unwrap();
        let alerts = Arc::new(AtomicUsize::new(0));
        let counter = alerts.clone();
        tracker
            .on(EventKind::Alert, move |_| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .unwrap();

        tracker
            .track("slow.report", TrackOptions::new(), || {
                mock.increment(Duration::from_millis(100));
                Ok::<_, String>(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(alerts.load(AtomicOrdering::SeqCst), 1);

        tracker
            .track("slow.lookup", TrackOptions::new(), || {
                mock.increment(Duration::from_millis(10));
                Ok::<_, String>(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(alerts.load(AtomicOrdering::SeqCst), 1);

        let alert = &tracker.recent_alerts(1)[0];
        assert_eq!(alert.operation, "slow.report");
        assert!(matches!(alert.violations[0], Violation::Duration { .. }));
    }

    #[test]
    fn test_metric_event_precedes_alerts() {
        let (tracker, mock) = mocked();
        tracker
            .set_threshold(Threshold::new("*").max_duration_ms(1.0))
            .unwrap();
        tracker
            .set_threshold(
                Threshold::new("checkout.*")
                    .max_duration_ms(10.0)
                    .severity(AlertSeverity::Error),
            )
            .unwrap();
        let log = event_log(&tracker);

        tracker
            .track("checkout.pay", TrackOptions::new(), || {
                mock.increment(Duration::from_millis(20));
                Ok::<_, String>(())
            })
            .unwrap()
            .unwrap();

        assert_eq!(*log.lock(), vec![EventKind::Metric, EventKind::Alert, EventKind::Alert]);
    }

    #[test]
    fn test_memory_threshold_uses_captured_delta() {
        let tracker = tracker();
        tracker
            .set_threshold(Threshold::new("mem.*").max_memory_delta_bytes(1000))
            .unwrap();

        tracker
            .track("mem.load", TrackOptions::new().include_memory_usage(true), || Ok::<_, String>(()))
            .unwrap()
            .unwrap();
        tracker
            .track("mem.cached", TrackOptions::new(), || Ok::<_, String>(()))
            .unwrap()
            .unwrap();

        let alerts = tracker.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].operation, "mem.load");
        assert_eq!(
            tracker.get_stats("mem.load").unwrap().memory_stats.average_delta,
            Some(4096.0)
        );
        assert_eq!(tracker.get_stats("mem.cached").unwrap().memory_stats.average_delta, None);
    }

    #[test]
    fn test_acknowledge_alert() {
        let (tracker, mock) = mocked();
        tracker
            .set_threshold(Threshold::new("slow.*").max_duration_ms(50.0))
            .unwrap();
        let log = event_log(&tracker);
        tracker
            .track("slow.job", TrackOptions::new(), || {
                mock.increment(Duration::from_millis(75));
                Ok::<_, String>(())
            })
            .unwrap()
            .unwrap();

        let id = tracker.recent_alerts(1)[0].id;
        assert_eq!(tracker.active_alerts().len(), 1);
        assert!(tracker.acknowledge_alert(id));
        assert!(tracker.active_alerts().is_empty());
        assert!(tracker.acknowledge_alert(id));
        assert!(tracker.alert(id).unwrap().acknowledged);
        assert!(!tracker.acknowledge_alert(AlertId::new()));

        assert_eq!(
            *log.lock(),
            vec![
                EventKind::Metric,
                EventKind::Alert,
                EventKind::AlertAcknowledged,
                EventKind::AlertAcknowledged,
            ]
        );
    }

    #[test]
    fn test_manual_tracking() {
        let (tracker, mock) = mocked();
        let id = tracker
            .start_tracking_with("manual.upload", TrackOptions::new().tag("batch"))
            .unwrap();
        assert!(tracker.is_tracking(id));
        mock.increment(Duration::from_millis(30));

        let measurement = tracker
            .end_tracking(id, false, Some(ErrorInfo::new("disk full").with_kind("io")))
            .unwrap();
        assert_eq!(measurement.duration_ms, 30.0);
        assert!(measurement.has_tag("batch"));
        assert_eq!(measurement.error.as_ref().unwrap().to_string(), "io: disk full");
        assert!(!tracker.is_tracking(id));

        let failed_quietly = tracker.start_tracking("manual.quiet").unwrap();
        let measurement = tracker.end_tracking(failed_quietly, false, None).unwrap();
        assert_eq!(measurement.error, Some(ErrorInfo::unspecified()));
    }

    #[test]
    fn test_double_end_tracking_is_harmless() {
        let tracker = tracker();
        let id = tracker.start_tracking("manual.op").unwrap();
        assert!(tracker.end_tracking(id, true, None).is_some());
        let before = tracker.get_stats("manual.op").unwrap();

        assert!(tracker.end_tracking(id, true, None).is_none());
        assert!(tracker.end_tracking(TrackingId::new(), false, None).is_none());
        assert_eq!(tracker.get_stats("manual.op").unwrap(), before);
    }

    #[test]
    fn test_export_formats() {
        let tracker = tracker();
        ok(&tracker, "api.getUserData");
        fail(&tracker, "api.getUserData");

        let json: serde_json::Value =
            serde_json::from_str(&tracker.export_metrics(ExportFormat::Json).unwrap()).unwrap();
        for key in ["metrics", "stats", "alerts", "timestamp"] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["metrics"].as_array().unwrap().len(), 2);

        let text = tracker.export_metrics(ExportFormat::Prometheus).unwrap();
        assert!(text.contains("# HELP"));
        assert!(text.contains("# TYPE"));
        assert!(text.contains("operation_duration_seconds"));
    }

    #[test]
    fn test_cleanup_never_increases_totals() {
        let tracker = tracker();
        assert!(tracker.cleanup().is_empty());

        for i in 0..100 {
            ok(&tracker, if i % 2 == 0 { "even" } else { "odd" });
        }
        let before = tracker.get_dashboard_data().overview.total_operations;
        tracker.cleanup();
        let after = tracker.get_dashboard_data().overview.total_operations;
        assert_eq!(before, 100);
        assert!(after <= before);
    }

    #[test]
    fn test_reconfigure_shrinks_windows_on_cleanup() {
        let tracker = tracker();
        for _ in 0..40 {
            ok(&tracker, "busy");
        }

        let mut config = (*tracker.config()).clone();
        config.retention.max_measurements_per_operation = 10;
        tracker.reconfigure(config).unwrap();
        assert_eq!(tracker.get_stats("busy").unwrap().count, 40);

        let report = tracker.cleanup();
        assert_eq!(report.measurements_pruned, 30);
        let stats = tracker.get_stats("busy").unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!(stats.lifetime_count, 40);
    }

    #[test]
    fn test_stale_trackings_are_reclaimed() {
        let (tracker, mock) = mocked();
        let abandoned = tracker.start_tracking("never.ends").unwrap();
        mock.increment(Duration::from_secs(60));
        let fresh = tracker.start_tracking("still.running").unwrap();
        mock.increment(crate::DEFAULT_STALE_AFTER);

        let report = tracker.cleanup();
        assert_eq!(report.stale_trackings_evicted, 1);
        assert!(!tracker.is_tracking(abandoned));
        assert!(tracker.is_tracking(fresh));
        assert!(tracker.end_tracking(abandoned, true, None).is_none());
        assert!(tracker.get_stats("never.ends").is_none());
    }

    #[test]
    fn test_failing_custom_metric_keeps_stats() {
        let tracker = tracker();
        let options = TrackOptions::new()
            .custom_metric("rows", || Ok(12.0))
            .custom_metric("broken", || Err("no connection".into()))
            .custom_metric("explodes", || panic!("metric panicked"));
        tracker
            .track("report.build", options, || Ok::<_, String>(()))
            .unwrap()
            .unwrap();

        let stats = tracker.get_stats("report.build").unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.custom_metrics.contains_key("rows"));
        assert!(!stats.custom_metrics.contains_key("broken"));
        assert!(!stats.custom_metrics.contains_key("explodes"));
    }

    #[test]
    fn test_panic_is_recorded_then_resumed() {
        let tracker = tracker();
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = tracker.track("panicky", TrackOptions::new(), || -> Result<(), String> {
                panic!("kaboom")
            });
        }));

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));
        let stats = tracker.get_stats("panicky").unwrap();
        assert_eq!(stats.error_count, 1);
        let recent = tracker.store.recent(1);
        assert_eq!(recent[0].error.as_ref().unwrap().kind.as_deref(), Some("panic"));
    }

    #[rstest]
    #[case("", TrackOptions::new())]
    #[case("   ", TrackOptions::new())]
    #[case(&"x".repeat(MAX_OPERATION_NAME_LENGTH + 1), TrackOptions::new())]
    #[case("valid", TrackOptions::new().sample_rate(1.5))]
    #[case("valid", TrackOptions::new().sample_rate(f64::NAN))]
    #[case("valid", TrackOptions::new().tags((0..33).map(|i| i.to_string())))]
    fn test_contract_violations_skip_work(#[case] operation: &str, #[case] options: TrackOptions) {
        let tracker = tracker();
        let ran = AtomicUsize::new(0);
        let result = tracker.track(operation, options, || {
            ran.fetch_add(1, AtomicOrdering::SeqCst);
            Ok::<_, String>(())
        });

        assert!(matches!(
            result,
            Err(TrackerError::InvalidOperation { .. }) | Err(TrackerError::InvalidOptions { .. })
        ));
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(tracker.active_tracking_count(), 0);
    }

    #[test]
    fn test_dashboard_reflects_alerts_and_errors() {
        let (tracker, mock) = mocked();
        tracker
            .set_threshold(
                Threshold::new("*")
                    .max_duration_ms(1.0)
                    .severity(AlertSeverity::Error),
            )
            .unwrap();
        for _ in 0..3 {
            tracker
                .track("slow", TrackOptions::new(), || {
                    mock.increment(Duration::from_millis(5));
                    Ok::<_, String>(())
                })
                .unwrap()
                .unwrap();
        }

        let data = tracker.get_dashboard_data();
        assert_eq!(data.overview.total_operations, 3);
        assert_eq!(data.overview.active_alerts, 3);
        assert_eq!(data.recent_alerts.len(), 3);
        assert_eq!(data.system_health, SystemHealth::Critical);
        assert_eq!(data.top_operations[0].operation, "slow");
    }

    #[test]
    fn test_dispose() {
        let tracker = tracker();
        ok(&tracker, "before");
        let open = tracker.start_tracking("open").unwrap();
        let mut receiver = tracker.subscribe();

        tracker.dispose();
        tracker.dispose();

        let ran = AtomicUsize::new(0);
        let result = tracker.track("after", TrackOptions::new(), || {
            ran.fetch_add(1, AtomicOrdering::SeqCst);
            Ok::<_, String>(())
        });
        assert!(matches!(result, Err(TrackerError::Disposed)));
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
        assert!(matches!(tracker.start_tracking("x"), Err(TrackerError::Disposed)));
        assert!(matches!(
            tracker.set_threshold(Threshold::new("*").max_duration_ms(1.0)),
            Err(TrackerError::Disposed)
        ));
        assert!(tracker.on(EventKind::Metric, |_| {}).is_err());

        assert!(tracker.end_tracking(open, true, None).is_none());
        assert!(tracker.get_stats("before").is_none());
        assert_eq!(tracker.get_dashboard_data().overview.total_operations, 0);
        assert!(tracker.all_stats().is_empty());
        assert!(tracker.thresholds().is_empty());
        assert!(tracker.recent_alerts(10).is_empty());
        assert!(tracker.active_alerts().is_empty());
        assert!(tracker.export_metrics(ExportFormat::Json).is_ok());
        assert!(tracker.cleanup().is_empty());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_dispose_during_work_records_nothing() {
        let tracker = tracker();
        let outcome = tracker
            .track("in.flight", TrackOptions::new(), || {
                tracker.dispose();
                Ok::<_, String>("finished")
            })
            .unwrap();

        assert_eq!(outcome, Ok("finished"));
        assert!(tracker.get_stats("in.flight").is_none());
    }

    #[test]
    fn test_dispose_between_measure_and_record_stores_nothing() {
        let tracker = Arc::new(tracker());
        let slot: Arc<once_cell::sync::OnceCell<Arc<PerformanceTracker>>> = Arc::default();
        slot.set(tracker.clone()).unwrap();

        let handle = slot.clone();
        let options = TrackOptions::new().custom_metric("disposes", move || {
            if let Some(tracker) = handle.get() {
                tracker.dispose();
            }
            Ok(1.0)
        });
        let outcome = tracker
            .track("late.record", options, || Ok::<_, String>(5))
            .unwrap();

        assert_eq!(outcome, Ok(5));
        assert!(tracker.is_disposed());
        assert!(tracker.get_stats("late.record").is_none());
        assert!(tracker.all_stats().is_empty());
        assert_eq!(tracker.tracker_stats().store.retained_measurements, 0);
    }

    #[test]
    fn test_config_thresholds_are_preloaded() {
        let config = TrackerConfig {
            thresholds: vec![Threshold::new("db.*").max_duration_ms(250.0)],
            ..TrackerConfig::default()
        };
        let tracker = PerformanceTracker::new(config).unwrap();
        assert_eq!(tracker.thresholds().len(), 1);
        assert!(tracker.remove_threshold("db.*"));
        assert!(tracker.thresholds().is_empty());
    }

    #[tokio::test]
    async fn test_track_async() {
        let tracker = tracker();
        let value = tracker
            .track_async("async.fetch", TrackOptions::new(), async {
                tokio::task::yield_now().await;
                Ok::<_, String>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, Ok(7));

        let failed = tracker
            .track_async("async.fetch", TrackOptions::new(), async { Err::<u8, _>("timeout") })
            .await
            .unwrap();
        assert_eq!(failed, Err("timeout"));

        let stats = tracker.get_stats("async.fetch").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.error_count, 1);
    }

    #[tokio::test]
    async fn test_async_panic_is_recorded_then_resumed() {
        let tracker = tracker();
        let caught = AssertUnwindSafe(tracker.track_async("async.panicky", TrackOptions::new(), async {
            tokio::task::yield_now().await;
            if true {
                panic!("async kaboom");
            }
            Ok::<(), String>(())
        }))
        .catch_unwind()
        .await;

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"async kaboom"));
        assert_eq!(tracker.active_tracking_count(), 0);
        let stats = tracker.get_stats("async.panicky").unwrap();
        assert_eq!(stats.error_count, 1);
        let recent = tracker.store.recent(1);
        assert_eq!(recent[0].error.as_ref().unwrap().kind.as_deref(), Some("panic"));
    }

    #[test]
    fn test_abandoned_async_work_is_reclaimed() {
        let (tracker, mock) = mocked();
        let polled_once = tracker
            .track_async(
                "never.settles",
                TrackOptions::new(),
                futures::future::pending::<Result<(), String>>(),
            )
            .now_or_never();
        assert!(polled_once.is_none());

        // The future is gone but its context is still in flight.
        assert_eq!(tracker.active_tracking_count(), 1);
        mock.increment(Duration::from_secs(30));
        assert_eq!(tracker.tracker_stats().oldest_tracking_age, Some(Duration::from_secs(30)));
        assert_eq!(tracker.cleanup().stale_trackings_evicted, 0);

        mock.increment(crate::DEFAULT_STALE_AFTER);
        assert_eq!(tracker.cleanup().stale_trackings_evicted, 1);
        assert_eq!(tracker.active_tracking_count(), 0);
        assert_eq!(tracker.tracker_stats().oldest_tracking_age, None);
        assert!(tracker.get_stats("never.settles").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tracking() {
        let tracker = Arc::new(tracker());
        let handles: Vec<_> = (0..500)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let operation = if i % 2 == 0 { "concurrent.even" } else { "concurrent.odd" };
                    tracker
                        .track_async(operation, TrackOptions::new(), async move {
                            tokio::task::yield_now().await;
                            if i % 10 == 0 {
                                Err(format!("request {i} failed"))
                            } else {
                                Ok(i)
                            }
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let outcomes = futures::future::join_all(handles).await;
        assert!(outcomes.iter().all(|o| o.is_ok()));

        let even = tracker.get_stats("concurrent.even").unwrap();
        let odd = tracker.get_stats("concurrent.odd").unwrap();
        assert_eq!(even.count + odd.count, 500);
        assert_eq!(even.error_count, 50);
        assert_eq!(odd.error_count, 0);
        assert_eq!(tracker.active_tracking_count(), 0);
        assert_eq!(tracker.get_dashboard_data().overview.total_operations, 500);
    }

    #[tokio::test]
    async fn test_subscribers_see_metric_events() {
        let tracker = tracker();
        let mut receiver = tracker.subscribe();
        ok(&tracker, "broadcast.me");

        match receiver.recv().await.unwrap() {
            TrackerEvent::Metric(m) => assert_eq!(m.operation, "broadcast.me"),
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
