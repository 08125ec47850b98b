//! Threshold registration, evaluation and the bounded alert history.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use compact_str::CompactString;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::{ConfigError, TrackerError, TrackerResult};
use crate::measurement::Measurement;
use crate::pattern::OperationPattern;
use crate::time::Timestamp;

// ----------------------------------------------------------------------------
// Severity
// ----------------------------------------------------------------------------

/// Severity attached to a threshold and to every alert it raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AlertSeverity {
    /// Informational - never affects system health
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl AlertSeverity {
    pub const ALL: [AlertSeverity; 3] = [AlertSeverity::Info, AlertSeverity::Warning, AlertSeverity::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
        }
    }
}

impl Default for AlertSeverity {
    fn default() -> Self {
        AlertSeverity::Warning
    }
}

impl Display for AlertSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(AlertSeverity::Info),
            "warning" | "warn" => Ok(AlertSeverity::Warning),
            "error" => Ok(AlertSeverity::Error),
            other => Err(ConfigError::invalid_value(
                "severity",
                format!("expected info, warning or error (got '{other}')"),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Threshold
// ----------------------------------------------------------------------------

/// A rule pairing an operation-name pattern with limits and a severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// Glob pattern; `*` matches any substring
    pub operation_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_delta_bytes: Option<i64>,
    #[serde(default)]
    pub severity: AlertSeverity,
}

impl Threshold {
    pub fn new(operation_pattern: impl Into<String>) -> Self {
        Self {
            operation_pattern: operation_pattern.into(),
            max_duration_ms: None,
            max_memory_delta_bytes: None,
            severity: AlertSeverity::default(),
        }
    }

    pub fn max_duration_ms(mut self, limit: f64) -> Self {
        self.max_duration_ms = Some(limit);
        self
    }

    pub fn max_memory_delta_bytes(mut self, limit: i64) -> Self {
        self.max_memory_delta_bytes = Some(limit);
        self
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Reject thresholds with no limits, a blank pattern or invalid limit values.
    pub fn validate(&self) -> TrackerResult<()> {
        let pattern = &self.operation_pattern;
        if pattern.is_empty() {
            return Err(TrackerError::invalid_threshold(pattern, "pattern must not be empty"));
        }
        if self.max_duration_ms.is_none() && self.max_memory_delta_bytes.is_none() {
            return Err(TrackerError::invalid_threshold(
                pattern,
                "at least one of max_duration_ms or max_memory_delta_bytes must be set",
            ));
        }
        if let Some(limit) = self.max_duration_ms {
            if !limit.is_finite() || limit < 0.0 {
                return Err(TrackerError::invalid_threshold(
                    pattern,
                    format!("max_duration_ms must be a finite, non-negative number (got {limit})"),
                ));
            }
        }
        if let Some(limit) = self.max_memory_delta_bytes {
            if limit < 0 {
                return Err(TrackerError::invalid_threshold(
                    pattern,
                    format!("max_memory_delta_bytes must be non-negative (got {limit})"),
                ));
            }
        }
        Ok(())
    }

    /// Limits exceeded by `measurement`, ignoring the pattern.
    ///
    /// Exceeding is strict: a duration equal to the limit does not violate it.
    /// A memory limit is only checked when the Measurement captured memory.
    pub fn violations(&self, measurement: &Measurement) -> SmallVec<[Violation; 2]> {
        let mut violations = SmallVec::new();
        if let Some(limit_ms) = self.max_duration_ms {
            if measurement.duration_ms > limit_ms {
                violations.push(Violation::Duration {
                    actual_ms: measurement.duration_ms,
                    limit_ms,
                });
            }
        }
        if let (Some(limit_bytes), Some(actual_bytes)) =
            (self.max_memory_delta_bytes, measurement.memory_delta_bytes)
        {
            if actual_bytes > limit_bytes {
                violations.push(Violation::Memory {
                    actual_bytes,
                    limit_bytes,
                });
            }
        }
        violations
    }
}

/// One exceeded limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Duration { actual_ms: f64, limit_ms: f64 },
    Memory { actual_bytes: i64, limit_bytes: i64 },
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Duration { actual_ms, limit_ms } => {
                write!(f, "duration {actual_ms:.2}ms exceeds {limit_ms}ms")
            }
            Violation::Memory {
                actual_bytes,
                limit_bytes,
            } => write!(f, "memory delta {actual_bytes}B exceeds {limit_bytes}B"),
        }
    }
}

/// A threshold with its pattern compiled once at registration.
#[derive(Debug)]
struct CompiledThreshold {
    threshold: Threshold,
    pattern: OperationPattern,
}

impl CompiledThreshold {
    fn new(threshold: Threshold) -> Self {
        let pattern = OperationPattern::new(threshold.operation_pattern.as_str());
        Self { threshold, pattern }
    }
}

// ----------------------------------------------------------------------------
// Alert
// ----------------------------------------------------------------------------

/// Unique alert identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AlertId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AlertId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A record of one threshold violated by one Measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub operation: CompactString,
    pub threshold: Threshold,
    pub violations: Vec<Violation>,
    /// The Measurement that triggered the alert
    pub measurement: Arc<Measurement>,
    pub severity: AlertSeverity,
    pub created_at: Timestamp,
    pub acknowledged: bool,
    pub acknowledged_at: Option<Timestamp>,
}

impl Alert {
    fn new(threshold: &Threshold, violations: Vec<Violation>, measurement: Arc<Measurement>) -> Self {
        Self {
            id: AlertId::new(),
            operation: measurement.operation.clone(),
            threshold: threshold.clone(),
            violations,
            measurement,
            severity: threshold.severity,
            created_at: Timestamp::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    /// Human-readable summary.
    pub fn message(&self) -> String {
        let details: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        format!(
            "{} violated threshold '{}': {}",
            self.operation,
            self.threshold.operation_pattern,
            details.join(", ")
        )
    }

    pub fn is_active(&self) -> bool {
        !self.acknowledged
    }
}

/// Unacknowledged alert counts per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAlertCounts {
    pub info: usize,
    pub warning: usize,
    pub error: usize,
}

impl ActiveAlertCounts {
    pub fn total(&self) -> usize {
        self.info + self.warning + self.error
    }
}

// ----------------------------------------------------------------------------
// Alert Engine
// ----------------------------------------------------------------------------

/// Holds registered thresholds and the bounded alert history.
///
/// Thresholds are read on every recorded Measurement and written rarely, so
/// the list is swapped atomically rather than locked.
pub struct AlertEngine {
    thresholds: ArcSwap<Vec<Arc<CompiledThreshold>>>,
    /// Oldest first
    alerts: RwLock<VecDeque<Alert>>,
    total_raised: AtomicU64,
    total_evicted: AtomicU64,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self {
            thresholds: ArcSwap::from_pointee(Vec::new()),
            alerts: RwLock::new(VecDeque::new()),
            total_raised: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    /// Register a threshold, replacing any with an identical pattern.
    pub fn set_threshold(&self, threshold: Threshold) -> TrackerResult<()> {
        threshold.validate()?;
        let compiled = Arc::new(CompiledThreshold::new(threshold));

        self.thresholds.rcu(|current| {
            let mut next: Vec<Arc<CompiledThreshold>> = current.iter().cloned().collect();
            match next
                .iter()
                .position(|t| t.threshold.operation_pattern == compiled.threshold.operation_pattern)
            {
                Some(idx) => next[idx] = compiled.clone(),
                None => next.push(compiled.clone()),
            }
            next
        });
        Ok(())
    }

    /// Remove the threshold registered under `pattern`.
    pub fn remove_threshold(&self, pattern: &str) -> bool {
        let mut removed = false;
        self.thresholds.rcu(|current| {
            let next: Vec<Arc<CompiledThreshold>> = current
                .iter()
                .filter(|t| t.threshold.operation_pattern != pattern)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Registered thresholds in registration order.
    pub fn thresholds(&self) -> Vec<Threshold> {
        self.thresholds
            .load()
            .iter()
            .map(|t| t.threshold.clone())
            .collect()
    }

    pub fn clear_thresholds(&self) {
        self.thresholds.store(Arc::new(Vec::new()));
    }

    /// Evaluate a recorded Measurement against every matching threshold.
    ///
    /// Each violated threshold raises its own alert. New alerts are appended to
    /// the history, evicting the oldest beyond `max_alerts`, and returned in
    /// threshold registration order.
    pub fn evaluate(&self, measurement: &Arc<Measurement>, max_alerts: usize) -> Vec<Alert> {
        let thresholds = self.thresholds.load();
        let raised: Vec<Alert> = thresholds
            .iter()
            .filter(|t| t.pattern.matches(&measurement.operation))
            .filter_map(|t| {
                let violations = t.threshold.violations(measurement);
                (!violations.is_empty())
                    .then(|| Alert::new(&t.threshold, violations.into_vec(), measurement.clone()))
            })
            .collect();

        if !raised.is_empty() {
            let mut alerts = self.alerts.write();
            alerts.extend(raised.iter().cloned());
            let evicted = Self::truncate(&mut alerts, max_alerts);
            drop(alerts);

            self.total_raised.fetch_add(raised.len() as u64, AtomicOrdering::Relaxed);
            if evicted > 0 {
                self.total_evicted.fetch_add(evicted as u64, AtomicOrdering::Relaxed);
            }
        }
        raised
    }

    fn truncate(alerts: &mut VecDeque<Alert>, max_alerts: usize) -> usize {
        let excess = alerts.len().saturating_sub(max_alerts.max(1));
        alerts.drain(..excess);
        excess
    }

    /// Mark an alert acknowledged. Re-acknowledging keeps the first timestamp.
    ///
    /// Returns the updated alert, or `None` if the id is unknown or evicted.
    pub fn acknowledge(&self, id: AlertId) -> Option<Alert> {
        let mut alerts = self.alerts.write();
        let alert = alerts.iter_mut().find(|a| a.id == id)?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_at = Some(Timestamp::now());
        }
        Some(alert.clone())
    }

    pub fn get(&self, id: AlertId) -> Option<Alert> {
        self.alerts.read().iter().find(|a| a.id == id).cloned()
    }

    /// Up to `limit` alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.alerts.read().iter().rev().take(limit).cloned().collect()
    }

    /// Unacknowledged alerts, newest first.
    pub fn active(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .rev()
            .filter(|a| a.is_active())
            .cloned()
            .collect()
    }

    pub fn active_counts(&self) -> ActiveAlertCounts {
        let mut counts = ActiveAlertCounts::default();
        for alert in self.alerts.read().iter().filter(|a| a.is_active()) {
            match alert.severity {
                AlertSeverity::Info => counts.info += 1,
                AlertSeverity::Warning => counts.warning += 1,
                AlertSeverity::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Full retained history, oldest first.
    pub fn all(&self) -> Vec<Alert> {
        self.alerts.read().iter().cloned().collect()
    }

    /// Enforce `max_alerts` on the history. Returns how many were dropped.
    pub fn prune(&self, max_alerts: usize) -> usize {
        let evicted = Self::truncate(&mut self.alerts.write(), max_alerts);
        if evicted > 0 {
            self.total_evicted.fetch_add(evicted as u64, AtomicOrdering::Relaxed);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    pub fn total_raised(&self) -> u64 {
        self.total_raised.load(AtomicOrdering::Relaxed)
    }

    /// Alerts dropped from the history by the size bound
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted.load(AtomicOrdering::Relaxed)
    }

    pub fn clear(&self) {
        self.alerts.write().clear();
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::measurement::Tags;

    fn measurement(operation: &str, duration_ms: f64, memory: Option<i64>) -> Arc<Measurement> {
        Arc::new(Measurement {
            operation: operation.into(),
            start_time: Timestamp::EPOCH,
            end_time: Timestamp::EPOCH,
            duration_ms,
            success: true,
            error: None,
            memory_delta_bytes: memory,
            cpu_delta_ms: None,
            custom_metrics: BTreeMap::new(),
            tags: Tags::new(),
            sampled: true,
        })
    }

    #[rstest]
    #[case(Threshold::new(""), false)]
    #[case(Threshold::new("api.*"), false)]
    #[case(Threshold::new("api.*").max_duration_ms(-1.0), false)]
    #[case(Threshold::new("api.*").max_duration_ms(f64::NAN), false)]
    #[case(Threshold::new("api.*").max_memory_delta_bytes(-5), false)]
    #[case(Threshold::new("api.*").max_duration_ms(50.0), true)]
    #[case(Threshold::new("*").max_memory_delta_bytes(0), true)]
    fn test_threshold_validation(#[case] threshold: Threshold, #[case] valid: bool) {
        assert_eq!(threshold.validate().is_ok(), valid);
    }

    #[test]
    fn test_slow_operation_fires_once() {
        let engine = AlertEngine::new();
        engine
            .set_threshold(Threshold::new("slow.*").max_duration_ms(50.0).severity(AlertSeverity::Error))
            .unwrap();

        let raised = engine.evaluate(&measurement("slow.report", 100.0, None), 100);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::Error);
        assert_eq!(
            raised[0].violations,
            vec![Violation::Duration {
                actual_ms: 100.0,
                limit_ms: 50.0
            }]
        );

        assert!(engine.evaluate(&measurement("slow.report", 10.0, None), 100).is_empty());
        assert!(engine.evaluate(&measurement("fast.report", 500.0, None), 100).is_empty());
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_memory_limit_requires_capture() {
        let engine = AlertEngine::new();
        engine
            .set_threshold(Threshold::new("*").max_memory_delta_bytes(1024))
            .unwrap();

        assert!(engine.evaluate(&measurement("job", 1.0, None), 100).is_empty());
        assert!(engine.evaluate(&measurement("job", 1.0, Some(1024)), 100).is_empty());
        assert_eq!(engine.evaluate(&measurement("job", 1.0, Some(4096)), 100).len(), 1);
    }

    #[test]
    fn test_identical_pattern_replaces() {
        let engine = AlertEngine::new();
        engine.set_threshold(Threshold::new("api.*").max_duration_ms(10.0)).unwrap();
        engine.set_threshold(Threshold::new("*").max_duration_ms(10.0)).unwrap();
        engine.set_threshold(Threshold::new("api.*").max_duration_ms(500.0)).unwrap();

        let thresholds = engine.thresholds();
        assert_eq!(thresholds.len(), 2);
        assert_eq!(thresholds[0].max_duration_ms, Some(500.0));

        // Both thresholds match; only the catch-all is exceeded.
        let raised = engine.evaluate(&measurement("api.get", 100.0, None), 100);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].threshold.operation_pattern, "*");

        assert!(engine.remove_threshold("api.*"));
        assert!(!engine.remove_threshold("api.*"));
        assert_eq!(engine.thresholds().len(), 1);
    }

    #[test]
    fn test_multiple_thresholds_each_raise() {
        let engine = AlertEngine::new();
        engine.set_threshold(Threshold::new("db.*").max_duration_ms(10.0)).unwrap();
        engine
            .set_threshold(Threshold::new("*.query").max_duration_ms(20.0).severity(AlertSeverity::Error))
            .unwrap();

        let raised = engine.evaluate(&measurement("db.query", 50.0, None), 100);
        assert_eq!(raised.len(), 2);
        assert_ne!(raised[0].id, raised[1].id);
    }

    #[test]
    fn test_acknowledge() {
        let engine = AlertEngine::new();
        engine.set_threshold(Threshold::new("*").max_duration_ms(1.0)).unwrap();
        let alert = engine.evaluate(&measurement("op", 5.0, None), 100).remove(0);

        assert_eq!(engine.active().len(), 1);
        let first = engine.acknowledge(alert.id).unwrap();
        assert!(first.acknowledged);
        assert!(engine.active().is_empty());
        assert_eq!(engine.recent(10).len(), 1);

        // Idempotent, keeps the original timestamp
        let second = engine.acknowledge(alert.id).unwrap();
        assert_eq!(second.acknowledged_at, first.acknowledged_at);

        assert!(engine.acknowledge(AlertId::new()).is_none());
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let engine = AlertEngine::new();
        engine.set_threshold(Threshold::new("*").max_duration_ms(0.0)).unwrap();
        for i in 0..5 {
            engine.evaluate(&measurement(&format!("op{i}"), 1.0, None), 3);
        }

        let recent: Vec<String> = engine.recent(10).iter().map(|a| a.operation.to_string()).collect();
        assert_eq!(recent, vec!["op4", "op3", "op2"]);
        assert_eq!(engine.total_raised(), 5);

        assert_eq!(engine.total_evicted(), 2);

        assert_eq!(engine.prune(1), 2);
        assert_eq!(engine.all()[0].operation, "op4");
        assert_eq!(engine.total_evicted(), 4);
    }

    #[test]
    fn test_eviction_ignores_acknowledgment() {
        let engine = AlertEngine::new();
        engine.set_threshold(Threshold::new("*").max_duration_ms(0.0)).unwrap();
        let first = engine.evaluate(&measurement("op0", 1.0, None), 3).remove(0);
        let second = engine.evaluate(&measurement("op1", 1.0, None), 3).remove(0);
        engine.evaluate(&measurement("op2", 1.0, None), 3);
        engine.acknowledge(second.id).unwrap();

        // The oldest alert goes first even though it is still active.
        engine.evaluate(&measurement("op3", 1.0, None), 3);
        assert!(engine.get(first.id).is_none());
        assert!(engine.get(second.id).unwrap().acknowledged);

        // Then the acknowledged one, in arrival order.
        engine.evaluate(&measurement("op4", 1.0, None), 3);
        assert!(engine.get(second.id).is_none());
        let retained: Vec<String> = engine.all().iter().map(|a| a.operation.to_string()).collect();
        assert_eq!(retained, vec!["op2", "op3", "op4"]);
        assert!(engine.acknowledge(second.id).is_none());
    }

    #[test]
    fn test_active_counts_skip_acknowledged() {
        let engine = AlertEngine::new();
        engine.set_threshold(Threshold::new("w.*").max_duration_ms(0.0)).unwrap();
        engine
            .set_threshold(Threshold::new("e.*").max_duration_ms(0.0).severity(AlertSeverity::Error))
            .unwrap();

        engine.evaluate(&measurement("w.a", 1.0, None), 100);
        let error = engine.evaluate(&measurement("e.a", 1.0, None), 100).remove(0);
        engine.evaluate(&measurement("e.b", 1.0, None), 100);
        engine.acknowledge(error.id);

        assert_eq!(
            engine.active_counts(),
            ActiveAlertCounts {
                info: 0,
                warning: 1,
                error: 1
            }
        );
    }

    #[test]
    fn test_severity_parsing() {
        assert_eq!("WARNING".parse::<AlertSeverity>().unwrap(), AlertSeverity::Warning);
        assert!("fatal".parse::<AlertSeverity>().is_err());
        assert!(AlertSeverity::Error > AlertSeverity::Info);
    }
}
