//! Measurements and the per-invocation options that shape them.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

use crate::time::Timestamp;

/// Tags attached to a measurement. Most invocations carry only a few.
pub type Tags = SmallVec<[CompactString; 4]>;

/// Boxed error returned by custom metric functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A zero-argument callable producing a numeric metric after the operation completes.
pub type CustomMetricFn = Arc<dyn Fn() -> Result<f64, BoxError> + Send + Sync>;

// ----------------------------------------------------------------------------
// Error Info
// ----------------------------------------------------------------------------

/// Description of why a tracked operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable message
    pub message: String,
    /// Error type or failure class (e.g. the Rust type name, or `panic`)
    pub kind: Option<CompactString>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<CompactString>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Capture an operation's error without consuming it.
    pub fn from_error<E: Display>(error: &E) -> Self {
        Self::new(error.to_string()).with_kind(std::any::type_name::<E>())
    }

    /// Capture a panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "operation panicked".to_string()
        };
        Self::new(message).with_kind("panic")
    }

    /// Used when a manual tracking ends in failure without details.
    pub fn unspecified() -> Self {
        Self::new("operation reported failure")
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

// ----------------------------------------------------------------------------
// Measurement
// ----------------------------------------------------------------------------

/// One completed, recorded observation of an operation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Aggregation key and alert-match subject
    pub operation: CompactString,
    pub start_time: Timestamp,
    /// Always `start_time + duration`
    pub end_time: Timestamp,
    /// Monotonic duration in fractional milliseconds, never negative
    pub duration_ms: f64,
    pub success: bool,
    /// Present iff `success` is false
    pub error: Option<ErrorInfo>,
    pub memory_delta_bytes: Option<i64>,
    pub cpu_delta_ms: Option<f64>,
    pub custom_metrics: BTreeMap<CompactString, f64>,
    pub tags: Tags,
    pub sampled: bool,
}

impl Measurement {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == tag)
    }
}

// ----------------------------------------------------------------------------
// Track Options
// ----------------------------------------------------------------------------

/// Per-invocation options for the wrapper and manual tracking.
#[derive(Clone, Default)]
pub struct TrackOptions {
    /// Probability of recording this invocation; `None` uses the configured default
    pub sample_rate: Option<f64>,
    pub include_memory_usage: bool,
    pub include_cpu_usage: bool,
    pub tags: Tags,
    pub custom_metrics: Vec<(CompactString, CustomMetricFn)>,
}

impl TrackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn include_memory_usage(mut self, enabled: bool) -> Self {
        self.include_memory_usage = enabled;
        self
    }

    pub fn include_cpu_usage(mut self, enabled: bool) -> Self {
        self.include_cpu_usage = enabled;
        self
    }

    /// Add a tag. Tags form a set, so repeats are ignored.
    pub fn tag(mut self, tag: impl Into<CompactString>) -> Self {
        self.insert_tag(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        for tag in tags {
            self.insert_tag(tag.into());
        }
        self
    }

    fn insert_tag(&mut self, tag: CompactString) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn custom_metric<F>(mut self, name: impl Into<CompactString>, metric: F) -> Self
    where
        F: Fn() -> Result<f64, BoxError> + Send + Sync + 'static,
    {
        self.custom_metrics.push((name.into(), Arc::new(metric)));
        self
    }

    /// Evaluate every custom metric in its own failure boundary.
    ///
    /// Errors, panics and non-finite values drop that one metric only.
    pub fn evaluate_custom_metrics(&self, operation: &str) -> BTreeMap<CompactString, f64> {
        let mut values = BTreeMap::new();
        for (name, metric) in &self.custom_metrics {
            match panic::catch_unwind(AssertUnwindSafe(|| metric())) {
                Ok(Ok(value)) if value.is_finite() => {
                    values.insert(name.clone(), value);
                }
                Ok(Ok(value)) => {
                    warn!(
                        target: "perftrack::metrics",
                        operation,
                        metric = %name,
                        value,
                        "Custom metric produced a non-finite value, ignoring"
                    );
                }
                Ok(Err(error)) => {
                    warn!(
                        target: "perftrack::metrics",
                        operation,
                        metric = %name,
                        error = %error,
                        "Custom metric failed, ignoring"
                    );
                }
                Err(payload) => {
                    warn!(
                        target: "perftrack::metrics",
                        operation,
                        metric = %name,
                        panic = %ErrorInfo::from_panic(&*payload).message,
                        "Custom metric panicked, ignoring"
                    );
                }
            }
        }
        values
    }
}

impl Debug for TrackOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.custom_metrics.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("TrackOptions")
            .field("sample_rate", &self.sample_rate)
            .field("include_memory_usage", &self.include_memory_usage)
            .field("include_cpu_usage", &self.include_cpu_usage)
            .field("tags", &self.tags)
            .field("custom_metrics", &names)
            .finish()
    }
}
