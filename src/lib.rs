//! # perftrack - In-Process Performance Tracking
//!
//! Wraps units of work (sync or async), records how long they took and
//! whether they failed, keeps a bounded window of Measurements per operation,
//! evaluates duration and memory thresholds, and publishes metric and alert
//! events to listeners.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           PERFORMANCE TRACKER                            │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  track / start+end → ACTIVE TABLE → MEASUREMENT → STORE → ALERT ENGINE   │
//! │                                                  │            │          │
//! │                               STATS / DASHBOARD / EXPORT   EVENT BUS     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use perftrack::{PerformanceTracker, Threshold, TrackOptions, TrackerConfig};
//!
//! let tracker = PerformanceTracker::new(TrackerConfig::default()).unwrap();
//! tracker
//!     .set_threshold(Threshold::new("api.*").max_duration_ms(500.0))
//!     .unwrap();
//!
//! let user = tracker
//!     .track("api.getUserData", TrackOptions::new().tag("v2"), || {
//!         Ok::<_, std::io::Error>("alice")
//!     })
//!     .unwrap();
//! assert_eq!(user.unwrap(), "alice");
//!
//! let stats = tracker.get_stats("api.getUserData").unwrap();
//! assert_eq!(stats.count, 1);
//! ```

use std::time::Duration;

pub mod alerts;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod export;
pub mod logging;
pub mod measurement;
pub mod pattern;
pub mod resources;
pub mod sampling;
pub mod stats;
pub mod store;
pub mod time;
pub mod tracker;
pub mod tracking;

pub use alerts::{ActiveAlertCounts, Alert, AlertId, AlertSeverity, Threshold, Violation};
pub use config::TrackerConfig;
pub use dashboard::{DashboardData, OperationSummary, Overview, SystemHealth};
pub use error::{ConfigError, ExportError, TrackerError, TrackerResult};
pub use events::{EventKind, ListenerId, TrackerEvent};
pub use export::ExportFormat;
pub use logging::init_logging;
pub use measurement::{ErrorInfo, Measurement, TrackOptions};
pub use pattern::OperationPattern;
pub use resources::{ProcessProbe, ResourceProbe};
pub use sampling::{FixedSampler, RandomSampler, Sampler, SeededSampler};
pub use stats::OperationStats;
pub use time::Timestamp;
pub use tracker::{CleanupReport, PerformanceTracker, TrackerBuilder, TrackerStats};
pub use tracking::TrackingId;

// ----------------------------------------------------------------------------
// Constants & Version Information
// ----------------------------------------------------------------------------

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "perftrack";

/// Default window size per operation
pub const DEFAULT_MAX_MEASUREMENTS_PER_OPERATION: usize = 1000;

/// Default bound on the alert history
pub const DEFAULT_MAX_ALERTS: usize = 1000;

/// Active contexts older than this are reclaimed by cleanup
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

pub const MAX_TAGS_PER_MEASUREMENT: usize = 32;

/// Operation names longer than this (in bytes) are rejected
pub const MAX_OPERATION_NAME_LENGTH: usize = 256;
