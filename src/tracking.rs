//! In-flight tracking contexts.
//!
//! Both the wrapper and the manual start/end API register a context here for
//! the lifetime of the unit of work. A context is consumed exactly once: by
//! its end call, or by a staleness sweep.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use compact_str::CompactString;
use dashmap::DashMap;
use ulid::Ulid;

use crate::measurement::TrackOptions;
use crate::resources::ResourceSample;
use crate::time::{elapsed_between, Timestamp};

// ----------------------------------------------------------------------------
// Tracking Id
// ----------------------------------------------------------------------------

/// Opaque handle returned by `start_tracking`.
///
/// ULIDs sort by creation time, which keeps log output readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingId(Ulid);

impl TrackingId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TrackingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TrackingId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

// ----------------------------------------------------------------------------
// Tracking Context
// ----------------------------------------------------------------------------

/// Everything needed to finalize a Measurement once the work completes.
#[derive(Debug, Clone)]
pub struct TrackingContext {
    pub operation: CompactString,
    /// Wall-clock start, recorded as the Measurement's `start_time`
    pub started_wall: Timestamp,
    /// Monotonic start, used for the duration
    pub started: quanta::Instant,
    pub baseline: ResourceSample,
    pub options: TrackOptions,
    /// Sampling decision, drawn once at start
    pub sampled: bool,
}

impl TrackingContext {
    /// Time since the context was created, as seen by `now`.
    pub fn age(&self, now: quanta::Instant) -> Duration {
        elapsed_between(self.started, now)
    }
}

// ----------------------------------------------------------------------------
// Active Tracking Table
// ----------------------------------------------------------------------------

/// Concurrent map from tracking handle to in-flight context.
pub struct ActiveTrackingTable {
    contexts: DashMap<TrackingId, TrackingContext, ahash::RandomState>,
}

impl ActiveTrackingTable {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Register a context under a fresh handle.
    pub fn insert(&self, context: TrackingContext) -> TrackingId {
        let id = TrackingId::new();
        self.contexts.insert(id, context);
        id
    }

    /// Take the context out of the table. Only the first caller gets it.
    pub fn remove(&self, id: &TrackingId) -> Option<TrackingContext> {
        self.contexts.remove(id).map(|(_, context)| context)
    }

    pub fn contains(&self, id: &TrackingId) -> bool {
        self.contexts.contains_key(id)
    }

    /// Discard contexts older than `stale_after`. Returns how many were dropped.
    pub fn evict_stale(&self, now: quanta::Instant, stale_after: Duration) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, context| context.age(now) <= stale_after);
        before.saturating_sub(self.contexts.len())
    }

    /// Age of the longest-running context.
    pub fn oldest_age(&self, now: quanta::Instant) -> Option<Duration> {
        self.contexts.iter().map(|entry| entry.age(now)).max()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn clear(&self) {
        self.contexts.clear();
    }
}

impl Default for ActiveTrackingTable {
    fn default() -> Self {
        Self::new()
    }
}
