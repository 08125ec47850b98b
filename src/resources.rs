//! Process resource sampling.
//!
//! A [`ResourceSample`] is taken before and after a unit of work; the
//! difference becomes the Measurement's memory and CPU deltas. Both figures are
//! process-wide, so concurrent operations observe each other's usage.

use std::fmt::Debug;
use std::fs;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::time::duration_ms;

/// Page size in bytes, used to convert resident pages to bytes.
static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
});

// ----------------------------------------------------------------------------
// Resource Probe
// ----------------------------------------------------------------------------

/// Source of process resource readings.
pub trait ResourceProbe: Send + Sync + Debug {
    /// Current resident memory of the process in bytes, if available.
    fn memory_bytes(&self) -> Option<u64>;

    /// Cumulative CPU time (user + system) consumed by the process, if available.
    fn cpu_time(&self) -> Option<Duration>;
}

/// Reads resource usage of the current process from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbe;

impl ProcessProbe {
    pub fn new() -> Self {
        Self
    }

    /// Parse resident pages out of `/proc/self/statm` content.
    fn parse_statm(content: &str) -> Option<u64> {
        // Format: size resident shared text lib data dt (all in pages)
        content
            .split_whitespace()
            .nth(1)
            .and_then(|pages| pages.parse::<u64>().ok())
            .map(|pages| pages * *PAGE_SIZE)
    }
}

impl ResourceProbe for ProcessProbe {
    fn memory_bytes(&self) -> Option<u64> {
        if cfg!(target_os = "linux") {
            fs::read_to_string("/proc/self/statm")
                .ok()
                .and_then(|content| Self::parse_statm(&content))
        } else {
            None
        }
    }

    #[cfg(unix)]
    fn cpu_time(&self) -> Option<Duration> {
        // SAFETY: rusage is plain data and getrusage only writes into it.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if rc != 0 {
            return None;
        }
        let to_duration = |tv: libc::timeval| {
            Duration::from_secs(tv.tv_sec.max(0) as u64)
                + Duration::from_micros(tv.tv_usec.max(0) as u64)
        };
        Some(to_duration(usage.ru_utime) + to_duration(usage.ru_stime))
    }

    #[cfg(not(unix))]
    fn cpu_time(&self) -> Option<Duration> {
        None
    }
}

// ----------------------------------------------------------------------------
// Samples & Deltas
// ----------------------------------------------------------------------------

/// Resource readings taken at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub memory_bytes: Option<u64>,
    pub cpu_time: Option<Duration>,
}

impl ResourceSample {
    /// Capture only the readings that were asked for.
    pub fn capture(probe: &dyn ResourceProbe, memory: bool, cpu: bool) -> Self {
        Self {
            memory_bytes: if memory { probe.memory_bytes() } else { None },
            cpu_time: if cpu { probe.cpu_time() } else { None },
        }
    }

    /// Difference from `self` (the baseline) to `later`.
    ///
    /// A figure is present only when both samples carry it. Memory may shrink,
    /// so its delta is signed; CPU time is cumulative and never negative.
    pub fn delta_to(&self, later: &ResourceSample) -> ResourceDelta {
        let memory_bytes = match (self.memory_bytes, later.memory_bytes) {
            (Some(before), Some(after)) => Some(after as i64 - before as i64),
            _ => None,
        };
        let cpu_ms = match (self.cpu_time, later.cpu_time) {
            (Some(before), Some(after)) => Some(duration_ms(after.saturating_sub(before))),
            _ => None,
        };
        ResourceDelta { memory_bytes, cpu_ms }
    }
}

/// Change in resource usage across one unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub memory_bytes: Option<i64>,
    pub cpu_ms: Option<f64>,
}
