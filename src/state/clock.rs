//! Synchronized time.
//!
//! The authority's own clock is canonical. Replicas keep the latest authority
//! timestamp together with the local instant it was received and extrapolate
//! from there. No round-trip compensation is attempted; precision is bounded by
//! the broadcast interval plus one-way relay latency.

use std::{cmp::Ordering, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::state::round::PeerRole;

/// Source of local monotonic time, in seconds.
pub trait LocalClock: Send + Sync {
    /// Seconds elapsed on this peer's local clock.
    fn now_secs(&self) -> f64;
}

/// Local clock backed by the tokio timer, optionally shifted by a fixed skew.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Instant,
    skew_secs: f64,
}

impl TokioClock {
    /// Clock starting at zero now.
    pub fn new() -> Self {
        Self::with_skew(0.0)
    }

    /// Clock that reports `skew_secs` more than a fresh [`TokioClock::new`].
    pub fn with_skew(skew_secs: f64) -> Self {
        Self {
            origin: Instant::now(),
            skew_secs,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for TokioClock {
    fn now_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() + self.skew_secs
    }
}

/// A point on the authority's timeline, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncInstant(f64);

impl SyncInstant {
    /// Wrap an absolute authority timestamp.
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Raw seconds on the authority timeline.
    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Instant `secs` later on the same timeline.
    pub fn after(self, secs: f64) -> Self {
        Self(self.0 + secs)
    }
}

impl Eq for SyncInstant {}

impl PartialOrd for SyncInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SyncInstant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncSample {
    authority_time: f64,
    local_receipt: f64,
}

/// Per-peer estimate of authority time.
#[derive(Debug, Clone)]
pub struct ClockSync {
    role: PeerRole,
    interval_secs: f64,
    latest: Option<SyncSample>,
    last_emit: Option<f64>,
    high_water: f64,
}

impl ClockSync {
    /// Build the clock for a peer with the given role, broadcasting (authority) or
    /// expecting (replica) a sample every `interval`.
    pub fn new(role: PeerRole, interval: Duration) -> Self {
        Self {
            role,
            interval_secs: interval.as_secs_f64(),
            latest: None,
            last_emit: None,
            high_water: f64::NEG_INFINITY,
        }
    }

    /// Whether this peer has anything better than its own clock to go on.
    pub fn is_synchronized(&self) -> bool {
        self.role == PeerRole::Authority || self.latest.is_some()
    }

    /// Replace the current estimate with a freshly received authority timestamp.
    ///
    /// Ignored on the authority, whose own clock is canonical.
    pub fn observe(&mut self, authority_time: f64, local_receipt: f64) {
        if self.role == PeerRole::Authority {
            return;
        }
        if self.latest.is_none() {
            // Free-running local time is not on the authority's scale.
            self.high_water = f64::NEG_INFINITY;
        }
        self.latest = Some(SyncSample {
            authority_time,
            local_receipt,
        });
    }

    /// Estimate without the monotonic clamp.
    pub fn estimate(&self, local_now: f64) -> f64 {
        match (self.role, self.latest) {
            (PeerRole::Authority, _) | (_, None) => local_now,
            (PeerRole::Replica, Some(sample)) => {
                sample.authority_time + (local_now - sample.local_receipt)
            }
        }
    }

    /// Current synchronized time.
    ///
    /// Never returns less than a value it has already handed out, so a sample that
    /// pulls the estimate backwards cannot make an already scheduled action look
    /// further away than it did before.
    pub fn synchronized_time(&mut self, local_now: f64) -> SyncInstant {
        let estimate = self.estimate(local_now);
        if estimate > self.high_water {
            self.high_water = estimate;
        }
        SyncInstant(self.high_water)
    }

    /// Synchronized instant `delay_secs` from now.
    pub fn future_instant(&mut self, local_now: f64, delay_secs: f64) -> SyncInstant {
        self.synchronized_time(local_now).after(delay_secs)
    }

    /// On the authority, return the timestamp to broadcast when a sync is due.
    pub fn due_broadcast(&mut self, local_now: f64) -> Option<f64> {
        if self.role != PeerRole::Authority {
            return None;
        }
        let due = match self.last_emit {
            None => true,
            Some(last) => local_now - last >= self.interval_secs,
        };
        if !due {
            return None;
        }
        self.last_emit = Some(local_now);
        Some(self.synchronized_time(local_now).as_secs())
    }

    /// Seconds since the last sample arrived, if any has.
    pub fn since_last_sample(&self, local_now: f64) -> Option<f64> {
        self.latest.map(|sample| local_now - sample.local_receipt)
    }
}
