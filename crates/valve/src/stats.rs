//! Relay activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by the listeners, connections, and controller.
///
/// All counters are monotonic; [`ValveStats::snapshot`] reads them without
/// resetting.
#[derive(Debug, Default)]
pub struct ValveStats {
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    connections_failed: AtomicU64,
    bytes_relayed: AtomicU64,
    pauses: AtomicU64,
    resumes: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Connections admitted by a listener.
    pub connections_accepted: u64,
    /// Connections closed at accept time (over the connection limit).
    pub connections_refused: u64,
    /// Connections dropped because the outbound server connect failed.
    pub connections_failed: u64,
    /// Total bytes written to either peer, after filtering.
    pub bytes_relayed: u64,
    /// PAUSE transitions applied by the controller.
    pub pauses: u64,
    /// RESUME transitions applied by the controller.
    pub resumes: u64,
}

impl ValveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_relayed(&self, count: u64) {
        self.bytes_relayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn paused(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resumed(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
        }
    }
}
