//! Traffic counters and last-event timestamps.
//!
//! Everything here is atomics so the engine task can bump counters while the
//! management API reads them without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Per-bucket packet counters, mirroring the management `get_packetstats`
/// output.
#[derive(Debug, Default)]
pub struct PacketStats {
    /// Unicast datagrams forwarded between edges.
    pub forward_tx: AtomicU64,
    /// Broadcast fan-outs performed.
    pub broadcast_tx: AtomicU64,
    /// Registrations processed.
    pub reg_rx: AtomicU64,
    /// Registration NAKs emitted.
    pub reg_nak: AtomicU64,
    /// Datagrams dropped on the send path.
    pub errors_tx: AtomicU64,
    /// Inbound datagrams that failed to decode.
    pub rx_errors: AtomicU64,
}

impl PacketStats {
    pub fn new() -> Self {
        PacketStats::default()
    }
}

/// Bump an atomic counter.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Monotonic timestamps of the daemon's last notable events, in seconds
/// since startup. `start_time` alone is wall-clock, for operator
/// correlation.
#[derive(Debug)]
pub struct EventTimestamps {
    started: Instant,
    start_time_epoch: u64,
    last_register: AtomicU64,
    last_fwd: AtomicU64,
    last_sweep: AtomicU64,
    last_federation: AtomicU64,
}

impl EventTimestamps {
    pub fn new() -> Self {
        EventTimestamps {
            started: Instant::now(),
            start_time_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            last_register: AtomicU64::new(0),
            last_fwd: AtomicU64::new(0),
            last_sweep: AtomicU64::new(0),
            last_federation: AtomicU64::new(0),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn mark_register(&self) {
        self.last_register.store(self.now(), Ordering::Relaxed);
    }

    pub fn mark_fwd(&self) {
        self.last_fwd.store(self.now(), Ordering::Relaxed);
    }

    pub fn mark_sweep(&self) {
        self.last_sweep.store(self.now(), Ordering::Relaxed);
    }

    pub fn mark_federation(&self) {
        self.last_federation.store(self.now(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TimestampsSnapshot {
        TimestampsSnapshot {
            start_time: self.start_time_epoch,
            last_register: self.last_register.load(Ordering::Relaxed),
            last_fwd: self.last_fwd.load(Ordering::Relaxed),
            last_sweep: self.last_sweep.load(Ordering::Relaxed),
            last_federation: self.last_federation.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventTimestamps {
    fn default() -> Self {
        EventTimestamps::new()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TimestampsSnapshot {
    pub start_time: u64,
    pub last_register: u64,
    pub last_fwd: u64,
    pub last_sweep: u64,
    pub last_federation: u64,
}
