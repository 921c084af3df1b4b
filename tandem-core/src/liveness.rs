//! Keep-alive and dead-peer detection.
//!
//! The monitor only keeps time; the connection actor asks it for the next
//! read and write deadlines, sleeps until the earlier one and reports the
//! expiry back. A write-idle expiry emits a `KEEP_ALIVE`, a read-idle
//! expiry closes the session.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Stands in for an unbounded deadline; tokio uses the same horizon.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + after`, with `after` capped at [`FAR_FUTURE`] so the sum cannot overflow.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Instant {
    start + after.min(FAR_FUTURE)
}

/// Per-connection idle timers and heartbeat counters.
#[derive(Debug)]
pub struct LivenessMonitor {
    timers: Mutex<Timers>,
    heartbeats_sent: AtomicU64,
    heartbeats_missed: AtomicU64,
}

#[derive(Debug)]
struct Timers {
    read_idle: Duration,
    write_idle: Duration,
    last_read: Instant,
    last_write: Instant,
}

/// Snapshot of a monitor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessStats {
    pub heartbeats_sent: u64,
    pub heartbeats_missed: u64,
}

impl LivenessMonitor {
    pub fn new(read_idle: Duration, write_idle: Duration) -> Self {
        let now = Instant::now();
        Self {
            timers: Mutex::new(Timers {
                read_idle,
                write_idle,
                last_read: now,
                last_write: now,
            }),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_missed: AtomicU64::new(0),
        }
    }

    /// Replaces both idle durations and restarts the timers.
    pub fn configure(&self, read_idle: Duration, write_idle: Duration) {
        let now = Instant::now();
        let mut timers = self.timers.lock();
        timers.read_idle = read_idle;
        timers.write_idle = write_idle;
        timers.last_read = now;
        timers.last_write = now;
    }

    pub fn read_idle(&self) -> Duration {
        self.timers.lock().read_idle
    }

    pub fn write_idle(&self) -> Duration {
        self.timers.lock().write_idle
    }

    /// Any inbound traffic resets the read timer.
    pub fn record_read(&self) {
        self.timers.lock().last_read = Instant::now();
    }

    /// Any outbound traffic resets the write timer.
    pub fn record_write(&self) {
        self.timers.lock().last_write = Instant::now();
    }

    pub fn read_deadline(&self) -> Instant {
        let timers = self.timers.lock();
        deadline_after(timers.last_read, timers.read_idle)
    }

    pub fn write_deadline(&self) -> Instant {
        let timers = self.timers.lock();
        deadline_after(timers.last_write, timers.write_idle)
    }

    /// Returns true when a keep-alive must be sent.
    ///
    /// The write timer is reset here so that a slow writer does not cause
    /// a burst of keep-alives.
    pub fn on_write_idle(&self, now: Instant) -> bool {
        let mut timers = self.timers.lock();
        if now < deadline_after(timers.last_write, timers.write_idle) {
            return false;
        }
        timers.last_write = now;
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Returns true when the peer is considered dead.
    pub fn on_read_idle(&self, now: Instant) -> bool {
        if now < self.read_deadline() {
            return false;
        }
        self.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn stats(&self) -> LivenessStats {
        LivenessStats {
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_missed: self.heartbeats_missed.load(Ordering::Relaxed),
        }
    }
}
