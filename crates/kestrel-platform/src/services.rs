//! Clock service and its host and test implementations.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock time for timestamps and sudo expiry.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since this clock was created.
    fn uptime_secs(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Host implementation
// ---------------------------------------------------------------------------

/// Clock backed by the host's system time.
pub struct HostClock {
    start_time: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// Manual implementation
// ---------------------------------------------------------------------------

/// Clock that only moves when told to. Used to simulate elapsed time.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    start: DateTime<Utc>,
}

impl ManualClock {
    /// Start at the given instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            start,
        }
    }

    /// Move the clock forward (or backward, for a negative duration).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn uptime_secs(&self) -> u64 {
        let elapsed = self.now() - self.start;
        elapsed.num_seconds().max(0) as u64
    }
}
