//! Injected clock used for every time comparison in the engine.
//!
//! Production code uses [`SystemClock`]; tests use [`ManualClock`] to make
//! debounce, quiet-hours and timeout scenarios deterministic.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as epoch seconds.
    fn epoch(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually-driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Create a clock frozen at the given epoch second.
    #[must_use]
    pub fn at_epoch(epoch: i64) -> Self {
        Self::new(DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now))
    }

    /// Move the clock to a new instant.
    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Advance the clock by a number of seconds.
    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += chrono::Duration::seconds(secs);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|_| Utc::now(), |guard| *guard)
    }
}
