//! Session time source
//!
//! The manager needs two clocks: wall time in whole seconds for persisted
//! peer history (attempt times, piece-data times) and a monotonic
//! millisecond clock for rates and pulse bookkeeping. Both come from one
//! handle so tests can drive time by hand.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Cloneable two-scale time source.
#[derive(Debug, Clone)]
pub struct SessionClock {
    inner: ClockInner,
}

#[derive(Debug, Clone)]
enum ClockInner {
    System { epoch: Instant },
    Manual(Arc<Mutex<u64>>),
}

impl SessionClock {
    /// Creates a clock backed by the operating system.
    pub fn system() -> Self {
        Self {
            inner: ClockInner::System {
                epoch: Instant::now(),
            },
        }
    }

    /// Creates a hand-driven clock starting at `start_msec` monotonic
    /// milliseconds. Wall seconds derive from the same counter.
    pub fn manual(start_msec: u64) -> Self {
        Self {
            inner: ClockInner::Manual(Arc::new(Mutex::new(start_msec))),
        }
    }

    /// Wall time in whole seconds.
    pub fn now_secs(&self) -> u64 {
        match &self.inner {
            ClockInner::System { .. } => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            ClockInner::Manual(msec) => *msec.lock() / 1_000,
        }
    }

    /// Monotonic milliseconds.
    pub fn now_msec(&self) -> u64 {
        match &self.inner {
            ClockInner::System { epoch } => epoch.elapsed().as_millis() as u64,
            ClockInner::Manual(msec) => *msec.lock(),
        }
    }

    /// Advances a manual clock by `msec` milliseconds.
    ///
    /// No-op on a system clock.
    pub fn advance_msec(&self, msec: u64) {
        if let ClockInner::Manual(current) = &self.inner {
            *current.lock() += msec;
        }
    }

    /// Advances a manual clock by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance_msec(secs * 1_000);
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = SessionClock::manual(5_000);
        assert_eq!(clock.now_msec(), 5_000);
        assert_eq!(clock.now_secs(), 5);

        clock.advance_secs(90);
        assert_eq!(clock.now_secs(), 95);
        assert_eq!(clock.now_msec(), 95_000);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = SessionClock::manual(0);
        let other = clock.clone();
        clock.advance_msec(250);
        assert_eq!(other.now_msec(), 250);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SessionClock::system();
        let first = clock.now_msec();
        assert!(clock.now_msec() >= first);
        assert!(clock.now_secs() > 0);
    }
}
