//! Clock abstraction
//!
//! Rate limiting and checkpoint ages consult an injected clock so tests can
//! drive time by hand. Wall-clock timestamps (token expiry, audit records)
//! use `chrono` directly and are not part of this abstraction.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic instant in milliseconds since an arbitrary origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Source of monotonic time.
pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real monotonic clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed().as_millis() as u64)
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    now: Arc<Mutex<Timestamp>>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn tick(&self, ms: u64) {
        let mut now = self.now.lock();
        *now = Timestamp(now.0 + ms);
    }
}

impl MonotonicClock for SimulatedClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_only_moves_when_ticked() {
        let clock = SimulatedClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.tick(250);
        assert_eq!(clock.now().saturating_since(t0), 250);
    }

    #[test]
    fn system_clock_is_monotone() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
