//! Clock abstraction for testable time handling.
//!
//! The Progress Watcher's ETA extrapolation and the arbiter's cleanup/grace
//! timers all read wall-clock time; tests substitute [`FakeClock`] so timer
//! and debounce behavior can be driven deterministically instead of slept
//! through in real time.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A clock that provides the current time.
pub trait Clock: Clone + Send + Sync {
    fn now(&self) -> Instant;
    fn epoch_ms(&self) -> u64;
}

/// Real system clock.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

/// Fake clock for testing with controllable time.
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<Instant>>,
    epoch_ms: Arc<Mutex<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { current: Arc::new(Mutex::new(Instant::now())), epoch_ms: Arc::new(Mutex::new(1_000_000)) }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration;
        *self.epoch_ms.lock() += duration.as_millis() as u64;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        *self.current.lock() = instant;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }

    fn epoch_ms(&self) -> u64 {
        *self.epoch_ms.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_increasing_time() {
        let clock = SystemClock;
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        let t2 = clock.now();
        assert!(t2 > t1);
    }

    #[test]
    fn fake_clock_can_be_advanced() {
        let clock = FakeClock::new();
        let t1 = clock.now();
        clock.advance(Duration::from_secs(60));
        let t2 = clock.now();
        assert!(t2.duration_since(t1) >= Duration::from_secs(60));
    }

    #[test]
    fn fake_clock_is_cloneable_and_shared() {
        let clock1 = FakeClock::new();
        let clock2 = clock1.clone();
        let t1 = clock1.now();
        clock2.advance(Duration::from_secs(30));
        let t2 = clock1.now();
        assert!(t2.duration_since(t1) >= Duration::from_secs(30));
    }
}
