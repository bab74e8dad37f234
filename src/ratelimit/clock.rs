//! Clock abstraction for window arithmetic.
//!
//! Windows are measured on the monotonic clock; reset times handed to
//! clients are wall-clock. `MockClock` advances both together so tests can
//! expire windows without sleeping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of time for the rate limiter.
pub trait Clock: Send + Sync + Debug {
    /// Monotonic time, used to age windows.
    fn now(&self) -> Instant;

    /// Wall-clock time, used to report reset times.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// System clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same time, so advancing one advances all of them.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    wall_start: DateTime<Utc>,
    offset: Arc<Mutex<Duration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            wall_start: Utc::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.wall_start + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1);
    }

    #[test]
    fn test_mock_clock_moves_both_times() {
        let clock = MockClock::new();
        let instant = clock.now();
        let wall = clock.utc_now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now(), instant + Duration::from_secs(90));
        assert_eq!(clock.utc_now(), wall + chrono::Duration::seconds(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let other = clock.clone();

        other.advance(Duration::from_secs(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }
}
