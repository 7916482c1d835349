//! Time sources.
//!
//! Every timestamp the queue writes (`created_at`, `scheduled_at`, TTL expiry
//! in the memory store) comes from a [`Clock`], so tests can swap in a
//! [`MockClock`] and step over retry backoffs and delays without sleeping.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same underlying instant.
///
/// ```rust
/// use jobkeeper::clock::{Clock, MockClock};
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
///
/// clock.advance(Duration::seconds(8));
/// assert_eq!((clock.now() - start).num_seconds(), 8);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.advance(Duration::days(1));
        clock.advance(Duration::hours(2));
        clock.advance(Duration::minutes(30));

        let elapsed = clock.now() - start;
        assert_eq!(elapsed.num_hours(), 26);
        assert_eq!(elapsed.num_minutes(), 1590);
    }

    #[test]
    fn test_mock_clock_set_time_is_shared() {
        let clock = MockClock::new();
        let shared = clock.clone();
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        clock.set_time(instant);
        assert_eq!(shared.now(), instant);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
