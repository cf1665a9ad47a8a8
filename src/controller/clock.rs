//! Clock abstraction for time-dependent rollout decisions
//!
//! Production code uses `SystemClock`. Tests use `MockClock` so grace periods,
//! bake durations and sample windows can be crossed deterministically.

use chrono::{DateTime, Utc};

/// Source of "now" for the weight controller and the probe
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convert a std duration into a chrono one, saturating on overflow
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Whether at least `duration` has passed between `since` and `now`
pub fn has_elapsed(
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    duration: std::time::Duration,
) -> bool {
    now.signed_duration_since(since) >= to_chrono(duration)
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
