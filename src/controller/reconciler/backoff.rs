use std::time::Duration;

/// Bounded exponential backoff for transient cluster API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Backoff {
            base,
            max,
            max_retries,
        }
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped at max
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(10), 5);

        assert_eq!(backoff.delay(0), Duration::from_millis(200));
        assert_eq!(backoff.delay(1), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(3200));
        assert_eq!(backoff.delay(6), Duration::from_secs(10));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
    }
}
