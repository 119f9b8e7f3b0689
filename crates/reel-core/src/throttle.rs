//! Rolling-window rate limiter for recording events

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    /// First call over the limit
    Throttled,
    /// Over the limit and already reported
    Skipped,
}

/// Allows at most `max_count` calls within the last `duration_secs` seconds,
/// counted in whole-second buckets
#[derive(Debug)]
pub struct Throttle {
    max_count: usize,
    duration_secs: u64,
    buckets: BTreeMap<u64, usize>,
    is_throttled: bool,
}

impl Throttle {
    pub fn new(max_count: usize, duration_secs: u64) -> Self {
        Self {
            max_count,
            duration_secs,
            buckets: BTreeMap::new(),
            is_throttled: false,
        }
    }

    /// Record a call at `now_ms` unless the window is full
    pub fn check(&mut self, now_ms: u64) -> ThrottleDecision {
        let now = now_ms / 1000;
        let threshold = now.saturating_sub(self.duration_secs);
        self.buckets.retain(|&second, _| second >= threshold);

        let total: usize = self.buckets.values().sum();
        if total >= self.max_count {
            let was_throttled = std::mem::replace(&mut self.is_throttled, true);
            return if was_throttled {
                ThrottleDecision::Skipped
            } else {
                ThrottleDecision::Throttled
            };
        }

        self.is_throttled = false;
        *self.buckets.entry(now).or_insert(0) += 1;
        ThrottleDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_window() {
        let mut throttle = Throttle::new(3, 5);
        for _ in 0..3 {
            assert_eq!(throttle.check(10_000), ThrottleDecision::Allowed);
        }
        assert_eq!(throttle.check(10_500), ThrottleDecision::Throttled);
        assert_eq!(throttle.check(11_000), ThrottleDecision::Skipped);
        assert_eq!(throttle.check(12_000), ThrottleDecision::Skipped);
    }

    #[test]
    fn test_window_rolls_over() {
        let mut throttle = Throttle::new(2, 5);
        assert_eq!(throttle.check(10_000), ThrottleDecision::Allowed);
        assert_eq!(throttle.check(12_000), ThrottleDecision::Allowed);
        assert_eq!(throttle.check(13_000), ThrottleDecision::Throttled);

        // The bucket for second 10 falls out of the window at second 16
        assert_eq!(throttle.check(16_000), ThrottleDecision::Allowed);
        assert_eq!(throttle.check(16_100), ThrottleDecision::Throttled);
    }
}
