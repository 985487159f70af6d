//! Quadratic reconnect backoff with a rate-limit floor.

use std::time::Duration;

use backoff::backoff::Backoff;

use super::config::ReconnectConfig;

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `min(base_delay * attempt², max_delay)`, raised to `rate_limit_floor` whenever
/// `rate_limited` is set.
#[must_use]
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32, rate_limited: bool) -> Duration {
    let delay = config
        .base_delay
        .saturating_mul(attempt.saturating_mul(attempt))
        .min(config.max_delay);

    if rate_limited {
        delay.max(config.rate_limit_floor)
    } else {
        delay
    }
}

/// Stateful wrapper around [`reconnect_delay`].
///
/// The attempt counter grows on every [`Backoff::next_backoff`] call and is cleared, together
/// with the rate-limited flag, by [`Backoff::reset`] once a connection opens.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    rate_limited: bool,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rate_limited: false,
        }
    }

    /// Number of consecutive failed or lost connections since the last successful open.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn set_rate_limited(&mut self) {
        self.rate_limited = true;
    }

    /// Whether the configured attempt budget is used up.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.config
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
    }
}

impl Backoff for ReconnectPolicy {
    fn reset(&mut self) {
        self.attempt = 0;
        self.rate_limited = false;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(reconnect_delay(&self.config, self.attempt, self.rate_limited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: Some(4),
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            rate_limit_floor: Duration::from_secs(60),
            rate_limit_statuses: vec![429],
        }
    }

    #[test]
    fn three_closes_follow_quadratic_formula() {
        let mut policy = ReconnectPolicy::new(config());

        let delays: Vec<_> = (0..3).filter_map(|_| policy.next_backoff()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(40),
                Duration::from_secs(90)
            ]
        );
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let config = config();
        let mut previous = Duration::ZERO;

        for attempt in 1..=50 {
            let delay = reconnect_delay(&config, attempt, false);
            assert!(delay >= previous, "attempt {attempt} went down");
            assert!(delay <= config.max_delay, "attempt {attempt} exceeded max");
            previous = delay;
        }
        assert_eq!(previous, config.max_delay);
    }

    #[test]
    fn huge_attempt_counts_saturate_to_max() {
        assert_eq!(
            reconnect_delay(&config(), u32::MAX, false),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn rate_limit_floor_applies_regardless_of_attempt() {
        let config = config();

        assert_eq!(
            reconnect_delay(&config, 1, true),
            Duration::from_secs(60)
        );
        assert_eq!(
            reconnect_delay(&config, 0, true),
            Duration::from_secs(60)
        );
        // Above the floor the quadratic delay wins.
        assert_eq!(
            reconnect_delay(&config, 5, true),
            Duration::from_secs(250)
        );
    }

    #[test]
    fn reset_clears_attempts_and_rate_limit() {
        let mut policy = ReconnectPolicy::new(config());
        policy.set_rate_limited();
        _ = policy.next_backoff();
        _ = policy.next_backoff();

        policy.reset();

        assert_eq!(policy.attempt(), 0);
        assert!(!policy.is_rate_limited(), "rate limit should clear on open");
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let mut policy = ReconnectPolicy::new(config());

        for _ in 0..3 {
            _ = policy.next_backoff();
        }
        assert!(!policy.exhausted(), "three of four attempts used");
        _ = policy.next_backoff();
        assert!(policy.exhausted(), "budget should be used up");
    }
}
