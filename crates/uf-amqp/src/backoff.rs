//! Bounded exponential backoff for channel recreation.
//!
//! Recreating a silent channel against an unreachable broker would otherwise
//! happen on every health tick. Each attempt that is not followed by a delivery
//! doubles the wait before the next one, up to `max`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

/// Backoff state for one channel
#[derive(Debug)]
pub struct RecreateBackoff {
    config: BackoffConfig,
    attempts: u32,
    not_before: Option<DateTime<Utc>>,
}

impl RecreateBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            not_before: None,
        }
    }

    /// Whether a recreation may run at `now`
    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| now >= t)
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a recreation attempt that has not (yet) produced traffic
    pub fn record_attempt(&mut self, now: DateTime<Utc>) -> Duration {
        let delay = self.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        self.not_before = Some(now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC));
        delay
    }

    /// Traffic arrived; the next recreation may run immediately
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.not_before = None;
    }

    fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        let delay = self.config.base.saturating_mul(factor).min(self.config.max);

        if self.config.jitter > 0.0 && !delay.is_zero() {
            let extra = rand::rng().random_range(0.0..self.config.jitter);
            delay.mul_f64(1.0 + extra).min(self.config.max)
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base: u64, max: u64) -> RecreateBackoff {
        RecreateBackoff::new(BackoffConfig {
            base: Duration::from_secs(base),
            max: Duration::from_secs(max),
            jitter: 0.0,
        })
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let mut backoff = no_jitter(5, 30);
        let now = Utc::now();

        assert_eq!(backoff.record_attempt(now), Duration::from_secs(5));
        assert_eq!(backoff.record_attempt(now), Duration::from_secs(10));
        assert_eq!(backoff.record_attempt(now), Duration::from_secs(20));
        assert_eq!(backoff.record_attempt(now), Duration::from_secs(30));
        assert_eq!(backoff.record_attempt(now), Duration::from_secs(30));
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_ready_and_reset() {
        let mut backoff = no_jitter(5, 30);
        let now = Utc::now();
        assert!(backoff.ready(now));

        backoff.record_attempt(now);
        assert!(!backoff.ready(now + TimeDelta::seconds(4)));
        assert!(backoff.ready(now + TimeDelta::seconds(5)));

        backoff.record_attempt(now);
        backoff.reset();
        assert!(backoff.ready(now));
        assert_eq!(backoff.record_attempt(now), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = RecreateBackoff::new(BackoffConfig {
            base: Duration::from_secs(10),
            max: Duration::from_secs(100),
            jitter: 0.5,
        });
        let delay = backoff.record_attempt(Utc::now());
        assert!(delay >= Duration::from_secs(10));
        assert!(delay < Duration::from_secs(15));
    }
}
