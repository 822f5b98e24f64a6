//! Bounded, jittered delay sequence for reconnect attempts.

use std::time::Duration;

use rand::Rng;

/// Tuning knobs for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay for the first attempt, before jitter.
    pub base: Duration,
    /// Upper bound the delay is clamped to before jitter.
    pub cap: Duration,
    /// Growth multiplier applied per attempt.
    pub factor: f64,
    /// Fraction of the computed delay that is randomized, in `[0, 1]`.
    /// `1.0` (the default) is full jitter: the final delay is a uniform
    /// sample over `[0, delay]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: 1.0,
        }
    }
}

/// Produces `min(cap, base * factor^(n-1))` for attempt `n`, perturbed by
/// jitter, then increments `n`. `reset()` sets `n` back to 1.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the jittered delay for the next attempt and advances the
    /// internal attempt counter.
    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        let exponent = i32::try_from(self.attempt - 1).unwrap_or(i32::MAX);
        let raw = self
            .config
            .base
            .mul_f64(self.config.factor.powi(exponent))
            .min(self.config.cap);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return raw;
        }

        let floor = raw.mul_f64(1.0 - jitter);
        let span = raw.mul_f64(jitter);
        let sample: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        floor + span.mul_f64(sample)
    }

    /// Resets the attempt counter so the next `next()` call behaves as attempt 1 again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_bounded_by_base() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        });
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[test]
    fn grows_geometrically_until_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(45),
            factor: 2.0,
            jitter: 0.0,
        });
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert_eq!(backoff.next(), Duration::from_millis(40));
        assert_eq!(backoff.next(), Duration::from_millis(45)); // would be 80, clamped
        assert_eq!(backoff.next(), Duration::from_millis(45));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        });
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[test]
    fn full_jitter_stays_within_range() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: 1.0,
        });
        for _ in 0..100 {
            let delay = backoff.next();
            assert!(delay <= Duration::from_secs(30));
        }
    }
}
