use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential reconnect backoff with ±25% jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// # Examples
    ///
    /// ```
    /// use cyfr_peer::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let mut backoff = ExponentialBackoff::new(
    ///     Duration::from_millis(100),
    ///     Duration::from_millis(5000),
    ///     2.0,
    /// );
    /// let delay = backoff.next_delay();
    /// assert!(delay >= Duration::from_millis(75));
    /// assert!(delay <= Duration::from_millis(125));
    /// assert_eq!(backoff.attempt(), 1);
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
        )
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    /// Compute the next delay (with jitter) and advance the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let current_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = Duration::from_millis((current_ms as f64 * jitter) as u64);

        let next_ms = ((current_ms as f64 * self.factor) as u64).min(max_ms);
        self.current = Duration::from_millis(next_ms);
        self.attempt = self.attempt.saturating_add(1);

        delay
    }

    /// Back to the initial delay, typically after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_delays_never_exceed_max() {
        let max = Duration::from_millis(1000);
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), max, 2.0);

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay.as_millis() as f64 <= max.as_millis() as f64 * 1.25 + 1.0);
        }
        assert_eq!(backoff.attempt(), 20);
    }

    #[test]
    fn test_reset_returns_to_initial_range() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30), 2.0);
        for _ in 0..8 {
            backoff.next_delay();
        }

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(75) && delay <= Duration::from_millis(125));
    }

    #[test]
    fn test_from_config() {
        let config = ReconnectConfig {
            initial_delay_ms: 200,
            max_delay_ms: 200,
            backoff_factor: 3.0,
        };
        let mut backoff = ExponentialBackoff::from_config(&config);
        for _ in 0..5 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(150) && delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_huge_max_does_not_overflow() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(u64::MAX), 2.0);
        for _ in 0..100 {
            assert!(backoff.next_delay() > Duration::ZERO);
        }
    }
}
