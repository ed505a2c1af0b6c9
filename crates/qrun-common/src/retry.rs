//! Exponential backoff with jitter.
//!
//! Used to space out status polls and watch re-establishment so that many
//! concurrent engines do not hammer the API server in lockstep.
//!
//! # Example
//!
//! ```ignore
//! use qrun_common::retry::{Backoff, BackoffConfig};
//!
//! let mut backoff = Backoff::new(BackoffConfig::default());
//! loop {
//!     if job_is_done().await? { break; }
//!     tokio::time::sleep(backoff.next_delay()).await;
//! }
//! ```

use std::time::Duration;

use rand::Rng;

/// Smallest initial delay accepted by [`BackoffConfig::bounded`]
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Configuration for an exponential backoff sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each step
    pub multiplier: f64,
    /// Whether to randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Create a config with explicit bounds and default multiplier.
    /// `initial_delay` is raised to [`MIN_DELAY`].
    pub fn bounded(initial_delay: Duration, max_delay: Duration) -> Self {
        let initial_delay = initial_delay.max(MIN_DELAY);
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            ..Default::default()
        }
    }

    /// Disable jitter (deterministic delays, mostly for tests)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Stateful backoff sequence built from a [`BackoffConfig`].
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Start a new sequence at the configured initial delay
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Return the next delay and advance the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;

        // Exponential growth, capped at max_delay
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        if self.config.jitter {
            // 0.5x to 1.5x of the delay, still capped
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(
                (base.as_secs_f64() * factor).min(self.config.max_delay.as_secs_f64()),
            )
        } else {
            base
        }
    }

    /// Return to the initial delay (call after observing progress)
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_until_cap() {
        let config =
            BackoffConfig::bounded(Duration::from_secs(1), Duration::from_secs(5)).without_jitter();
        let mut backoff = Backoff::new(config);

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let config = BackoffConfig::bounded(Duration::from_millis(100), Duration::from_secs(1))
            .without_jitter();
        let mut backoff = Backoff::new(config);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let config = BackoffConfig::bounded(Duration::from_millis(200), Duration::from_secs(2));
        let mut backoff = Backoff::new(config);

        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn bounded_never_inverts_limits() {
        let config = BackoffConfig::bounded(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(3));
    }

    #[test]
    fn zero_initial_delay_is_raised_to_floor() {
        let config = BackoffConfig::bounded(Duration::ZERO, Duration::ZERO).without_jitter();
        assert_eq!(config.initial_delay, MIN_DELAY);
        assert_eq!(config.max_delay, MIN_DELAY);

        let mut backoff = Backoff::new(config);
        for _ in 0..5 {
            assert!(backoff.next_delay() >= MIN_DELAY);
        }
    }
}
