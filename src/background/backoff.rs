use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Jitter is drawn from `[0, delay * jitter_fraction]`.
    pub jitter_fraction: f64,
}

impl BackoffPolicy {
    /// Delay before jitter for the given number of failures already counted:
    /// `min(max, base * 2^failures)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Failure counter plus jitter source for the poller.
pub(crate) struct Backoff<R> {
    policy: BackoffPolicy,
    consecutive_failures: u32,
    rng: R,
}

impl<R: Rng> Backoff<R> {
    pub(crate) fn new(policy: BackoffPolicy, rng: R) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            rng,
        }
    }

    /// Delay before the next attempt; increments the failure count.
    pub(crate) fn on_failure(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay.saturating_add(self.jitter(delay))
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn jitter(&mut self, delay: Duration) -> Duration {
        let ceiling = delay.as_secs_f64() * self.policy.jitter_fraction;
        if ceiling <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.rng.gen_range(0.0..=ceiling)).unwrap_or(Duration::MAX)
    }
}
