use rand::Rng;
use std::time::Duration;

pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(2000);
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(60_000);
/// Upper bound of the random fraction added on top of the backoff delay.
pub const RETRY_JITTER: f64 = 0.3;

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
            jitter: RETRY_JITTER,
            max_attempts: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max)`, attempt being 0-indexed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus `fraction` of it, with `fraction` clamped to `[0, jitter]`.
    /// Jitter only ever lengthens the delay.
    pub fn delay_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let backoff = self.backoff(attempt);
        let fraction = fraction.clamp(0.0, self.jitter.max(0.0));
        backoff + backoff.mul_f64(fraction)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let fraction = if self.jitter > 0.0 {
            rand::rng().random_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, fraction)
    }
}
