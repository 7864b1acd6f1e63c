use rand::Rng;
use std::time::Duration;

/// Bounds the conflict-driven retries on a single request.
///
/// Between rounds the caller sleeps for a capped exponential delay with full
/// jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the pause after `attempt` (1-based) failed.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_micros() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Sleep before the next round. Returns without waiting once the budget
    /// is spent, leaving the caller to give up.
    pub async fn pause(&self, attempt: u32) {
        if attempt >= self.max_attempts {
            return;
        }
        let delay = self.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
