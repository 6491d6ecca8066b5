//! Exponential backoff with jitter
//!
//! One policy type serves both retry pacing in the fault-tolerant
//! executor and the reconnect schedule advertised to push clients.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy: `base * 2^(attempt-1)`, capped, with a
/// symmetric random jitter factor applied last.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter fraction, e.g. 0.3 for ±30%
    pub jitter: f64,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap, jitter }
    }

    /// Pacing between provider-call retry attempts
    pub const fn retry_default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(5), 0.3)
    }

    /// Reconnect schedule for push clients that lost their channel
    pub const fn reconnect_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 0.3)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let uncapped = self
            .base
            .saturating_mul(2_u32.saturating_pow(exponent));
        let capped = uncapped.min(self.cap);

        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        capped.mul_f64(factor)
    }
}
