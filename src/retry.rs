//! Bounded exponential backoff for transient failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exp);
        let base = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);

        let millis = if self.jitter && base > 0 {
            let spread = base / 5;
            base + rand::thread_rng().gen_range(0..=spread)
        } else {
            base
        };
        Duration::from_millis(millis.min(self.max_backoff_ms.saturating_add(self.max_backoff_ms / 5)))
    }

    /// Policy without delays, for tests.
    pub fn immediate() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1,
            jitter: false,
        }
    }
}
