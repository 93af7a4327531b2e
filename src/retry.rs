//! Exponential backoff with jitter, grounded identically on
//! `original_source/src/hyperliquid/ingest/adapters/hyperliquid.py::RetryPolicy` and
//! `original_source/src/hyperliquid/execution/adapters/binance.py::RetryPolicy`.

use rand::Rng;

use crate::config::RetrySection;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay_ms: section.base_delay_ms,
            max_delay_ms: section.max_delay_ms,
            jitter_ms: section.jitter_ms,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^(attempt-1), max_delay) + random(0, jitter)`. `attempt`
    /// is 1-indexed.
    pub fn next_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << exp);
        let base = scaled.min(self.max_delay_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        base + jitter
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_then_caps() {
        let policy = RetryPolicy { max_attempts: 5, base_delay_ms: 100, max_delay_ms: 500, jitter_ms: 0 };
        assert_eq!(policy.next_delay_ms(1), 100);
        assert_eq!(policy.next_delay_ms(2), 200);
        assert_eq!(policy.next_delay_ms(3), 400);
        assert_eq!(policy.next_delay_ms(4), 500);
        assert_eq!(policy.next_delay_ms(5), 500);
    }

    #[test]
    fn zero_max_attempts_means_unbounded() {
        let policy = RetryPolicy { max_attempts: 0, base_delay_ms: 10, max_delay_ms: 100, jitter_ms: 0 };
        assert!(policy.should_retry(1_000));
    }
}
