//! Sliding-window rate limiting, grounded identically on
//! `original_source/src/hyperliquid/ingest/adapters/hyperliquid.py::RateLimiter` and
//! `original_source/src/hyperliquid/execution/adapters/binance.py::RateLimiter` (the two
//! source adapters duplicate the same deque-based window; here it is one
//! shared type both adapters hold).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RateLimitSection;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub per_seconds: u64,
    pub cooldown_seconds: u64,
}

impl From<&RateLimitSection> for RateLimitPolicy {
    fn from(section: &RateLimitSection) -> Self {
        Self {
            max_requests: section.max_requests,
            per_seconds: section.per_seconds,
            cooldown_seconds: section.cooldown_seconds,
        }
    }
}

/// Tracks request timestamps in a rolling window; breaching the window
/// triggers a cooldown period during which every check fails.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    timestamps: Mutex<VecDeque<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            timestamps: Mutex::new(VecDeque::new()),
            cooldown_until: Mutex::new(None),
        }
    }

    /// Returns `true` and records the call if under the limit; `false` if
    /// rate-limited (in cooldown or window full), without recording.
    pub fn try_acquire(&self) -> bool {
        if self.policy.max_requests == 0 {
            return true;
        }
        let now = Instant::now();
        {
            let cooldown_until = self.cooldown_until.lock();
            if let Some(until) = *cooldown_until {
                if now < until {
                    return false;
                }
            }
        }
        let window = Duration::from_secs(self.policy.per_seconds.max(1));
        let mut timestamps = self.timestamps.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() as u32 >= self.policy.max_requests {
            if self.policy.cooldown_seconds > 0 {
                *self.cooldown_until.lock() = Some(now + Duration::from_secs(self.policy.cooldown_seconds));
            }
            return false;
        }
        timestamps.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_policy_always_acquires() {
        let limiter = RateLimiter::new(RateLimitPolicy { max_requests: 0, per_seconds: 1, cooldown_seconds: 0 });
        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn breach_triggers_cooldown() {
        let limiter = RateLimiter::new(RateLimitPolicy { max_requests: 2, per_seconds: 60, cooldown_seconds: 30 });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
