//! Ingest Adapter capability contract (spec §4.2), grounded on
//! `original_source/src/hyperliquid/ingest/adapters/hyperliquid.py::HyperliquidIngestAdapter`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::HyperliquidIngestSection;
use crate::ratelimit::{RateLimitPolicy, RateLimiter};
use crate::retry::RetryPolicy;
use crate::types::{Ms, Qty, Sym};

#[derive(Debug, Clone)]
pub struct RawPositionEvent {
    pub symbol: Sym,
    pub tx_hash: String,
    pub event_index: i64,
    pub prev_target_net_position: Qty,
    pub next_target_net_position: Qty,
    pub is_replay: bool,
    pub timestamp_ms: Option<Ms>,
    pub action_type: Option<String>,
    pub open_component: Option<Qty>,
    pub close_component: Option<Qty>,
}

#[derive(Debug)]
pub enum IngestAdapterError {
    Timeout,
    RateLimited,
    NotImplemented,
    Other(String),
}

impl std::fmt::Display for IngestAdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestAdapterError::Timeout => write!(f, "ingest adapter timeout"),
            IngestAdapterError::RateLimited => write!(f, "ingest adapter rate limited"),
            IngestAdapterError::NotImplemented => write!(f, "ingest adapter not implemented"),
            IngestAdapterError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Capability set: `fetch_backfill`/`poll_live`/`close` (spec §4.2).
#[async_trait]
pub trait IngestAdapter: Send + Sync {
    async fn fetch_backfill(&self, since_ms: Ms, until_ms: Ms) -> Result<Vec<RawPositionEvent>, IngestAdapterError>;
    async fn poll_live(&self, since_ms: Ms) -> Result<Vec<RawPositionEvent>, IngestAdapterError>;
    async fn close(&self) {}
}

/// Reference implementation grounded on `HyperliquidIngestAdapter`. Only
/// `mode == "stub"` is wired; real REST/WS transports are out of scope
/// (Non-goals: "no bundled concrete exchange wire protocol" beyond the one
/// reference pair needed to exercise the trait).
pub struct HyperliquidIngestAdapter {
    config: HyperliquidIngestSection,
    limiter: RateLimiter,
    retry_policy: RetryPolicy,
    stub_events: Mutex<Vec<RawPositionEvent>>,
}

impl HyperliquidIngestAdapter {
    pub fn new(config: HyperliquidIngestSection, stub_events: Vec<RawPositionEvent>) -> Self {
        let limiter = RateLimiter::new(RateLimitPolicy::from(&config.rate_limit));
        let retry_policy = RetryPolicy::from(&config.retry);
        Self { config, limiter, retry_policy, stub_events: Mutex::new(stub_events) }
    }

    /// Bounded exponential backoff with jitter around the rate limiter
    /// (spec §4.2: retry is an adapter responsibility), grounded on
    /// `original_source/src/hyperliquid/ingest/adapters/hyperliquid.py::RetryPolicy`.
    /// Returns `true` once a permit is acquired, `false` if the retry
    /// budget is exhausted first.
    async fn acquire_with_retry(&self) -> bool {
        let mut attempt = 1;
        loop {
            if self.limiter.try_acquire() {
                return true;
            }
            if !self.retry_policy.should_retry(attempt) {
                return false;
            }
            let delay = self.retry_policy.next_delay_ms(attempt);
            tracing::debug!(attempt, delay_ms = delay, "ingest_adapter_rate_limited_retry");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    async fn filter_stub_events(&self, since_ms: Ms, until_ms: Option<Ms>, now_ms: Ms) -> Vec<RawPositionEvent> {
        let events = self.stub_events.lock().await;
        events
            .iter()
            .filter_map(|event| {
                let timestamp_ms = event.timestamp_ms.unwrap_or(now_ms);
                if timestamp_ms < since_ms {
                    return None;
                }
                if let Some(until_ms) = until_ms {
                    if timestamp_ms > until_ms {
                        return None;
                    }
                }
                let mut event = event.clone();
                event.timestamp_ms = Some(timestamp_ms);
                Some(event)
            })
            .collect()
    }
}

#[async_trait]
impl IngestAdapter for HyperliquidIngestAdapter {
    async fn fetch_backfill(&self, since_ms: Ms, until_ms: Ms) -> Result<Vec<RawPositionEvent>, IngestAdapterError> {
        if !self.config.enabled {
            return Ok(vec![]);
        }
        if self.config.mode != "stub" {
            return Err(IngestAdapterError::NotImplemented);
        }
        if !self.acquire_with_retry().await {
            return Ok(vec![]);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(self.filter_stub_events(since_ms, Some(until_ms), now_ms).await)
    }

    async fn poll_live(&self, since_ms: Ms) -> Result<Vec<RawPositionEvent>, IngestAdapterError> {
        if !self.config.enabled {
            return Ok(vec![]);
        }
        if self.config.mode != "stub" {
            return Err(IngestAdapterError::NotImplemented);
        }
        if !self.acquire_with_retry().await {
            return Ok(vec![]);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(self.filter_stub_events(since_ms, None, now_ms).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: Ms) -> RawPositionEvent {
        RawPositionEvent {
            symbol: Sym::new("BTC"),
            tx_hash: "0xabc".to_string(),
            event_index: 0,
            prev_target_net_position: Qty::default(),
            next_target_net_position: "1.0".parse().unwrap(),
            is_replay: false,
            timestamp_ms: Some(ts),
            action_type: None,
            open_component: None,
            close_component: None,
        }
    }

    #[tokio::test]
    async fn disabled_adapter_returns_nothing() {
        let adapter = HyperliquidIngestAdapter::new(HyperliquidIngestSection::default(), vec![event(1_000)]);
        let events = adapter.fetch_backfill(0, 2_000).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn enabled_stub_filters_by_window() {
        let mut config = HyperliquidIngestSection::default();
        config.enabled = true;
        let adapter = HyperliquidIngestAdapter::new(config, vec![event(500), event(1_500)]);
        let events = adapter.fetch_backfill(1_000, 2_000).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp_ms, Some(1_500));
    }

    #[tokio::test]
    async fn rate_limited_backfill_retries_then_gives_up_empty() {
        let mut config = HyperliquidIngestSection::default();
        config.enabled = true;
        config.rate_limit = crate::config::RateLimitSection { max_requests: 1, per_seconds: 60, cooldown_seconds: 60 };
        config.retry = crate::config::RetrySection { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 1, jitter_ms: 0 };
        let adapter = HyperliquidIngestAdapter::new(config, vec![event(500)]);

        assert!(adapter.limiter.try_acquire());

        let events = adapter.fetch_backfill(0, 2_000).await.unwrap();
        assert!(events.is_empty());
    }
}
