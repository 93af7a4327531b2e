//! Execution Adapter capability contract (spec §4.2/§4.5), grounded on the
//! teacher's `vault/execution.rs::ExecutionAdapter` trait shape and
//! `original_source/src/hyperliquid/execution/adapters/binance.py` for the concrete stub.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{RateLimitSection, RetrySection};
use crate::ratelimit::{RateLimitPolicy, RateLimiter};
use crate::retry::RetryPolicy;
use crate::storage::db::OrderIntent;
use crate::types::{Px, Qty, Sym};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "SUBMITTED" => OrderStatus::Submitted,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "EXPIRED" => OrderStatus::Expired,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        }
    }

    /// Mirrors `_is_terminal_status(status, include_unknown)`.
    pub fn is_terminal(&self, include_unknown: bool) -> bool {
        match self {
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => true,
            OrderStatus::Unknown => include_unknown,
            OrderStatus::Submitted | OrderStatus::PartiallyFilled => false,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone)]
pub struct AdapterOrderState {
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: Qty,
    pub avg_price: Option<Px>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl AdapterOrderState {
    pub fn unknown(error_code: &str, error_message: impl Into<String>) -> Self {
        Self {
            exchange_order_id: None,
            status: OrderStatus::Unknown,
            filled_qty: Qty::default(),
            avg_price: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.into()),
        }
    }
}

/// Transport-level outcomes the TIF/UNKNOWN loops distinguish (spec §4.5
/// step 3: duplicate/timeout/rate-limit each map to a specific status).
#[derive(Debug)]
pub enum AdapterError {
    Duplicate,
    Timeout,
    RateLimited,
    NotImplemented,
    Other(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Duplicate => write!(f, "duplicate order"),
            AdapterError::Timeout => write!(f, "adapter timeout"),
            AdapterError::RateLimited => write!(f, "adapter rate limited"),
            AdapterError::NotImplemented => write!(f, "adapter not implemented"),
            AdapterError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Capability set an Execution Adapter may implement. `fetch_mark_price`
/// and `fetch_positions` are optional capabilities with `None` defaults
/// rather than a separate marker trait, matching the teacher's single
/// `ExecutionAdapter` trait in `vault/execution.rs`.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn execute(&self, intent: &OrderIntent) -> Result<AdapterOrderState, AdapterError>;
    async fn query_order(&self, intent: &OrderIntent) -> Result<AdapterOrderState, AdapterError>;
    async fn cancel_order(&self, intent: &OrderIntent) -> Result<AdapterOrderState, AdapterError>;

    async fn fetch_mark_price(&self, _symbol: &Sym) -> Option<Px> {
        None
    }

    async fn fetch_positions(&self) -> Option<HashMap<Sym, Qty>> {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceExecutionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_adapter_mode")]
    pub mode: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_adapter_mode() -> String {
    "stub".to_string()
}
fn default_base_url() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for BinanceExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_adapter_mode(),
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            rate_limit: RateLimitSection::default(),
            retry: RetrySection::default(),
        }
    }
}

/// Reference `ExecutionAdapter` implementation, grounded on
/// `BinanceExecutionAdapter` in `original_source/src/hyperliquid/execution/adapters/binance.py`.
/// Only `mode == "stub"` is implemented; any other mode signals
/// `AdapterError::NotImplemented`, matching the source's
/// `AdapterNotImplementedError` for real wire protocols (out of scope per
/// the Non-goals: "no bundled concrete exchange wire protocol").
pub struct BinanceExecutionAdapter {
    config: BinanceExecutionConfig,
    limiter: RateLimiter,
    retry_policy: RetryPolicy,
}

impl BinanceExecutionAdapter {
    pub fn new(config: BinanceExecutionConfig) -> Self {
        let limiter = RateLimiter::new(RateLimitPolicy::from(&config.rate_limit));
        let retry_policy = RetryPolicy::from(&config.retry);
        Self { config, limiter, retry_policy }
    }

    fn stub_reject(&self, error_code: &str, message: &str) -> AdapterOrderState {
        AdapterOrderState {
            exchange_order_id: None,
            status: OrderStatus::Rejected,
            filled_qty: Qty::default(),
            avg_price: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(message.to_string()),
        }
    }

    /// Bounded exponential backoff with jitter around the rate limiter
    /// (spec §4.2: retry is an adapter responsibility), grounded on
    /// `original_source/src/hyperliquid/execution/adapters/binance.py::RetryPolicy`.
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
            tracing::debug!(attempt, delay_ms = delay, "execution_adapter_rate_limited_retry");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ExecutionAdapter for BinanceExecutionAdapter {
    async fn execute(&self, intent: &OrderIntent) -> Result<AdapterOrderState, AdapterError> {
        if !self.config.enabled {
            return Ok(self.stub_reject("ADAPTER_DISABLED", "adapter disabled"));
        }
        if self.config.mode != "stub" {
            return Err(AdapterError::NotImplemented);
        }
        if !self.acquire_with_retry().await {
            return Ok(self.stub_reject("RATE_LIMITED", "rate limit breached"));
        }
        Ok(AdapterOrderState {
            exchange_order_id: Some(format!("stub-{}", intent.correlation_id)),
            status: OrderStatus::Submitted,
            filled_qty: Qty::default(),
            avg_price: None,
            error_code: None,
            error_message: None,
        })
    }

    async fn query_order(&self, intent: &OrderIntent) -> Result<AdapterOrderState, AdapterError> {
        if self.config.mode != "stub" {
            return Err(AdapterError::NotImplemented);
        }
        Ok(AdapterOrderState {
            exchange_order_id: Some(format!("stub-{}", intent.correlation_id)),
            status: OrderStatus::Filled,
            filled_qty: intent.qty,
            avg_price: intent.price,
            error_code: None,
            error_message: None,
        })
    }

    async fn cancel_order(&self, intent: &OrderIntent) -> Result<AdapterOrderState, AdapterError> {
        if self.config.mode != "stub" {
            return Err(AdapterError::NotImplemented);
        }
        Ok(AdapterOrderState {
            exchange_order_id: Some(format!("stub-{}", intent.correlation_id)),
            status: OrderStatus::Canceled,
            filled_qty: Qty::default(),
            avg_price: None,
            error_code: None,
            error_message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sym;

    fn sample_intent() -> OrderIntent {
        OrderIntent {
            correlation_id: "hl-a-0-BTC".to_string(),
            client_order_id: None,
            symbol: Sym::new("BTC"),
            side: "BUY".to_string(),
            order_type: "MARKET".to_string(),
            qty: "1.0".parse().unwrap(),
            price: None,
            reduce_only: false,
            time_in_force: "IOC".to_string(),
            is_replay: false,
            strategy_version: "v1".to_string(),
            risk_notes: None,
            contract_version: "1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn disabled_adapter_rejects() {
        let adapter = BinanceExecutionAdapter::new(BinanceExecutionConfig::default());
        let result = adapter.execute(&sample_intent()).await.unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(result.error_code.as_deref(), Some("ADAPTER_DISABLED"));
    }

    #[tokio::test]
    async fn enabled_stub_submits() {
        let mut config = BinanceExecutionConfig::default();
        config.enabled = true;
        let adapter = BinanceExecutionAdapter::new(config);
        let result = adapter.execute(&sample_intent()).await.unwrap();
        assert_eq!(result.status, OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn non_stub_mode_is_not_implemented() {
        let mut config = BinanceExecutionConfig::default();
        config.enabled = true;
        config.mode = "live".to_string();
        let adapter = BinanceExecutionAdapter::new(config);
        let result = adapter.execute(&sample_intent()).await;
        assert!(matches!(result, Err(AdapterError::NotImplemented)));
    }

    #[tokio::test]
    async fn rate_limited_submit_retries_then_exhausts_budget() {
        let mut config = BinanceExecutionConfig::default();
        config.enabled = true;
        config.rate_limit = crate::config::RateLimitSection { max_requests: 1, per_seconds: 60, cooldown_seconds: 60 };
        config.retry = crate::config::RetrySection { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 1, jitter_ms: 0 };
        let adapter = BinanceExecutionAdapter::new(config);

        // Exhaust the window with a direct acquire so the adapter's own
        // submit has nothing left and must fall through its retry budget.
        assert!(adapter.limiter.try_acquire());

        let result = adapter.execute(&sample_intent()).await.unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(result.error_code.as_deref(), Some("RATE_LIMITED"));
    }
}
