//! The order-lifecycle engine (spec §4.5), grounded on
//! `original_source/src/hyperliquid/execution/service.py::ExecutionService` —
//! `execute()` / `_handle_limit_tif()` / `_resolve_unknown()` /
//! `_is_terminal_status()`. Market fallback (step 5) is not present in the
//! source and is built fresh here in its idiom, reusing `is_terminal`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ExecutionSection;
use crate::execution::adapter::{AdapterError, AdapterOrderState, ExecutionAdapter, OrderStatus};
use crate::execution::client_order_id::{build_client_order_id, generate_nonce};
use crate::metrics::MetricsSink;
use crate::safety::{SafetyMode, SafetyService};
use crate::storage::db::{OrderIntent, OrderResult};
use crate::storage::Storage;
use crate::types::{Ms, Px, Qty};

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub struct ExecutionService {
    config: ExecutionSection,
    adapter: Box<dyn ExecutionAdapter>,
    storage: Storage,
    safety: Arc<SafetyService>,
    metrics: Option<Arc<MetricsSink>>,
}

impl ExecutionService {
    pub fn new(
        config: ExecutionSection,
        adapter: Box<dyn ExecutionAdapter>,
        storage: Storage,
        safety: Arc<SafetyService>,
    ) -> Self {
        Self { config, adapter, storage, safety, metrics: None }
    }

    /// Attaches a metrics sink for `execution_retry_budget_exhausted_total`
    /// (spec §6: "additional metrics are allowed").
    pub fn with_metrics(mut self, metrics: Arc<MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Drives one intent through the full lifecycle (spec §4.5). `now_ms`
    /// is the tick's logical time; wall-clock reads during TIF/UNKNOWN
    /// suspension are taken fresh since those loops observe real elapsed
    /// time across sleeps.
    pub async fn execute(&self, mut intent: OrderIntent, now_ms: Ms) -> anyhow::Result<OrderResult> {
        if intent.client_order_id.is_none() {
            let nonce = generate_nonce();
            intent.client_order_id =
                build_client_order_id(&intent.correlation_id, &intent.symbol, &nonce, self.config.client_order_id_max_len);
        }
        let intent = self.storage.ensure_intent(intent, now_ms).await?;

        if let Some(existing) = self.storage.get_result(&intent.correlation_id).await? {
            match OrderStatus::parse(&existing.status) {
                OrderStatus::Filled | OrderStatus::Submitted | OrderStatus::PartiallyFilled => return Ok(existing),
                OrderStatus::Unknown => {
                    let state = result_to_state(&existing);
                    let resolved = self.resolve_unknown_state(&intent, state).await;
                    let result = self.state_to_result(&intent, &resolved, existing.created_at_ms);
                    self.storage.upsert_result(&result, now_ms).await?;
                    return Ok(result);
                }
                OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => return Ok(existing),
            }
        }

        if let Err(e) = self.safety.pre_execution_check(&intent).await {
            let state = AdapterOrderState {
                exchange_order_id: None,
                status: OrderStatus::Rejected,
                filled_qty: Qty::default(),
                avg_price: None,
                error_code: Some("SAFETY_REJECTED".to_string()),
                error_message: Some(e.to_string()),
            };
            let result = self.state_to_result(&intent, &state, now_ms);
            self.storage.upsert_result(&result, now_ms).await?;
            return Ok(result);
        }

        let mut state = self.submit(&intent).await;

        if intent.order_type == "LIMIT" && self.config.tif_seconds > 0 {
            state = self.run_tif_loop(&intent, state).await;
            if self.config.market_fallback_enabled {
                state = self.apply_market_fallback(&intent, state).await;
            }
        }

        if state.status == OrderStatus::Unknown {
            state = self.resolve_unknown_state(&intent, state).await;
        }

        let result = self.state_to_result(&intent, &state, now_ms);
        self.storage.upsert_result(&result, now_ms).await?;
        Ok(result)
    }

    /// Exchange-side positions for reconciliation, when the adapter exposes
    /// that optional capability (spec §4.2).
    pub async fn fetch_positions(&self) -> Option<std::collections::HashMap<crate::types::Sym, Qty>> {
        self.adapter.fetch_positions().await
    }

    async fn submit(&self, intent: &OrderIntent) -> AdapterOrderState {
        match self.adapter.execute(intent).await {
            Ok(state) => state,
            Err(AdapterError::Duplicate) => match self.adapter.query_order(intent).await {
                Ok(state) => state,
                Err(e) => AdapterOrderState::unknown("EXECUTION_ERROR", e.to_string()),
            },
            Err(AdapterError::Timeout) => AdapterOrderState::unknown("TIMEOUT", "adapter request timed out"),
            Err(AdapterError::RateLimited) => AdapterOrderState::unknown("RATE_LIMITED", "adapter rate limited"),
            Err(e) => AdapterOrderState::unknown("EXECUTION_ERROR", e.to_string()),
        }
    }

    /// Step 4: poll while open, cancel at the TIF deadline, re-query if the
    /// cancel itself lands in a non-terminal state.
    async fn run_tif_loop(&self, intent: &OrderIntent, mut state: AdapterOrderState) -> AdapterOrderState {
        let deadline = now_ms() + (self.config.tif_seconds as i64) * 1_000;
        while state.status.is_open() {
            let remaining = deadline - now_ms();
            if remaining <= 0 {
                break;
            }
            let poll_ms = (self.config.order_poll_interval_sec * 1_000).min(remaining as u64);
            tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            match self.adapter.query_order(intent).await {
                Ok(next) => {
                    if next.status.is_terminal(false) {
                        return next;
                    }
                    state = next;
                }
                Err(e) => {
                    return AdapterOrderState {
                        exchange_order_id: state.exchange_order_id.clone(),
                        status: OrderStatus::Unknown,
                        filled_qty: state.filled_qty,
                        avg_price: state.avg_price,
                        error_code: Some("EXECUTION_ERROR".to_string()),
                        error_message: Some(e.to_string()),
                    };
                }
            }
        }
        if !state.status.is_open() {
            return state;
        }
        match self.adapter.cancel_order(intent).await {
            Ok(cancel_state) if cancel_state.status.is_terminal(true) => cancel_state,
            Ok(_) => match self.adapter.query_order(intent).await {
                Ok(requeried) => requeried,
                Err(e) => AdapterOrderState::unknown("EXECUTION_ERROR", e.to_string()),
            },
            Err(e) => AdapterOrderState::unknown("EXECUTION_ERROR", e.to_string()),
        }
    }

    /// Step 5: synthesize a MARKET order for the unfilled remainder after a
    /// TIF cancel, gated by a slippage check against the adapter's mark
    /// price. Not present in the source; built fresh per spec.md.
    async fn apply_market_fallback(&self, intent: &OrderIntent, state: AdapterOrderState) -> AdapterOrderState {
        if state.status != OrderStatus::Canceled {
            return state;
        }
        let remaining_qty = intent.qty - state.filled_qty;
        let threshold = Qty::try_from(self.config.market_fallback_threshold_pct).unwrap_or_default() * intent.qty;
        if remaining_qty <= threshold {
            return state;
        }
        let Some(intent_price) = intent.price else {
            return state;
        };
        let Some(mark_price) = self.adapter.fetch_mark_price(&intent.symbol).await else {
            return state;
        };
        let cap = Qty::try_from(self.config.market_slippage_cap_pct).unwrap_or_default();
        let deviation = (mark_price - intent_price).abs() / intent_price;
        if deviation > cap {
            return AdapterOrderState {
                exchange_order_id: state.exchange_order_id,
                status: OrderStatus::Rejected,
                filled_qty: state.filled_qty,
                avg_price: state.avg_price,
                error_code: Some("SLIPPAGE_EXCEEDED".to_string()),
                error_message: Some("market fallback mark price deviation exceeds cap".to_string()),
            };
        }

        let fallback_intent = OrderIntent {
            correlation_id: format!("{}-fallback", intent.correlation_id),
            client_order_id: None,
            order_type: "MARKET".to_string(),
            qty: remaining_qty,
            price: None,
            ..intent.clone()
        };
        let fallback_state = self.submit(&fallback_intent).await;

        let filled_qty_total = state.filled_qty + fallback_state.filled_qty;
        let avg_price = weighted_avg_price(
            state.filled_qty,
            state.avg_price,
            fallback_state.filled_qty,
            fallback_state.avg_price,
        );
        let status = if filled_qty_total >= intent.qty {
            OrderStatus::Filled
        } else if filled_qty_total > Qty::default() {
            OrderStatus::PartiallyFilled
        } else {
            state.status
        };
        AdapterOrderState {
            exchange_order_id: fallback_state.exchange_order_id.or(state.exchange_order_id),
            status,
            filled_qty: filled_qty_total,
            avg_price,
            error_code: None,
            error_message: None,
        }
    }

    /// Step 6: poll `query_order` up to `retry_budget_max_attempts` times
    /// within `retry_budget_window_sec`; on exhaustion, push Safety through
    /// the injected updater (here: the `SafetyService` itself, per §5's
    /// "writes go only through the Safety service").
    async fn resolve_unknown_state(&self, intent: &OrderIntent, state: AdapterOrderState) -> AdapterOrderState {
        if self.config.retry_budget_max_attempts == 0 {
            self.exhaust_retry_budget(intent).await;
            return retry_budget_exceeded(state);
        }
        let deadline = now_ms() + (self.config.retry_budget_window_sec as i64) * 1_000;
        let mut attempt = 0u32;
        while attempt < self.config.retry_budget_max_attempts && now_ms() < deadline {
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(self.config.unknown_poll_interval_sec)).await;
            if let Ok(next) = self.adapter.query_order(intent).await {
                if next.status.is_terminal(false) {
                    return next;
                }
            }
        }
        self.exhaust_retry_budget(intent).await;
        retry_budget_exceeded(state)
    }

    async fn exhaust_retry_budget(&self, intent: &OrderIntent) {
        let mode = SafetyMode::parse(&self.config.retry_budget_mode);
        let message = format!("execution retry budget exceeded for {}", intent.correlation_id);
        self.safety
            .set_safety_state(mode, "EXECUTION_RETRY_BUDGET_EXCEEDED", &message, now_ms())
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.execution_retry_budget_exhausted(now_ms(), &intent.correlation_id);
        }
    }

    fn state_to_result(&self, intent: &OrderIntent, state: &AdapterOrderState, created_at_ms: Ms) -> OrderResult {
        OrderResult {
            correlation_id: intent.correlation_id.clone(),
            exchange_order_id: state.exchange_order_id.clone(),
            status: state.status.as_str().to_string(),
            filled_qty: state.filled_qty,
            avg_price: state.avg_price,
            error_code: state.error_code.clone(),
            error_message: state.error_message.clone(),
            contract_version: intent.contract_version.clone(),
            created_at_ms,
            updated_at_ms: created_at_ms,
        }
    }
}

fn retry_budget_exceeded(state: AdapterOrderState) -> AdapterOrderState {
    AdapterOrderState {
        exchange_order_id: state.exchange_order_id,
        status: OrderStatus::Unknown,
        filled_qty: state.filled_qty,
        avg_price: state.avg_price,
        error_code: Some("RETRY_BUDGET_EXCEEDED".to_string()),
        error_message: Some("execution retry budget exceeded".to_string()),
    }
}

fn result_to_state(result: &OrderResult) -> AdapterOrderState {
    AdapterOrderState {
        exchange_order_id: result.exchange_order_id.clone(),
        status: OrderStatus::parse(&result.status),
        filled_qty: result.filled_qty,
        avg_price: result.avg_price,
        error_code: result.error_code.clone(),
        error_message: result.error_message.clone(),
    }
}

/// Weighted average across the LIMIT leg and the MARKET fallback leg; keeps
/// the base price when the fallback leg has no average (spec §4.5 step 5).
fn weighted_avg_price(base_qty: Qty, base_price: Option<Px>, fallback_qty: Qty, fallback_price: Option<Px>) -> Option<Px> {
    match (base_price, fallback_price) {
        (None, None) => None,
        (Some(p), None) => Some(p),
        (None, Some(p)) => Some(p),
        (Some(bp), Some(fp)) => {
            let total = base_qty + fallback_qty;
            if total == Qty::default() {
                return Some(bp);
            }
            Some((bp * base_qty + fp * fallback_qty) / total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::adapter::{BinanceExecutionAdapter, BinanceExecutionConfig};
    use crate::types::Sym;

    fn config() -> ExecutionSection {
        let mut config = ExecutionSection::default();
        config.retry_budget_max_attempts = 1;
        config.unknown_poll_interval_sec = 0;
        config.retry_budget_window_sec = 1;
        config
    }

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

    async fn build_service() -> (ExecutionService, Arc<SafetyService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).unwrap();
        let safety = Arc::new(SafetyService::new(storage.clone()));
        let mut adapter_config = BinanceExecutionConfig::default();
        adapter_config.enabled = true;
        let adapter = Box::new(BinanceExecutionAdapter::new(adapter_config));
        let service = ExecutionService::new(config(), adapter, storage, safety.clone());
        (service, safety, dir)
    }

    #[tokio::test]
    async fn submit_persists_submitted_result() {
        let (service, _safety, _dir) = build_service().await;
        let result = service.execute(sample_intent(), 1_000).await.unwrap();
        assert_eq!(result.status, "SUBMITTED");
    }

    #[tokio::test]
    async fn idempotent_rerun_returns_same_result() {
        let (service, _safety, _dir) = build_service().await;
        let first = service.execute(sample_intent(), 1_000).await.unwrap();
        let second = service.execute(sample_intent(), 2_000).await.unwrap();
        assert_eq!(first.created_at_ms, second.created_at_ms);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn halt_rejects_before_submit() {
        let (service, safety, _dir) = build_service().await;
        safety.set_safety_state(SafetyMode::Halt, "TEST", "halted", 0).await;
        let result = service.execute(sample_intent(), 1_000).await.unwrap();
        assert_eq!(result.status, "REJECTED");
        assert_eq!(result.error_code.as_deref(), Some("SAFETY_REJECTED"));
    }

    #[test]
    fn weighted_avg_keeps_base_when_fallback_missing() {
        let avg = weighted_avg_price("1.0".parse().unwrap(), Some("10".parse().unwrap()), Qty::default(), None);
        assert_eq!(avg, Some("10".parse().unwrap()));
    }
}
