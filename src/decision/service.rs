//! The decision pipeline (spec §4.4), grounded on
//! `original_source/src/hyperliquid/decision/service.py` and `decision/strategy.py`, unified
//! into the single ordered pipeline spec.md lays out (the source splits
//! "basic" decisioning from strategy sizing/slippage/filters; here they are
//! one pass, matching this crate's single `DecisionService`).

use std::collections::HashSet;
use std::sync::Mutex;

use std::sync::Arc;

use crate::config::DecisionSection;
use crate::decision::sizing::{size_qty, SizingOutcome};
use crate::decision::types::{validate_filters, DecisionInputs, FiltersProvider, PriceProvider};
use crate::errors::{decision_reasons as reasons, PipelineError};
use crate::metrics::MetricsSink;
use crate::storage::db::OrderIntent;
use crate::safety::SafetyMode;
use crate::types::{correlation_id, ActionType, Ms, PositionDeltaEvent, Qty};

pub struct DecisionService {
    config: DecisionSection,
    price_provider: Option<Box<dyn PriceProvider>>,
    filters_provider: Option<Box<dyn FiltersProvider>>,
    /// Dedup guard for the `MISSING_REFERENCE_PRICE` risk note (spec §4.4
    /// step 7: "add risk note ... (deduped)").
    missing_price_notes_seen: Mutex<HashSet<String>>,
    metrics: Option<Arc<MetricsSink>>,
}

pub struct DraftIntent {
    pub correlation_id: String,
    pub symbol: crate::types::Sym,
    pub side: &'static str,
    pub qty: Qty,
    pub reduce_only: bool,
    pub risk_notes: Option<String>,
}

impl DecisionService {
    pub fn new(
        config: DecisionSection,
        price_provider: Option<Box<dyn PriceProvider>>,
        filters_provider: Option<Box<dyn FiltersProvider>>,
    ) -> Self {
        Self {
            config,
            price_provider,
            filters_provider,
            missing_price_notes_seen: Mutex::new(HashSet::new()),
            metrics: None,
        }
    }

    /// Attaches a metrics sink for `decision_rejects_total` (spec §6:
    /// "additional metrics are allowed").
    pub fn with_metrics(mut self, metrics: Arc<MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the full pipeline. Returns `Ok(vec![])` for any soft reject
    /// (logged via `tracing::warn`, never propagated); only a contract
    /// version mismatch propagates as an `Err`, per spec §7.
    pub async fn decide(
        &self,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
        now_ms: Ms,
    ) -> Result<Vec<OrderIntent>, PipelineError> {
        crate::types::assert_contract_version(&event.contract_version)?;

        if !self.passes_freshness_gate(event, now_ms) {
            return Ok(vec![]);
        }

        if inputs.safety_mode == SafetyMode::Halt {
            return Ok(vec![]);
        }

        if self.config.blacklist_symbols.iter().any(|s| s == event.symbol.as_str()) {
            self.log_reject(reasons::BLACKLISTED_SYMBOL, event);
            return Ok(vec![]);
        }

        let drafts = match self.expand_action(event, inputs) {
            Ok(drafts) => drafts,
            Err(reason) => {
                self.log_reject(reason, event);
                return Ok(vec![]);
            }
        };
        if drafts.is_empty() {
            return Ok(vec![]);
        }

        let mut drafts = self.apply_slippage_guard(drafts, event, inputs).await;
        drafts = self.apply_symbol_filters(drafts).await;

        if event.is_replay && self.config.replay_policy == "close_only" {
            drafts.retain(|d| d.reduce_only);
        }
        if inputs.safety_mode == SafetyMode::ArmedSafe {
            drafts.retain(|d| d.reduce_only);
        }

        let intents = drafts
            .into_iter()
            .map(|d| OrderIntent {
                correlation_id: d.correlation_id,
                client_order_id: None,
                symbol: d.symbol,
                side: d.side.to_string(),
                order_type: "MARKET".to_string(),
                qty: d.qty,
                price: None,
                reduce_only: d.reduce_only,
                time_in_force: "IOC".to_string(),
                is_replay: event.is_replay,
                strategy_version: self.config.strategy_version.clone(),
                risk_notes: d.risk_notes,
                contract_version: crate::types::CONTRACT_VERSION.to_string(),
            })
            .collect();
        Ok(intents)
    }

    fn passes_freshness_gate(&self, event: &PositionDeltaEvent, now_ms: Ms) -> bool {
        if self.config.max_stale_ms <= 0 && self.config.max_future_ms <= 0 {
            return true;
        }
        if event.timestamp_ms <= 0 {
            self.log_reject(reasons::MISSING_TIMESTAMP_MS, event);
            return false;
        }
        let staleness_ms = now_ms - event.timestamp_ms;
        if self.config.max_future_ms >= 0 && staleness_ms < -self.config.max_future_ms {
            self.log_reject(reasons::FUTURE_EVENT, event);
            return false;
        }
        if self.config.max_stale_ms > 0 && staleness_ms > self.config.max_stale_ms {
            self.log_reject(reasons::STALE_EVENT, event);
            return false;
        }
        true
    }

    /// Step 5 (action expansion) fused with step 6 (sizing): builds the
    /// 1-or-2 draft intents spec §4.4 describes, sizing each non-close leg.
    fn expand_action(
        &self,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
    ) -> Result<Vec<DraftIntent>, &'static str> {
        match event.action_type {
            ActionType::Flip => self.expand_flip(event, inputs),
            ActionType::Decrease => {
                let (close_qty, reason) = self.compute_close_qty(event, inputs);
                if close_qty <= Qty::default() {
                    return Err(reason.unwrap_or(reasons::NO_CLOSABLE_QTY));
                }
                let side = if event.prev_target_net_position > Qty::default() { "SELL" } else { "BUY" };
                Ok(vec![self.build_draft(event, side, close_qty, true, None, None)])
            }
            ActionType::Increase => {
                let base_qty = event.delta_target_net_position.abs();
                let qty = self.sized_qty(base_qty)?;
                let side = if event.delta_target_net_position > Qty::default() { "BUY" } else { "SELL" };
                Ok(vec![self.build_draft(event, side, qty, false, None, None)])
            }
        }
    }

    fn expand_flip(
        &self,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
    ) -> Result<Vec<DraftIntent>, &'static str> {
        let mut drafts = Vec::new();

        let close_component = event.close_component.unwrap_or_default();
        if close_component > Qty::default() {
            let (close_qty, reason) = self.compute_close_qty(event, inputs);
            if close_qty <= Qty::default() {
                return Err(reason.unwrap_or(reasons::NO_CLOSABLE_QTY));
            }
            let side = if event.prev_target_net_position > Qty::default() { "SELL" } else { "BUY" };
            drafts.push(self.build_draft(event, side, close_qty, true, Some("close"), None));
        }

        let open_component = event.open_component.unwrap_or_default();
        if open_component > Qty::default() {
            let qty = self.sized_qty(open_component.abs())?;
            let side = if event.next_target_net_position > Qty::default() { "BUY" } else { "SELL" };
            drafts.push(self.build_draft(event, side, qty, false, Some("open"), None));
        }
        Ok(drafts)
    }

    fn compute_close_qty(&self, event: &PositionDeltaEvent, inputs: &DecisionInputs) -> (Qty, Option<&'static str>) {
        let Some(local) = inputs.local_current_position else {
            return (Qty::default(), Some(reasons::MISSING_LOCAL_POSITION));
        };
        let Some(closable) = inputs.closable_qty else {
            return (Qty::default(), Some(reasons::MISSING_CLOSABLE_QTY));
        };
        if event.prev_target_net_position == Qty::default() {
            return (Qty::default(), Some(reasons::NO_CLOSABLE_QTY));
        }
        let epsilon: Qty = "0.000000001".parse().unwrap();
        let prev_abs = event.prev_target_net_position.abs().max(epsilon);
        let target_ratio = (event.delta_target_net_position.abs() / prev_abs).min(Qty::ONE);
        let local_close_qty = local.abs() * target_ratio;
        (local_close_qty.min(closable.abs()), None)
    }

    fn sized_qty(&self, base_qty: Qty) -> Result<Qty, &'static str> {
        match size_qty(base_qty, &self.config.sizing) {
            SizingOutcome::Reject(reason) => Err(reason),
            SizingOutcome::Qty(qty) => {
                if let Some(max_qty) = self.config.max_qty {
                    let max_qty = Qty::try_from(max_qty).unwrap_or_default();
                    if qty > max_qty {
                        return Err(reasons::MAX_QTY_EXCEEDED);
                    }
                }
                Ok(qty)
            }
        }
    }

    fn build_draft(
        &self,
        event: &PositionDeltaEvent,
        side: &'static str,
        qty: Qty,
        reduce_only: bool,
        suffix: Option<&str>,
        risk_notes: Option<String>,
    ) -> DraftIntent {
        DraftIntent {
            correlation_id: correlation_id(&event.tx_hash, event.event_index, &event.symbol, suffix),
            symbol: event.symbol.clone(),
            side,
            qty,
            reduce_only,
            risk_notes,
        }
    }

    /// Step 7: slippage guard, applied only to non-reduce-only legs.
    async fn apply_slippage_guard(
        &self,
        drafts: Vec<DraftIntent>,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
    ) -> Vec<DraftIntent> {
        if self.config.slippage_cap_pct <= 0.0 {
            return drafts;
        }
        let mut kept = Vec::with_capacity(drafts.len());
        for mut draft in drafts {
            if draft.reduce_only {
                kept.push(draft);
                continue;
            }
            match self.check_slippage(event, inputs).await {
                Ok(note) => {
                    draft.risk_notes = note;
                    kept.push(draft);
                }
                Err(reason) => {
                    self.log_reject(reason, event);
                }
            }
        }
        kept
    }

    async fn check_slippage(
        &self,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
    ) -> Result<Option<String>, &'static str> {
        let Some(provider) = &self.price_provider else {
            return self.missing_price_policy(event);
        };
        let current = provider.current_price(&event.symbol).await;
        let (current, used_fallback) = match current {
            Some(price) => (Some(price), false),
            None if self.config.price_fallback_enabled => {
                (provider.fallback_price(&event.symbol).await, true)
            }
            None => (None, false),
        };
        let Some(current) = current else {
            return self.missing_price_policy(event);
        };
        let Some(expected) = &inputs.expected_price else {
            return self.missing_price_policy(event);
        };
        if self.config.expected_price_max_stale_ms > 0 {
            let age = event.timestamp_ms - expected.timestamp_ms;
            if age.abs() > self.config.expected_price_max_stale_ms {
                return self.missing_price_policy(event);
            }
        }
        if expected.price == Qty::default() {
            return self.missing_price_policy(event);
        }
        let cap = Qty::try_from(self.config.slippage_cap_pct).unwrap_or_default();
        let deviation = (current - expected.price).abs() / expected.price;
        if deviation > cap {
            return Err(reasons::SLIPPAGE_EXCEEDED);
        }
        Ok(used_fallback.then(|| "PRICE_FALLBACK_USED".to_string()))
    }

    fn missing_price_policy(&self, event: &PositionDeltaEvent) -> Result<Option<String>, &'static str> {
        if self.config.price_failure_policy == "reject" {
            return Err(reasons::MISSING_REFERENCE_PRICE);
        }
        let key = event.symbol.as_str().to_string();
        let mut seen = self.missing_price_notes_seen.lock().unwrap();
        if seen.insert(key) {
            Ok(Some("MISSING_REFERENCE_PRICE".to_string()))
        } else {
            Ok(None)
        }
    }

    /// Step 8: symbol filters.
    async fn apply_symbol_filters(&self, drafts: Vec<DraftIntent>) -> Vec<DraftIntent> {
        if !self.config.filters_enabled {
            return drafts;
        }
        let mut kept = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let Some(provider) = &self.filters_provider else {
                if self.config.filters_failure_policy == "reject" {
                    tracing::warn!(reason = reasons::FILTERS_UNAVAILABLE, symbol = %draft.symbol, "decision_reject");
                    continue;
                }
                kept.push(draft);
                continue;
            };
            match provider.filters_for(&draft.symbol).await {
                Some(filters) => match validate_filters(draft.qty, None, &filters) {
                    Ok(()) => kept.push(draft),
                    Err(violation) => {
                        tracing::warn!(reason = violation.reason_code(), symbol = %draft.symbol, "decision_reject");
                    }
                },
                None if self.config.filters_failure_policy == "reject" => {
                    tracing::warn!(reason = reasons::FILTERS_UNAVAILABLE, symbol = %draft.symbol, "decision_reject");
                }
                None => kept.push(draft),
            }
        }
        kept
    }

    fn log_reject(&self, reason: &str, event: &PositionDeltaEvent) {
        tracing::warn!(
            reason,
            symbol = %event.symbol,
            tx_hash = %event.tx_hash,
            event_index = event.event_index,
            action_type = event.action_type.as_str(),
            is_replay = event.is_replay,
            "decision_reject"
        );
        if let Some(metrics) = &self.metrics {
            metrics.decision_reject(event.timestamp_ms, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sym;

    fn base_config() -> DecisionSection {
        DecisionSection {
            strategy_version: "v1".to_string(),
            max_stale_ms: 0,
            max_future_ms: 2_000,
            expected_price_max_stale_ms: 0,
            replay_policy: "close_only".to_string(),
            price_fallback_enabled: false,
            price_failure_policy: "allow_without_price".to_string(),
            filters_enabled: false,
            filters_failure_policy: "allow_without_filters".to_string(),
            blacklist_symbols: vec![],
            slippage_cap_pct: 0.0,
            max_qty: None,
            sizing: crate::config::SizingSection::default(),
        }
    }

    fn increase_event() -> PositionDeltaEvent {
        PositionDeltaEvent {
            symbol: Sym::new("BTC"),
            timestamp_ms: 1_000,
            tx_hash: "0xabc".to_string(),
            event_index: 0,
            is_replay: false,
            prev_target_net_position: Qty::default(),
            next_target_net_position: "1.0".parse().unwrap(),
            delta_target_net_position: "1.0".parse().unwrap(),
            action_type: ActionType::Increase,
            open_component: None,
            close_component: None,
            contract_version: "1.0".to_string(),
        }
    }

    fn inputs(mode: SafetyMode) -> DecisionInputs {
        DecisionInputs {
            safety_mode: mode,
            local_current_position: None,
            closable_qty: None,
            expected_price: None,
        }
    }

    #[tokio::test]
    async fn halt_yields_no_intents() {
        let service = DecisionService::new(base_config(), None, None);
        let intents = service.decide(&increase_event(), &inputs(SafetyMode::Halt), 1_000).await.unwrap();
        assert!(intents.is_empty());
    }

    #[tokio::test]
    async fn increase_emits_single_intent_with_proportional_sizing() {
        let service = DecisionService::new(base_config(), None, None);
        let intents = service.decide(&increase_event(), &inputs(SafetyMode::ArmedLive), 1_000).await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, "BUY");
        assert!(!intents[0].reduce_only);
        assert_eq!(intents[0].qty, "1.0".parse().unwrap());
    }

    #[tokio::test]
    async fn armed_safe_drops_non_reduce_only() {
        let service = DecisionService::new(base_config(), None, None);
        let intents = service.decide(&increase_event(), &inputs(SafetyMode::ArmedSafe), 1_000).await.unwrap();
        assert!(intents.is_empty());
    }

    #[tokio::test]
    async fn blacklist_rejects_event() {
        let mut config = base_config();
        config.blacklist_symbols = vec!["BTC".to_string()];
        let service = DecisionService::new(config, None, None);
        let intents = service.decide(&increase_event(), &inputs(SafetyMode::ArmedLive), 1_000).await.unwrap();
        assert!(intents.is_empty());
    }

    #[tokio::test]
    async fn flip_emits_close_then_open_in_order() {
        let mut event = increase_event();
        event.action_type = ActionType::Flip;
        event.prev_target_net_position = "1.0".parse().unwrap();
        event.next_target_net_position = "-0.5".parse().unwrap();
        event.delta_target_net_position = "-1.5".parse().unwrap();
        event.close_component = Some("1.0".parse().unwrap());
        event.open_component = Some("0.5".parse().unwrap());

        let mut decision_inputs = inputs(SafetyMode::ArmedLive);
        decision_inputs.local_current_position = Some("1.0".parse().unwrap());
        decision_inputs.closable_qty = Some("1.0".parse().unwrap());

        let service = DecisionService::new(base_config(), None, None);
        let intents = service.decide(&event, &decision_inputs, 1_000).await.unwrap();
        assert_eq!(intents.len(), 2);
        assert!(intents[0].correlation_id.ends_with("-close"));
        assert!(intents[0].reduce_only);
        assert!(intents[1].correlation_id.ends_with("-open"));
        assert!(!intents[1].reduce_only);
    }

    #[tokio::test]
    async fn contract_mismatch_propagates_as_error() {
        let mut event = increase_event();
        event.contract_version = "2.0".to_string();
        let service = DecisionService::new(base_config(), None, None);
        let result = service.decide(&event, &inputs(SafetyMode::ArmedLive), 1_000).await;
        assert!(matches!(result, Err(PipelineError::ContractMismatch { .. })));
    }
}
