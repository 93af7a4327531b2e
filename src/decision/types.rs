//! Decision-local types: inputs, filters, and the price/filters provider
//! traits. Grounded on `original_source/src/hyperliquid/decision/types.py` and
//! `original_source/src/hyperliquid/common/filters.py`.

use async_trait::async_trait;

use crate::safety::SafetyMode;
use crate::types::{Ms, Px, Qty, Sym};

#[derive(Debug, Clone, Copy)]
pub struct ExpectedPrice {
    pub price: Px,
    pub timestamp_ms: Ms,
}

#[derive(Debug, Clone)]
pub struct DecisionInputs {
    pub safety_mode: SafetyMode,
    pub local_current_position: Option<Qty>,
    pub closable_qty: Option<Qty>,
    pub expected_price: Option<ExpectedPrice>,
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub min_qty: Qty,
    pub step_size: Qty,
    pub min_notional: Qty,
    pub tick_size: Qty,
}

fn is_multiple(value: Qty, step: Qty) -> bool {
    if step <= Qty::default() {
        return true;
    }
    (value % step) == Qty::default()
}

#[derive(Debug)]
pub enum FilterViolation {
    MinQty,
    StepSize,
    TickSize,
    MinNotional,
}

impl FilterViolation {
    pub fn reason_code(&self) -> &'static str {
        match self {
            FilterViolation::MinQty => crate::errors::decision_reasons::FILTER_MIN_QTY,
            FilterViolation::StepSize => crate::errors::decision_reasons::FILTER_STEP_SIZE,
            FilterViolation::TickSize => crate::errors::decision_reasons::FILTER_TICK_SIZE,
            FilterViolation::MinNotional => crate::errors::decision_reasons::FILTER_MIN_NOTIONAL,
        }
    }
}

/// Validates an intent's qty/price against the exchange's lot-size rules.
pub fn validate_filters(qty: Qty, price: Option<Px>, filters: &SymbolFilters) -> Result<(), FilterViolation> {
    if filters.min_qty > Qty::default() && qty < filters.min_qty {
        return Err(FilterViolation::MinQty);
    }
    if !is_multiple(qty, filters.step_size) {
        return Err(FilterViolation::StepSize);
    }
    let Some(price) = price else {
        return Ok(());
    };
    if !is_multiple(price, filters.tick_size) {
        return Err(FilterViolation::TickSize);
    }
    if filters.min_notional > Qty::default() && (price * qty) < filters.min_notional {
        return Err(FilterViolation::MinNotional);
    }
    Ok(())
}

#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn current_price(&self, symbol: &Sym) -> Option<Px>;
    async fn fallback_price(&self, _symbol: &Sym) -> Option<Px> {
        None
    }
}

#[async_trait]
pub trait FiltersProvider: Send + Sync {
    async fn filters_for(&self, symbol: &Sym) -> Option<SymbolFilters>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_below_min_qty() {
        let filters = SymbolFilters {
            min_qty: "1.0".parse().unwrap(),
            step_size: "0.1".parse().unwrap(),
            min_notional: Qty::default(),
            tick_size: Qty::default(),
        };
        let result = validate_filters("0.5".parse().unwrap(), None, &filters);
        assert!(matches!(result, Err(FilterViolation::MinQty)));
    }

    #[test]
    fn rejects_non_step_multiple() {
        let filters = SymbolFilters {
            min_qty: Qty::default(),
            step_size: "0.1".parse().unwrap(),
            min_notional: Qty::default(),
            tick_size: Qty::default(),
        };
        let result = validate_filters("0.55".parse().unwrap(), None, &filters);
        assert!(matches!(result, Err(FilterViolation::StepSize)));
    }
}
