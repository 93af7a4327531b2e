//! Sizing modes, grounded on
//! `original_source/src/hyperliquid/decision/strategy.py::_compute_increase_qty`.

use crate::config::SizingSection;
use crate::errors::decision_reasons as reasons;
use crate::types::Qty;

pub enum SizingOutcome {
    Qty(Qty),
    Reject(&'static str),
}

/// Computes the sized quantity for an INCREASE/DECREASE/open-leg intent
/// from `base_qty = |delta|` (spec §4.4 step 6).
pub fn size_qty(base_qty: Qty, sizing: &SizingSection) -> SizingOutcome {
    if base_qty <= Qty::default() {
        return SizingOutcome::Reject(reasons::SIZING_INVALID);
    }
    match sizing.mode.as_str() {
        "fixed" => {
            let qty = Qty::try_from(sizing.fixed_qty).unwrap_or_default();
            SizingOutcome::Qty(qty)
        }
        "proportional" => {
            let ratio = Qty::try_from(sizing.proportional_ratio).unwrap_or_default();
            SizingOutcome::Qty(base_qty * ratio)
        }
        "kelly" => size_kelly(base_qty, sizing),
        _ => SizingOutcome::Reject(reasons::SIZING_INVALID),
    }
}

fn size_kelly(base_qty: Qty, sizing: &SizingSection) -> SizingOutcome {
    let win_rate = sizing.kelly_win_rate;
    let edge = sizing.kelly_edge;
    if win_rate <= 0.0 || edge <= 0.0 {
        return SizingOutcome::Reject(reasons::KELLY_PARAMS_MISSING);
    }
    let kelly_fraction = win_rate - ((1.0 - win_rate) / edge);
    if kelly_fraction <= 0.0 {
        return SizingOutcome::Reject(reasons::SIZING_INVALID);
    }
    let kelly_fraction = Qty::try_from(kelly_fraction).unwrap_or_default();
    let scale = Qty::try_from(sizing.kelly_fraction).unwrap_or_default();
    SizingOutcome::Qty(base_qty * kelly_fraction * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing(mode: &str) -> SizingSection {
        SizingSection {
            mode: mode.to_string(),
            fixed_qty: 0.5,
            proportional_ratio: 2.0,
            kelly_win_rate: 0.0,
            kelly_edge: 0.0,
            kelly_fraction: 1.0,
        }
    }

    fn qty(s: &str) -> Qty {
        s.parse().unwrap()
    }

    #[test]
    fn fixed_mode_ignores_base_qty() {
        let outcome = size_qty(qty("10"), &sizing("fixed"));
        assert!(matches!(outcome, SizingOutcome::Qty(q) if q == qty("0.5")));
    }

    #[test]
    fn proportional_mode_scales_base_qty() {
        let outcome = size_qty(qty("3"), &sizing("proportional"));
        assert!(matches!(outcome, SizingOutcome::Qty(q) if q == qty("6")));
    }

    #[test]
    fn kelly_rejects_when_params_missing() {
        let outcome = size_qty(qty("3"), &sizing("kelly"));
        assert!(matches!(outcome, SizingOutcome::Reject(reasons::KELLY_PARAMS_MISSING)));
    }

    #[test]
    fn kelly_computes_expected_formula() {
        let mut cfg = sizing("kelly");
        cfg.kelly_win_rate = 0.6;
        cfg.kelly_edge = 2.0;
        cfg.kelly_fraction = 1.0;
        // kelly_fraction = 0.6 - (0.4/2.0) = 0.4; qty = 10 * 0.4 = 4
        let outcome = size_qty(qty("10"), &cfg);
        assert!(matches!(outcome, SizingOutcome::Qty(q) if q == qty("4.0")));
    }

    #[test]
    fn kelly_rejects_non_positive_fraction() {
        let mut cfg = sizing("kelly");
        cfg.kelly_win_rate = 0.2;
        cfg.kelly_edge = 1.0;
        let outcome = size_qty(qty("10"), &cfg);
        assert!(matches!(outcome, SizingOutcome::Reject(_)));
    }
}
