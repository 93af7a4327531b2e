//! Reconciliation algorithm, grounded on `original_source/src/hyperliquid/safety/reconcile.py`.

use std::collections::{HashMap, HashSet};

use crate::types::{Ms, Qty, Sym};

#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub source: String,
    pub positions: HashMap<Sym, Qty>,
    pub timestamp_ms: Ms,
}

#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub drifts: HashMap<Sym, Qty>,
    pub max_drift: Qty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileMode {
    ArmedLive,
    ArmedSafe,
    Halt,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileMode::ArmedLive => "ARMED_LIVE",
            ReconcileMode::ArmedSafe => "ARMED_SAFE",
            ReconcileMode::Halt => "HALT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub mode: ReconcileMode,
    pub reason_code: String,
    pub reason_message: String,
    pub report: DriftReport,
}

/// Aggregates positions by symbol and drops magnitudes at or below
/// `zero_epsilon`, mirroring `normalize_positions`.
pub fn normalize_positions(positions: &HashMap<Sym, Qty>, zero_epsilon: f64) -> HashMap<Sym, Qty> {
    let mut normalized: HashMap<Sym, Qty> = HashMap::new();
    for (symbol, qty) in positions {
        *normalized.entry(symbol.clone()).or_insert(Qty::default()) += *qty;
    }
    if zero_epsilon >= 0.0 {
        let epsilon = Qty::try_from(zero_epsilon).unwrap_or_default();
        normalized.retain(|_, qty| qty.abs() > epsilon);
    }
    normalized
}

pub fn find_missing_symbols(
    local: &HashMap<Sym, Qty>,
    exchange: &HashMap<Sym, Qty>,
) -> (Vec<Sym>, Vec<Sym>) {
    let local_set: HashSet<&Sym> = local.keys().collect();
    let exchange_set: HashSet<&Sym> = exchange.keys().collect();
    let mut missing_local: Vec<Sym> = local_set.difference(&exchange_set).map(|s| (*s).clone()).collect();
    let mut missing_exchange: Vec<Sym> = exchange_set.difference(&local_set).map(|s| (*s).clone()).collect();
    missing_local.sort();
    missing_exchange.sort();
    (missing_local, missing_exchange)
}

pub fn compute_drift(local: &HashMap<Sym, Qty>, exchange: &HashMap<Sym, Qty>) -> DriftReport {
    let mut symbols: HashSet<&Sym> = local.keys().collect();
    symbols.extend(exchange.keys());
    let mut drifts = HashMap::new();
    let mut max_drift = Qty::default();
    for symbol in symbols {
        let local_qty = local.get(symbol).copied().unwrap_or_default();
        let exchange_qty = exchange.get(symbol).copied().unwrap_or_default();
        let drift = (local_qty - exchange_qty).abs();
        if drift > max_drift {
            max_drift = drift;
        }
        drifts.insert(symbol.clone(), drift);
    }
    DriftReport { drifts, max_drift }
}

pub fn evaluate_drift(report: DriftReport, warn_threshold: Qty, critical_threshold: Qty) -> ReconciliationResult {
    if report.max_drift >= critical_threshold {
        return ReconciliationResult {
            mode: ReconcileMode::Halt,
            reason_code: "RECONCILE_CRITICAL".to_string(),
            reason_message: "Drift exceeds critical threshold".to_string(),
            report,
        };
    }
    if report.max_drift >= warn_threshold {
        return ReconciliationResult {
            mode: ReconcileMode::ArmedSafe,
            reason_code: "RECONCILE_WARN".to_string(),
            reason_message: "Drift exceeds warning threshold".to_string(),
            report,
        };
    }
    ReconciliationResult {
        mode: ReconcileMode::ArmedLive,
        reason_code: "OK".to_string(),
        reason_message: "Drift within thresholds".to_string(),
        report,
    }
}

pub struct ReconcileParams {
    pub warn_threshold: Qty,
    pub critical_threshold: Qty,
    pub snapshot_max_stale_ms: Ms,
    pub zero_epsilon: f64,
}

/// Full reconciliation per spec §4.6 steps 1-5: staleness check, normalize,
/// missing-symbol critical check, then drift thresholds.
pub fn reconcile_snapshots(
    local: &PositionSnapshot,
    exchange: &PositionSnapshot,
    params: &ReconcileParams,
    now_ms: Ms,
) -> ReconciliationResult {
    let staleness_ms = now_ms - exchange.timestamp_ms;
    if params.snapshot_max_stale_ms >= 0 && staleness_ms > params.snapshot_max_stale_ms {
        return ReconciliationResult {
            mode: ReconcileMode::ArmedSafe,
            reason_code: "SNAPSHOT_STALE".to_string(),
            reason_message: "Exchange snapshot is stale".to_string(),
            report: DriftReport::default(),
        };
    }

    let local_positions = normalize_positions(&local.positions, params.zero_epsilon);
    let exchange_positions = normalize_positions(&exchange.positions, params.zero_epsilon);
    let (missing_local, missing_exchange) = find_missing_symbols(&local_positions, &exchange_positions);
    if !missing_local.is_empty() || !missing_exchange.is_empty() {
        let missing_local_str: Vec<&str> = missing_local.iter().map(|s| s.as_str()).collect();
        let missing_exchange_str: Vec<&str> = missing_exchange.iter().map(|s| s.as_str()).collect();
        return ReconciliationResult {
            mode: ReconcileMode::Halt,
            reason_code: "RECONCILE_CRITICAL".to_string(),
            reason_message: format!(
                "Missing symbols detected: missing_local={:?} missing_exchange={:?}",
                missing_local_str, missing_exchange_str
            ),
            report: DriftReport::default(),
        };
    }

    let report = compute_drift(&local_positions, &exchange_positions);
    evaluate_drift(report, params.warn_threshold, params.critical_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qty(s: &str) -> Qty {
        s.parse().unwrap()
    }

    #[test]
    fn snapshot_stale_short_circuits() {
        let local = PositionSnapshot { source: "local".into(), positions: HashMap::new(), timestamp_ms: 0 };
        let exchange = PositionSnapshot { source: "exchange".into(), positions: HashMap::new(), timestamp_ms: 0 };
        let params = ReconcileParams {
            warn_threshold: qty("0.01"),
            critical_threshold: qty("0.05"),
            snapshot_max_stale_ms: 1_000,
            zero_epsilon: 1e-9,
        };
        let result = reconcile_snapshots(&local, &exchange, &params, 5_000);
        assert_eq!(result.reason_code, "SNAPSHOT_STALE");
        assert_eq!(result.mode, ReconcileMode::ArmedSafe);
    }

    #[test]
    fn missing_symbol_halts() {
        let mut local_positions = HashMap::new();
        local_positions.insert(Sym::new("BTC"), qty("1.0"));
        let local = PositionSnapshot { source: "local".into(), positions: local_positions, timestamp_ms: 1_000 };
        let exchange = PositionSnapshot { source: "exchange".into(), positions: HashMap::new(), timestamp_ms: 1_000 };
        let params = ReconcileParams {
            warn_threshold: qty("0.01"),
            critical_threshold: qty("0.05"),
            snapshot_max_stale_ms: 30_000,
            zero_epsilon: 1e-9,
        };
        let result = reconcile_snapshots(&local, &exchange, &params, 1_000);
        assert_eq!(result.mode, ReconcileMode::Halt);
        assert_eq!(result.reason_code, "RECONCILE_CRITICAL");
    }

    #[test]
    fn drift_within_thresholds_is_ok() {
        let mut local_positions = HashMap::new();
        local_positions.insert(Sym::new("BTC"), qty("1.001"));
        let mut exchange_positions = HashMap::new();
        exchange_positions.insert(Sym::new("BTC"), qty("1.0"));
        let local = PositionSnapshot { source: "local".into(), positions: local_positions, timestamp_ms: 1_000 };
        let exchange = PositionSnapshot { source: "exchange".into(), positions: exchange_positions, timestamp_ms: 1_000 };
        let params = ReconcileParams {
            warn_threshold: qty("0.01"),
            critical_threshold: qty("0.05"),
            snapshot_max_stale_ms: 30_000,
            zero_epsilon: 1e-9,
        };
        let result = reconcile_snapshots(&local, &exchange, &params, 1_000);
        assert_eq!(result.mode, ReconcileMode::ArmedLive);
        assert_eq!(result.reason_code, "OK");
    }

    #[test]
    fn drift_above_critical_halts() {
        let mut local_positions = HashMap::new();
        local_positions.insert(Sym::new("BTC"), qty("1.2"));
        let mut exchange_positions = HashMap::new();
        exchange_positions.insert(Sym::new("BTC"), qty("1.0"));
        let local = PositionSnapshot { source: "local".into(), positions: local_positions, timestamp_ms: 1_000 };
        let exchange = PositionSnapshot { source: "exchange".into(), positions: exchange_positions, timestamp_ms: 1_000 };
        let params = ReconcileParams {
            warn_threshold: qty("0.01"),
            critical_threshold: qty("0.05"),
            snapshot_max_stale_ms: 30_000,
            zero_epsilon: 1e-9,
        };
        let result = reconcile_snapshots(&local, &exchange, &params, 1_000);
        assert_eq!(result.mode, ReconcileMode::Halt);
        assert_eq!(result.reason_code, "RECONCILE_CRITICAL");
    }
}
