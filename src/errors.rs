//! Error taxonomy (spec §7). These are *kinds*, not a single flat error:
//! most call sites propagate `anyhow::Result` and only reach for a
//! specific variant where a caller needs to `match` on it (schema/contract
//! mismatches halting Safety, decision rejects carrying a reason code).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema version mismatch")]
    SchemaMismatch,

    #[error("contract version mismatch: producer={producer} consumer={consumer}")]
    ContractMismatch { producer: String, consumer: String },

    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("ingest transient failure: {0}")]
    IngestTransient(String),

    #[error("ingest gap exceeded backfill window")]
    IngestGapExceeded,

    #[error("dedup conflict for key {0}")]
    DedupConflict(String),

    #[error("intent mismatch for correlation_id {0}")]
    IntentMismatch(String),

    #[error("decision rejected: {0}")]
    DecisionReject(String),

    #[error("adapter submit failed: {0}")]
    AdapterSubmitFailure(String),

    #[error("adapter rate limited")]
    AdapterRateLimited,

    #[error("adapter timeout")]
    AdapterTimeout,

    #[error("execution retry budget exceeded")]
    RetryBudgetExceeded,

    #[error("reconcile warning: {0}")]
    ReconcileWarn(String),

    #[error("reconcile critical: {0}")]
    ReconcileCritical(String),

    #[error("exchange snapshot stale")]
    SnapshotStale,

    #[error("safety blocked: {0}")]
    SafetyBlocked(String),
}

/// Reason codes emitted by the Decision service when it yields zero
/// intents. These never unwind the loop (spec §7); they are logged and
/// returned as plain strings so the orchestrator can report them.
pub mod decision_reasons {
    pub const MISSING_TIMESTAMP_MS: &str = "missing_timestamp_ms";
    pub const STALE_EVENT: &str = "stale_event";
    pub const FUTURE_EVENT: &str = "future_event";
    pub const MISSING_LOCAL_POSITION: &str = "missing_local_position";
    pub const MISSING_CLOSABLE_QTY: &str = "missing_closable_qty";
    pub const NO_CLOSABLE_QTY: &str = "no_closable_qty";
    pub const SIZING_INVALID: &str = "sizing_invalid";
    pub const KELLY_PARAMS_MISSING: &str = "kelly_params_missing";
    pub const MAX_QTY_EXCEEDED: &str = "max_qty_exceeded";
    pub const SLIPPAGE_EXCEEDED: &str = "slippage_exceeded";
    pub const MISSING_REFERENCE_PRICE: &str = "missing_reference_price";
    pub const FILTER_MIN_QTY: &str = "filter_min_qty";
    pub const FILTER_STEP_SIZE: &str = "filter_step_size";
    pub const FILTER_TICK_SIZE: &str = "filter_tick_size";
    pub const FILTER_MIN_NOTIONAL: &str = "filter_min_notional";
    pub const FILTERS_UNAVAILABLE: &str = "filters_unavailable";
    pub const BLACKLISTED_SYMBOL: &str = "blacklisted_symbol";
    pub const CONTRACT_VERSION_MISMATCH: &str = "contract_version_mismatch";
}
