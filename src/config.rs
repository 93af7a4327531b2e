//! Config loading and schema validation (spec §6).
//!
//! The teacher loads a flat env-driven config via `dotenv`; here the
//! document is a TOML file (the teacher already depends on `toml`) parsed
//! into a typed tree. Unknown top-level keys are rejected via
//! `serde(deny_unknown_fields)` — the Rust-native equivalent of the
//! source's jsonschema validation pass.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::PipelineError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub config_version: String,
    pub environment: Environment,
    pub db_path: String,
    pub metrics_log_path: String,
    pub app_log_path: String,
    pub log_level: String,
    #[serde(default)]
    pub decision: Option<DecisionSection>,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Local,
    Staging,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingSection {
    #[serde(default = "default_sizing_mode")]
    pub mode: String,
    #[serde(default)]
    pub fixed_qty: f64,
    #[serde(default = "default_one")]
    pub proportional_ratio: f64,
    #[serde(default)]
    pub kelly_win_rate: f64,
    #[serde(default)]
    pub kelly_edge: f64,
    #[serde(default = "default_one")]
    pub kelly_fraction: f64,
}

fn default_sizing_mode() -> String {
    "proportional".to_string()
}
fn default_one() -> f64 {
    1.0
}

impl Default for SizingSection {
    fn default() -> Self {
        Self {
            mode: default_sizing_mode(),
            fixed_qty: 0.0,
            proportional_ratio: 1.0,
            kelly_win_rate: 0.0,
            kelly_edge: 0.0,
            kelly_fraction: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionSection {
    pub strategy_version: String,
    #[serde(default)]
    pub max_stale_ms: i64,
    #[serde(default = "default_max_future_ms")]
    pub max_future_ms: i64,
    #[serde(default = "default_expected_price_max_stale_ms")]
    pub expected_price_max_stale_ms: i64,
    #[serde(default = "default_replay_policy")]
    pub replay_policy: String,
    #[serde(default)]
    pub price_fallback_enabled: bool,
    #[serde(default = "default_price_failure_policy")]
    pub price_failure_policy: String,
    #[serde(default = "default_true")]
    pub filters_enabled: bool,
    #[serde(default = "default_filters_failure_policy")]
    pub filters_failure_policy: String,
    #[serde(default)]
    pub blacklist_symbols: Vec<String>,
    #[serde(default)]
    pub slippage_cap_pct: f64,
    #[serde(default)]
    pub max_qty: Option<f64>,
    #[serde(default)]
    pub sizing: SizingSection,
}

fn default_max_future_ms() -> i64 {
    2_000
}
fn default_expected_price_max_stale_ms() -> i64 {
    0
}
fn default_replay_policy() -> String {
    "close_only".to_string()
}
fn default_price_failure_policy() -> String {
    "allow_without_price".to_string()
}
fn default_filters_failure_policy() -> String {
    "allow_without_filters".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    #[serde(default)]
    pub tif_seconds: u64,
    #[serde(default = "default_order_poll_interval_sec")]
    pub order_poll_interval_sec: u64,
    #[serde(default = "default_retry_budget_max_attempts")]
    pub retry_budget_max_attempts: u32,
    #[serde(default = "default_retry_budget_window_sec")]
    pub retry_budget_window_sec: u64,
    #[serde(default = "default_order_poll_interval_sec")]
    pub unknown_poll_interval_sec: u64,
    #[serde(default = "default_retry_budget_mode")]
    pub retry_budget_mode: String,
    #[serde(default)]
    pub market_fallback_enabled: bool,
    #[serde(default = "default_market_fallback_threshold_pct")]
    pub market_fallback_threshold_pct: f64,
    #[serde(default = "default_market_slippage_cap_pct")]
    pub market_slippage_cap_pct: f64,
    #[serde(default = "default_client_order_id_max_len")]
    pub client_order_id_max_len: usize,
    #[serde(default)]
    pub adapter: crate::execution::adapter::BinanceExecutionConfig,
}

fn default_order_poll_interval_sec() -> u64 {
    2
}
fn default_retry_budget_max_attempts() -> u32 {
    3
}
fn default_retry_budget_window_sec() -> u64 {
    30
}
fn default_retry_budget_mode() -> String {
    "ARMED_SAFE".to_string()
}
fn default_market_fallback_threshold_pct() -> f64 {
    0.1
}
fn default_market_slippage_cap_pct() -> f64 {
    0.01
}
fn default_client_order_id_max_len() -> usize {
    36
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            tif_seconds: 0,
            order_poll_interval_sec: default_order_poll_interval_sec(),
            retry_budget_max_attempts: default_retry_budget_max_attempts(),
            retry_budget_window_sec: default_retry_budget_window_sec(),
            unknown_poll_interval_sec: default_order_poll_interval_sec(),
            retry_budget_mode: default_retry_budget_mode(),
            market_fallback_enabled: false,
            market_fallback_threshold_pct: default_market_fallback_threshold_pct(),
            market_slippage_cap_pct: default_market_slippage_cap_pct(),
            client_order_id_max_len: default_client_order_id_max_len(),
            adapter: crate::execution::adapter::BinanceExecutionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetySection {
    #[serde(default = "default_snapshot_max_stale_ms")]
    pub snapshot_max_stale_ms: i64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_zero_epsilon")]
    pub zero_epsilon: f64,
    #[serde(default)]
    pub allow_auto_promote: bool,
    #[serde(default = "default_halt_recovery_noncritical_required")]
    pub halt_recovery_noncritical_required: u32,
    #[serde(default = "default_halt_recovery_window_sec")]
    pub halt_recovery_window_sec: u64,
}

fn default_snapshot_max_stale_ms() -> i64 {
    30_000
}
fn default_warn_threshold() -> f64 {
    0.01
}
fn default_critical_threshold() -> f64 {
    0.05
}
fn default_zero_epsilon() -> f64 {
    1e-9
}
fn default_halt_recovery_noncritical_required() -> u32 {
    3
}
fn default_halt_recovery_window_sec() -> u64 {
    300
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            snapshot_max_stale_ms: default_snapshot_max_stale_ms(),
            warn_threshold: default_warn_threshold(),
            critical_threshold: default_critical_threshold(),
            zero_epsilon: default_zero_epsilon(),
            allow_auto_promote: false,
            halt_recovery_noncritical_required: default_halt_recovery_noncritical_required(),
            halt_recovery_window_sec: default_halt_recovery_window_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default)]
    pub max_requests: u32,
    #[serde(default = "default_one_u64")]
    pub per_seconds: u64,
    #[serde(default)]
    pub cooldown_seconds: u64,
}

fn default_one_u64() -> u64 {
    1
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: 0,
            per_seconds: 1,
            cooldown_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_jitter_ms() -> u64 {
    100
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HyperliquidIngestSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ingest_mode")]
    pub mode: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_ingest_mode() -> String {
    "stub".to_string()
}
fn default_rest_url() -> String {
    "https://api.hyperliquid.xyz/info".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    #[serde(default)]
    pub backfill_window_ms: i64,
    #[serde(default)]
    pub cursor_overlap_ms: i64,
    #[serde(default)]
    pub maintenance_skip_gap: bool,
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: i64,
    #[serde(default)]
    pub hyperliquid: HyperliquidIngestSection,
}

fn default_dedup_ttl_seconds() -> i64 {
    7 * 24 * 3600
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            backfill_window_ms: 0,
            cursor_overlap_ms: 0,
            maintenance_skip_gap: false,
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            hyperliquid: HyperliquidIngestSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_loop_active_sleep_sec")]
    pub loop_active_sleep_sec: u64,
    #[serde(default = "default_loop_idle_sleep_sec")]
    pub loop_idle_sleep_sec: u64,
    #[serde(default = "default_loop_max_idle_sleep_sec")]
    pub loop_max_idle_sleep_sec: u64,
    #[serde(default = "default_reconcile_interval_sec")]
    pub reconcile_interval_sec: u64,
}

fn default_loop_active_sleep_sec() -> u64 {
    1
}
fn default_loop_idle_sleep_sec() -> u64 {
    2
}
fn default_loop_max_idle_sleep_sec() -> u64 {
    60
}
fn default_reconcile_interval_sec() -> u64 {
    60
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            loop_active_sleep_sec: default_loop_active_sleep_sec(),
            loop_idle_sleep_sec: default_loop_idle_sleep_sec(),
            loop_max_idle_sleep_sec: default_loop_max_idle_sleep_sec(),
            reconcile_interval_sec: default_reconcile_interval_sec(),
        }
    }
}

/// Load and validate a config file from disk.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| PipelineError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Schema validation beyond what serde's `deny_unknown_fields` can express.
fn validate_config(config: &Config) -> Result<(), PipelineError> {
    if let Some(decision) = &config.decision {
        if decision.strategy_version.trim().is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "decision.strategy_version must be non-empty when [decision] is present".into(),
            ));
        }
    }
    Ok(())
}

/// SHA-256 hex digest of the config file's bytes, used to detect drift
/// between the running process and the file on disk (spec §4.7 step 1).
pub fn compute_config_hash(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn resolve_config_path(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_key() {
        let toml = r#"
            config_version = "1"
            environment = "local"
            db_path = "x.db"
            metrics_log_path = "m.ndjson"
            app_log_path = "a.log"
            log_level = "info"
            totally_unknown_section = {}
        "#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn requires_strategy_version_when_decision_present() {
        let toml = r#"
            config_version = "1"
            environment = "local"
            db_path = "x.db"
            metrics_log_path = "m.ndjson"
            app_log_path = "a.log"
            log_level = "info"

            [decision]
            strategy_version = ""
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn accepts_minimal_config() {
        let toml = r#"
            config_version = "1"
            environment = "local"
            db_path = "x.db"
            metrics_log_path = "m.ndjson"
            app_log_path = "a.log"
            log_level = "info"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(validate_config(&config).is_ok());
    }
}
