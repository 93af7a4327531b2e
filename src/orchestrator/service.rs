//! Boot sequence and main run loop (spec §4.7/§5), grounded on
//! `original_source/src/hyperliquid/orchestrator/service.py::Orchestrator.run` — config-hash
//! drift handling, bootstrap state keys, and the heartbeat loop all mirror
//! `_handle_config_hash`/`_ensure_bootstrap_state`/`_run_loop` there. The
//! per-event dispatch (`tick`) is new: the source's `Pipeline` class is
//! referenced but not given here, so it is built fresh from spec.md §4.7
//! step 5 in this crate's idiom.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{self, Config};
use crate::decision::{DecisionInputs, DecisionService};
use crate::execution::{BinanceExecutionAdapter, BinanceExecutionConfig, ExecutionService};
use crate::ingest::{HyperliquidIngestAdapter, IngestCoordinator};
use crate::metrics::MetricsSink;
use crate::notifier::{Notifier, NoopNotifier, SafetyTransition};
use crate::safety::{
    reconcile_snapshots, PositionSnapshot, ReconcileParams, SafetyMode, SafetyService,
};
use crate::storage::Storage;
use crate::types::{Ms, Qty};

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Live,
    BackfillOnly,
    Once,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Live => "live",
            RunMode::BackfillOnly => "backfill-only",
            RunMode::Once => "once",
        }
    }
}

pub struct Orchestrator {
    config: Config,
    storage: Storage,
    safety: Arc<SafetyService>,
    decision: DecisionService,
    execution: ExecutionService,
    ingest: IngestCoordinator,
    metrics: Arc<MetricsSink>,
    notifier: Box<dyn Notifier>,
    mode: RunMode,
}

impl Orchestrator {
    /// Runs the full boot sequence (spec §4.7 steps 1-4): load + hash the
    /// config, bring the schema up, reconcile config drift against the
    /// persisted hash, bootstrap missing system_state keys, then wire every
    /// service. Fails closed into HALT on a schema or contract mismatch
    /// before propagating the error, matching the source's `except` clauses.
    pub async fn boot(config_path: &Path, mode: RunMode) -> anyhow::Result<Self> {
        let config = config::load_config(config_path)?;
        let config_hash = config::compute_config_hash(config_path)?;

        let storage = Storage::open(&config.db_path)?;
        let safety = Arc::new(SafetyService::new(storage.clone()));

        if let Err(e) = storage.ensure_schema().await {
            safety
                .set_safety_state(SafetyMode::Halt, "SCHEMA_VERSION_MISMATCH", "db schema version mismatch", now_ms())
                .await;
            return Err(e).context("ensure_schema");
        }

        Self::handle_config_hash(&storage, &safety, &config_hash).await?;
        storage.set_system_state("config_hash", &config_hash).await?;
        storage.set_system_state("config_version", &config.config_version).await?;
        Self::assert_contract_version(&storage, &safety).await?;
        storage.set_system_state("contract_version", crate::types::CONTRACT_VERSION).await?;
        Self::ensure_bootstrap_state(&storage).await?;

        let metrics = Arc::new(MetricsSink::open(&config.metrics_log_path)?);

        let decision_section = config.decision.clone().unwrap_or_else(default_decision_section);
        let decision = DecisionService::new(decision_section, None, None).with_metrics(metrics.clone());

        let mut adapter_config = config.execution.adapter.clone();
        if mode != RunMode::Live {
            adapter_config.enabled = false;
        }
        let execution_adapter: Box<dyn crate::execution::ExecutionAdapter> =
            Box::new(BinanceExecutionAdapter::new(adapter_config));
        let execution = ExecutionService::new(config.execution.clone(), execution_adapter, storage.clone(), safety.clone())
            .with_metrics(metrics.clone());

        let ingest_adapter = Box::new(HyperliquidIngestAdapter::new(config.ingest.hyperliquid.clone(), vec![]));
        let backfill_only = mode == RunMode::BackfillOnly;
        let ingest = IngestCoordinator::new(config.ingest.clone(), ingest_adapter, storage.clone(), safety.clone(), backfill_only);

        Ok(Self {
            config,
            storage,
            safety,
            decision,
            execution,
            ingest,
            metrics,
            notifier: Box::new(NoopNotifier),
            mode,
        })
    }

    /// Swaps in a concrete notifier backend. The default is [`NoopNotifier`]
    /// per the Non-goals (no concrete transport ships in this crate).
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// spec §4.7 step 1: a changed config hash forces ARMED_SAFE so an
    /// operator notices the drift before the next live order, unless the
    /// pipeline is already HALT (in which case HALT wins).
    async fn handle_config_hash(storage: &Storage, safety: &SafetyService, config_hash: &str) -> anyhow::Result<()> {
        let existing = storage.get_system_state("config_hash").await?;
        if let Some(existing) = existing {
            if existing != config_hash {
                tracing::warn!(previous = %existing, "config_hash_changed");
                if safety.current_mode().await == SafetyMode::Halt {
                    return Ok(());
                }
                safety
                    .set_safety_state(
                        SafetyMode::ArmedSafe,
                        "CONFIG_HASH_CHANGED",
                        "config hash changed; continuing per operator policy",
                        now_ms(),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn assert_contract_version(storage: &Storage, safety: &SafetyService) -> anyhow::Result<()> {
        if let Some(existing) = storage.get_system_state("contract_version").await? {
            if let Err(e) = crate::types::assert_contract_version(&existing) {
                safety
                    .set_safety_state(SafetyMode::Halt, "CONTRACT_VERSION_MISMATCH", &e.to_string(), now_ms())
                    .await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn ensure_bootstrap_state(storage: &Storage) -> anyhow::Result<()> {
        let now = now_ms();
        if storage.get_system_state("last_processed_timestamp_ms").await?.is_none() {
            storage.set_system_state("last_processed_timestamp_ms", "0").await?;
        }
        if storage.get_system_state("last_processed_event_key").await?.is_none() {
            storage.set_system_state("last_processed_event_key", "").await?;
        }
        if storage.get_system_state("safety_mode").await?.is_none() {
            storage.set_system_state("safety_mode", SafetyMode::ArmedSafe.as_str()).await?;
        }
        if storage.get_system_state("safety_reason_code").await?.is_none() {
            storage.set_system_state("safety_reason_code", "BOOTSTRAP").await?;
        }
        if storage.get_system_state("safety_reason_message").await?.is_none() {
            storage.set_system_state("safety_reason_message", "Initial bootstrap state").await?;
        }
        if storage.get_system_state("safety_changed_at_ms").await?.is_none() {
            storage.set_system_state("safety_changed_at_ms", &now.to_string()).await?;
        }
        Ok(())
    }

    /// One ingest→decide→execute cycle (spec §4.7 step 5). Returns the
    /// number of events admitted, which the caller uses to decide whether
    /// the tick was productive (active backoff) or idle.
    pub async fn tick(&self, now_ms: Ms) -> anyhow::Result<usize> {
        let events = self.ingest.run_once(now_ms).await?;
        self.metrics.ingest_events_admitted(now_ms, events.len());

        let last_ts = self
            .storage
            .get_system_state("last_processed_timestamp_ms")
            .await?
            .and_then(|v| v.parse::<Ms>().ok())
            .unwrap_or(now_ms);
        self.metrics.cursor_lag_ms(now_ms, (now_ms - last_ts).max(0));

        let local_positions = self.storage.reconstruct_local_positions().await?;
        let safety_mode = self.safety.current_mode().await;

        for event in &events {
            let current = local_positions.get(&event.symbol).copied();
            let inputs = DecisionInputs {
                safety_mode,
                local_current_position: current,
                closable_qty: current,
                expected_price: None,
            };
            let intents = self.decision.decide(event, &inputs, now_ms).await?;
            for intent in intents {
                // For a FLIP, `decide` already orders close before open; awaiting
                // each execute() in turn satisfies the ordering guarantee that a
                // result is persisted before the next intent from the same event
                // is handled (spec §5).
                self.execution.execute(intent, now_ms).await?;
            }
        }
        Ok(events.len())
    }

    /// Runs reconciliation when `reconcile_interval_sec` has elapsed since
    /// the last pass (spec §4.6). A `None` from the adapter's optional
    /// `fetch_positions` capability means no reconciliation can run this
    /// cycle; that is not an error.
    pub async fn reconcile_if_due(&self, now_ms: Ms) -> anyhow::Result<()> {
        let last = self
            .storage
            .get_system_state("last_reconcile_ms")
            .await?
            .and_then(|v| v.parse::<Ms>().ok())
            .unwrap_or(0);
        let interval_ms = (self.config.orchestrator.reconcile_interval_sec as i64) * 1_000;
        if last != 0 && now_ms - last < interval_ms {
            return Ok(());
        }

        let Some(exchange_positions) = self.execution.fetch_positions().await else {
            return Ok(());
        };
        let local_positions = self.storage.reconstruct_local_positions().await?;

        let local = PositionSnapshot { source: "local".to_string(), positions: local_positions, timestamp_ms: now_ms };
        let exchange = PositionSnapshot { source: "exchange".to_string(), positions: exchange_positions, timestamp_ms: now_ms };
        let params = ReconcileParams {
            warn_threshold: Qty::try_from(self.config.safety.warn_threshold).unwrap_or_default(),
            critical_threshold: Qty::try_from(self.config.safety.critical_threshold).unwrap_or_default(),
            snapshot_max_stale_ms: self.config.safety.snapshot_max_stale_ms,
            zero_epsilon: self.config.safety.zero_epsilon,
        };

        let before = self.safety.snapshot().await;
        let result = reconcile_snapshots(&local, &exchange, &params, now_ms);
        self.safety
            .apply_reconciliation(
                &result,
                self.config.safety.allow_auto_promote,
                self.config.safety.halt_recovery_noncritical_required,
                self.config.safety.halt_recovery_window_sec,
                now_ms,
            )
            .await;
        let after = self.safety.snapshot().await;
        if before.mode != after.mode {
            self.notifier
                .notify_safety_transition(&SafetyTransition {
                    from_mode: before.mode,
                    to_mode: after.mode,
                    reason_code: after.reason_code.clone(),
                    reason_message: after.reason_message.clone(),
                    timestamp_ms: now_ms,
                })
                .await;
        }

        self.storage.set_system_state("last_reconcile_ms", &now_ms.to_string()).await?;
        Ok(())
    }

    /// Single-tick entry point for `run --mode once` (and the boot smoke
    /// cycle the source emits before entering its loop).
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let now = now_ms();
        self.tick(now).await?;
        self.reconcile_if_due(now).await?;
        self.metrics.heartbeat(now);
        Ok(())
    }

    /// Cooperative main loop (spec §5): ticks until `ctrl_c`, widening the
    /// sleep interval on idle ticks up to `loop_max_idle_sleep_sec` and
    /// resetting to `loop_active_sleep_sec` the moment a tick is productive.
    pub async fn run_loop(&self) -> anyhow::Result<()> {
        tracing::info!(mode = self.mode.as_str(), "loop_start");
        let mut idle_sleep = self.config.orchestrator.loop_idle_sleep_sec;
        loop {
            let now = now_ms();
            let admitted = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown_requested");
                    break;
                }
                result = self.tick(now) => result?,
            };
            self.reconcile_if_due(now).await?;
            self.metrics.heartbeat(now);

            let sleep_sec = if admitted > 0 {
                idle_sleep = self.config.orchestrator.loop_idle_sleep_sec;
                self.config.orchestrator.loop_active_sleep_sec
            } else {
                let next = idle_sleep.saturating_mul(2).min(self.config.orchestrator.loop_max_idle_sleep_sec);
                std::mem::replace(&mut idle_sleep, next)
            };

            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown_requested");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(sleep_sec)) => {}
            }
        }
        Ok(())
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn safety(&self) -> &Arc<SafetyService> {
        &self.safety
    }
}

/// Built when `[decision]` is absent from the config file: a permissive,
/// zero-sizing-constraint default so `run --mode once`/preflight still boot
/// without a strategy configured (spec §4.7: decision config is optional).
fn default_decision_section() -> config::DecisionSection {
    config::DecisionSection {
        strategy_version: "unconfigured".to_string(),
        max_stale_ms: 0,
        max_future_ms: 2_000,
        expected_price_max_stale_ms: 0,
        replay_policy: "close_only".to_string(),
        price_fallback_enabled: false,
        price_failure_policy: "allow_without_price".to_string(),
        filters_enabled: true,
        filters_failure_policy: "allow_without_filters".to_string(),
        blacklist_symbols: vec![],
        slippage_cap_pct: 0.0,
        max_qty: None,
        sizing: config::SizingSection::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
            config_version = "1"
            environment = "local"
            db_path = "{db}"
            metrics_log_path = "{metrics}"
            app_log_path = "{log}"
            log_level = "info"
            "#,
            db = dir.join("t.db").display(),
            metrics = dir.join("m.ndjson").display(),
            log = dir.join("a.log").display(),
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn boot_bootstraps_fresh_db_into_armed_safe() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(dir.path());
        let orchestrator = Orchestrator::boot(&config_path, RunMode::Once).await.unwrap();
        assert_eq!(orchestrator.safety().current_mode().await, SafetyMode::ArmedSafe);
    }

    #[tokio::test]
    async fn run_once_does_not_error_with_no_ingest_events() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(dir.path());
        let orchestrator = Orchestrator::boot(&config_path, RunMode::Once).await.unwrap();
        orchestrator.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn reboot_with_changed_config_drops_an_armed_live_run_to_armed_safe() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(dir.path());
        {
            let orchestrator = Orchestrator::boot(&config_path, RunMode::Once).await.unwrap();
            orchestrator
                .safety()
                .set_safety_state(SafetyMode::ArmedLive, "OK", "manually armed for test", 0)
                .await;
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(&config_path).unwrap();
        writeln!(file, "# comment to change the hash").unwrap();
        drop(file);

        let orchestrator = Orchestrator::boot(&config_path, RunMode::Once).await.unwrap();
        let snapshot = orchestrator.safety().snapshot().await;
        assert_eq!(snapshot.mode, SafetyMode::ArmedSafe);
        assert_eq!(snapshot.reason_code, "CONFIG_HASH_CHANGED");
    }

    #[tokio::test]
    async fn reboot_with_changed_config_does_not_override_halt() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(dir.path());
        {
            let orchestrator = Orchestrator::boot(&config_path, RunMode::Once).await.unwrap();
            orchestrator
                .safety()
                .set_safety_state(SafetyMode::Halt, "MANUAL_OVERRIDE", "operator halt", 0)
                .await;
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(&config_path).unwrap();
        writeln!(file, "# comment to change the hash").unwrap();
        drop(file);

        let orchestrator = Orchestrator::boot(&config_path, RunMode::Once).await.unwrap();
        assert_eq!(orchestrator.safety().current_mode().await, SafetyMode::Halt);
    }
}
