//! Drives one ingest cycle: gap/maintenance gating, backfill, live poll,
//! normalize+admit. Grounded on `original_source/src/hyperliquid/ingest/coordinator.py`
//! (`run_once`/`_run_backfill`/`_run_live_poll`/`_with_replay_flag`/
//! `_halt_for_gap`/`_apply_maintenance_skip`).

use crate::config::IngestSection;
use crate::ingest::adapter::IngestAdapter;
use crate::ingest::service::IngestService;
use crate::safety::{SafetyMode, SafetyService};
use crate::storage::Storage;
use crate::types::{Ms, PositionDeltaEvent};

const LAST_PROCESSED_TIMESTAMP_KEY: &str = "last_processed_timestamp_ms";

pub struct IngestCoordinator {
    config: IngestSection,
    adapter: Box<dyn IngestAdapter>,
    service: IngestService,
    storage: Storage,
    safety: std::sync::Arc<SafetyService>,
    backfill_only: bool,
}

impl IngestCoordinator {
    pub fn new(
        config: IngestSection,
        adapter: Box<dyn IngestAdapter>,
        storage: Storage,
        safety: std::sync::Arc<SafetyService>,
        backfill_only: bool,
    ) -> Self {
        let service = IngestService::new(storage.clone());
        Self { config, adapter, service, storage, safety, backfill_only }
    }

    async fn last_processed_ms(&self) -> anyhow::Result<Ms> {
        Ok(self
            .storage
            .get_system_state(LAST_PROCESSED_TIMESTAMP_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// One ingest cycle (spec §4.3 steps 1-4, 7). Returns the admitted
    /// events in arrival order (backfill batch before live batch).
    pub async fn run_once(&self, now_ms: Ms) -> anyhow::Result<Vec<PositionDeltaEvent>> {
        let mode = self.safety.current_mode().await;
        if mode == SafetyMode::Halt {
            let snapshot = self.safety.snapshot().await;
            if self.config.maintenance_skip_gap && snapshot.reason_code == "BACKFILL_WINDOW_EXCEEDED" {
                self.apply_maintenance_skip(now_ms).await?;
                return Ok(vec![]);
            }
            tracing::debug!("ingest_skipped_halt");
            return Ok(vec![]);
        }

        let last_ts = self.last_processed_ms().await?;
        if self.config.backfill_window_ms > 0 && last_ts > 0 && now_ms - last_ts > self.config.backfill_window_ms {
            self.safety
                .set_safety_state(
                    SafetyMode::Halt,
                    "BACKFILL_WINDOW_EXCEEDED",
                    &format!("gap of {}ms exceeds backfill window", now_ms - last_ts),
                    now_ms,
                )
                .await;
            return Ok(vec![]);
        }

        let since_ms = (last_ts - self.config.cursor_overlap_ms).max(0);
        let raw_backfill = self.adapter.fetch_backfill(since_ms, now_ms).await?;
        let backfill = with_replay_flag(raw_backfill, true);
        let mut admitted = self.service.ingest_raw_events(backfill, now_ms).await?;

        if !self.backfill_only {
            let raw_live = self.adapter.poll_live(last_ts).await?;
            let live = with_replay_flag(raw_live, false);
            let mut live_admitted = self.service.ingest_raw_events(live, now_ms).await?;
            admitted.append(&mut live_admitted);
        }

        Ok(admitted)
    }

    /// spec §4.3 step 1: jump the cursor past the enforced gap with a
    /// sentinel key, stamp when the skip happened, and drop to ARMED_SAFE
    /// so an operator still notices before the pipeline resumes live.
    async fn apply_maintenance_skip(&self, now_ms: Ms) -> anyhow::Result<()> {
        tracing::warn!(now_ms, backfill_window_ms = self.config.backfill_window_ms, "maintenance_skip_gap");
        self.storage.force_set_cursor(now_ms, 0, "maintenance", "MAINTENANCE", now_ms).await?;
        self.storage.set_system_state("maintenance_skip_applied_ms", &now_ms.to_string()).await?;
        self.safety
            .set_safety_state(
                SafetyMode::ArmedSafe,
                "MAINTENANCE_SKIP_GAP",
                "maintenance restart skipped gap enforcement",
                now_ms,
            )
            .await;
        Ok(())
    }
}

fn with_replay_flag(
    events: Vec<crate::ingest::adapter::RawPositionEvent>,
    is_replay: bool,
) -> Vec<crate::ingest::adapter::RawPositionEvent> {
    events
        .into_iter()
        .map(|mut e| {
            e.is_replay = is_replay;
            e
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HyperliquidIngestSection;
    use crate::ingest::adapter::{HyperliquidIngestAdapter, RawPositionEvent};
    use crate::types::Sym;

    fn raw_event(ts: Ms) -> RawPositionEvent {
        RawPositionEvent {
            symbol: Sym::new("BTC"),
            tx_hash: format!("0x{ts}"),
            event_index: 0,
            prev_target_net_position: Default::default(),
            next_target_net_position: "1.0".parse().unwrap(),
            is_replay: false,
            timestamp_ms: Some(ts),
            action_type: None,
            open_component: None,
            close_component: None,
        }
    }

    async fn build(backfill_only: bool) -> (IngestCoordinator, std::sync::Arc<SafetyService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).unwrap();
        let safety = std::sync::Arc::new(SafetyService::new(storage.clone()));
        let mut hl_config = HyperliquidIngestSection::default();
        hl_config.enabled = true;
        let adapter = Box::new(HyperliquidIngestAdapter::new(hl_config, vec![raw_event(500), raw_event(1_500)]));
        let coordinator = IngestCoordinator::new(IngestSection::default(), adapter, storage, safety.clone(), backfill_only);
        (coordinator, safety, dir)
    }

    #[tokio::test]
    async fn admits_backfill_and_live_events() {
        let (coordinator, _safety, _dir) = build(false).await;
        let admitted = coordinator.run_once(2_000).await.unwrap();
        assert_eq!(admitted.len(), 2);
    }

    #[tokio::test]
    async fn halt_mode_skips_ingest() {
        let (coordinator, safety, _dir) = build(false).await;
        safety.set_safety_state(SafetyMode::Halt, "MANUAL_OVERRIDE", "paused", 0).await;
        let admitted = coordinator.run_once(2_000).await.unwrap();
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn gap_exceeding_backfill_window_halts() {
        let (coordinator, safety, _dir) = build(false).await;
        coordinator
            .storage
            .set_system_state("last_processed_timestamp_ms", "1000")
            .await
            .unwrap();
        let mut config = IngestSection::default();
        config.backfill_window_ms = 500;
        let coordinator = IngestCoordinator::new(config, Box::new(NoopAdapter), coordinator.storage.clone(), safety.clone(), false);
        let admitted = coordinator.run_once(10_000).await.unwrap();
        assert!(admitted.is_empty());
        assert_eq!(safety.current_mode().await, SafetyMode::Halt);
    }

    #[tokio::test]
    async fn halt_for_gap_with_maintenance_skip_resumes_armed_safe() {
        let (coordinator, safety, _dir) = build(false).await;
        safety
            .set_safety_state(SafetyMode::Halt, "BACKFILL_WINDOW_EXCEEDED", "gap exceeded", 0)
            .await;
        let mut config = IngestSection::default();
        config.maintenance_skip_gap = true;
        let coordinator = IngestCoordinator::new(config, Box::new(NoopAdapter), coordinator.storage.clone(), safety.clone(), false);

        let admitted = coordinator.run_once(50_000).await.unwrap();
        assert!(admitted.is_empty());
        assert_eq!(safety.current_mode().await, SafetyMode::ArmedSafe);
        let snapshot = safety.snapshot().await;
        assert_eq!(snapshot.reason_code, "MAINTENANCE_SKIP_GAP");
        let stamped = coordinator.storage.get_system_state("maintenance_skip_applied_ms").await.unwrap();
        assert_eq!(stamped, Some("50000".to_string()));
        let last_ts = coordinator.storage.get_system_state("last_processed_timestamp_ms").await.unwrap();
        assert_eq!(last_ts, Some("50000".to_string()));
    }

    struct NoopAdapter;

    #[async_trait::async_trait]
    impl IngestAdapter for NoopAdapter {
        async fn fetch_backfill(
            &self,
            _since_ms: Ms,
            _until_ms: Ms,
        ) -> Result<Vec<RawPositionEvent>, crate::ingest::adapter::IngestAdapterError> {
            Ok(vec![])
        }

        async fn poll_live(&self, _since_ms: Ms) -> Result<Vec<RawPositionEvent>, crate::ingest::adapter::IngestAdapterError> {
            Ok(vec![])
        }
    }
}
