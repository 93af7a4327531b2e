//! Normalizes raw adapter events into `PositionDeltaEvent`s and admits them
//! under the dedup/cursor gate. Grounded on
//! `original_source/src/hyperliquid/ingest/service.py::build_position_delta_event`; the
//! admission loop (`ingest_raw_events`) is referenced but never defined in
//! the source, so it is built fresh here from spec.md §4.3 steps 5-6.

use crate::ingest::adapter::RawPositionEvent;
use crate::storage::Storage;
use crate::types::{assert_contract_version, ActionType, Ms, PositionDeltaEvent, Qty};

pub struct IngestService {
    storage: Storage,
}

impl IngestService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Builds one `PositionDeltaEvent`, deriving `action_type` when the
    /// adapter didn't already supply one (spec §4.3 step 5).
    pub fn build_position_delta_event(&self, raw: RawPositionEvent, now_ms: Ms) -> PositionDeltaEvent {
        let timestamp_ms = raw.timestamp_ms.unwrap_or(now_ms);
        let delta = raw.next_target_net_position - raw.prev_target_net_position;
        let action_type = match raw.action_type.as_deref() {
            Some("INCREASE") => ActionType::Increase,
            Some("DECREASE") => ActionType::Decrease,
            Some("FLIP") => ActionType::Flip,
            _ => derive_action_type(raw.prev_target_net_position, raw.next_target_net_position, delta),
        };
        let (open_component, close_component) = if action_type == ActionType::Flip {
            (
                raw.open_component.or(Some(raw.next_target_net_position.abs())),
                raw.close_component.or(Some(raw.prev_target_net_position.abs())),
            )
        } else {
            (raw.open_component, raw.close_component)
        };

        PositionDeltaEvent {
            symbol: raw.symbol,
            timestamp_ms,
            tx_hash: raw.tx_hash,
            event_index: raw.event_index,
            is_replay: raw.is_replay,
            prev_target_net_position: raw.prev_target_net_position,
            next_target_net_position: raw.next_target_net_position,
            delta_target_net_position: delta,
            action_type,
            open_component,
            close_component,
            contract_version: crate::types::CONTRACT_VERSION.to_string(),
        }
    }

    /// Normalizes each raw event and admits it under the dedup/cursor gate
    /// (spec §4.3 steps 5-6). Dropped (already-processed) events are
    /// logged and excluded from the returned list, which preserves arrival
    /// order for dispatch to Decision.
    pub async fn ingest_raw_events(
        &self,
        raw_events: Vec<RawPositionEvent>,
        now_ms: Ms,
    ) -> anyhow::Result<Vec<PositionDeltaEvent>> {
        let mut admitted = Vec::with_capacity(raw_events.len());
        for raw in raw_events {
            let event = self.build_position_delta_event(raw, now_ms);
            assert_contract_version(&event.contract_version)?;
            if self.storage.has_processed(&event.tx_hash, event.event_index, event.symbol.as_str()).await? {
                tracing::debug!(
                    tx_hash = %event.tx_hash,
                    event_index = event.event_index,
                    symbol = %event.symbol,
                    "ingest_duplicate_dropped"
                );
                continue;
            }
            self.storage
                .record_processed_and_advance_cursor(
                    &event.tx_hash,
                    event.event_index,
                    event.symbol.as_str(),
                    event.timestamp_ms,
                    event.is_replay,
                    now_ms,
                )
                .await?;
            admitted.push(event);
        }
        Ok(admitted)
    }
}

/// Mirrors the source's derivation: `FLIP` on sign crossing, `INCREASE`
/// when magnitude grows (or starting from flat), else `DECREASE`.
fn derive_action_type(prev: Qty, next: Qty, delta: Qty) -> ActionType {
    if prev == Qty::default() {
        return if delta != Qty::default() { ActionType::Increase } else { ActionType::Decrease };
    }
    if prev > Qty::default() && next < Qty::default() {
        return ActionType::Flip;
    }
    if prev < Qty::default() && next > Qty::default() {
        return ActionType::Flip;
    }
    if next.abs() < prev.abs() {
        return ActionType::Decrease;
    }
    ActionType::Increase
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sym;

    fn raw(prev: &str, next: &str) -> RawPositionEvent {
        RawPositionEvent {
            symbol: Sym::new("BTC"),
            tx_hash: "0xabc".to_string(),
            event_index: 0,
            prev_target_net_position: prev.parse().unwrap(),
            next_target_net_position: next.parse().unwrap(),
            is_replay: false,
            timestamp_ms: Some(1_000),
            action_type: None,
            open_component: None,
            close_component: None,
        }
    }

    #[tokio::test]
    async fn derives_increase_from_flat_start() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).unwrap();
        let service = IngestService::new(storage);
        let event = service.build_position_delta_event(raw("0", "1.0"), 1_000);
        assert_eq!(event.action_type, ActionType::Increase);
    }

    #[tokio::test]
    async fn derives_flip_on_sign_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).unwrap();
        let service = IngestService::new(storage);
        let event = service.build_position_delta_event(raw("1.0", "-0.5"), 1_000);
        assert_eq!(event.action_type, ActionType::Flip);
        assert_eq!(event.close_component, Some("1.0".parse().unwrap()));
        assert_eq!(event.open_component, Some("0.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn derives_decrease_when_magnitude_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).unwrap();
        let service = IngestService::new(storage);
        let event = service.build_position_delta_event(raw("1.0", "0.5"), 1_000);
        assert_eq!(event.action_type, ActionType::Decrease);
    }

    #[tokio::test]
    async fn admits_once_then_drops_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).unwrap();
        let service = IngestService::new(storage);
        let events = vec![raw("0", "1.0"), raw("0", "1.0")];
        let admitted = service.ingest_raw_events(events, 1_000).await.unwrap();
        assert_eq!(admitted.len(), 1);
    }
}
