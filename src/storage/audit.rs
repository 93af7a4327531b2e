//! Audit trail entries (spec §4.1, grounded on `audit_log` in
//! `storage/db.py`). Every state transition the pipeline makes — order
//! submitted, safety mode flipped, reconcile drift observed — gets one row.

use serde::Serialize;

use crate::types::Ms;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp_ms: Ms,
    pub category: String,
    pub entity_id: String,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub reason_code: Option<String>,
    pub reason_message: Option<String>,
    pub event_id: Option<String>,
    pub metadata: Option<String>,
}

impl AuditEntry {
    pub fn new(timestamp_ms: Ms, category: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            category: category.into(),
            entity_id: entity_id.into(),
            from_state: None,
            to_state: None,
            reason_code: None,
            reason_message: None,
            event_id: None,
            metadata: None,
        }
    }

    pub fn with_transition(mut self, from_state: Option<&str>, to_state: &str) -> Self {
        self.from_state = from_state.map(str::to_string);
        self.to_state = Some(to_state.to_string());
        self
    }

    pub fn with_reason(mut self, reason_code: &str, reason_message: impl Into<String>) -> Self {
        self.reason_code = Some(reason_code.to_string());
        self.reason_message = Some(reason_message.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}
