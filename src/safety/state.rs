//! Safety state machine (spec §4.6), grounded on
//! `original_source/src/hyperliquid/safety/service.py` + `storage/safety.py`.

use crate::errors::PipelineError;
use crate::safety::reconcile::{ReconcileMode, ReconciliationResult};
use crate::storage::audit::AuditEntry;
use crate::storage::db::OrderIntent;
use crate::storage::Storage;
use crate::types::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyMode {
    ArmedLive,
    ArmedSafe,
    Halt,
}

impl SafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyMode::ArmedLive => "ARMED_LIVE",
            SafetyMode::ArmedSafe => "ARMED_SAFE",
            SafetyMode::Halt => "HALT",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "ARMED_LIVE" => SafetyMode::ArmedLive,
            "HALT" => SafetyMode::Halt,
            _ => SafetyMode::ArmedSafe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyStateSnapshot {
    pub mode: SafetyMode,
    pub reason_code: String,
    pub reason_message: String,
    pub changed_at_ms: Ms,
}

/// Reason codes that are eligible for auto-promotion back to ARMED_LIVE
/// (spec §4.6 step 6: "not manual override, not schema mismatch").
const AUTO_PROMOTE_INELIGIBLE_REASONS: &[&str] = &[
    "MANUAL_OVERRIDE",
    "MANUAL_UNHALT",
    "MANUAL_PROMOTE",
    "SCHEMA_VERSION_MISMATCH",
    "CONTRACT_VERSION_MISMATCH",
];

pub struct SafetyService {
    storage: Storage,
}

impl SafetyService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn current_mode(&self) -> SafetyMode {
        let raw = self
            .storage
            .get_system_state("safety_mode")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "ARMED_SAFE".to_string());
        SafetyMode::parse(&raw)
    }

    pub async fn snapshot(&self) -> SafetyStateSnapshot {
        let mode = self.current_mode().await;
        let reason_code = self
            .storage
            .get_system_state("safety_reason_code")
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let reason_message = self
            .storage
            .get_system_state("safety_reason_message")
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let changed_at_ms = self
            .storage
            .get_system_state("safety_changed_at_ms")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        SafetyStateSnapshot { mode, reason_code, reason_message, changed_at_ms }
    }

    /// Gates execution before an Execution Adapter is invoked (spec §4.6).
    pub async fn pre_execution_check(&self, intent: &OrderIntent) -> Result<(), PipelineError> {
        let mode = self.current_mode().await;
        match mode {
            SafetyMode::Halt => Err(PipelineError::SafetyBlocked("HALT".to_string())),
            SafetyMode::ArmedSafe if !intent.reduce_only => {
                Err(PipelineError::SafetyBlocked("ARMED_SAFE_BLOCK_INCREASE".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Writes a state transition with an audit entry. No-op transitions
    /// (same mode and reason code) are suppressed.
    pub async fn set_safety_state(&self, mode: SafetyMode, reason_code: &str, reason_message: &str, now_ms: Ms) {
        let current = self.snapshot().await;
        if current.mode == mode && current.reason_code == reason_code {
            return;
        }
        let _ = self.storage.set_system_state("safety_mode", mode.as_str()).await;
        let _ = self.storage.set_system_state("safety_reason_code", reason_code).await;
        let _ = self.storage.set_system_state("safety_reason_message", reason_message).await;
        let _ = self.storage.set_system_state("safety_changed_at_ms", &now_ms.to_string()).await;
        self.storage
            .record_audit(
                &AuditEntry::new(now_ms, "safety", "safety_mode")
                    .with_transition(Some(current.mode.as_str()), mode.as_str())
                    .with_reason(reason_code, reason_message),
            )
            .await;
    }

    /// Eligibility check used before auto-promotion (spec §4.6 step 6).
    pub fn is_auto_promote_eligible(reason_code: &str) -> bool {
        !AUTO_PROMOTE_INELIGIBLE_REASONS.contains(&reason_code)
    }

    /// Applies one reconciliation outcome (spec §4.6 steps 1-6). Any
    /// non-OK outcome transitions immediately and resets the consecutive-OK
    /// streak; an OK outcome only promotes back to ARMED_LIVE once the
    /// streak reaches `required_consecutive` within `window_sec`, and only
    /// when the current reason code is auto-promote eligible.
    pub async fn apply_reconciliation(
        &self,
        result: &ReconciliationResult,
        allow_auto_promote: bool,
        required_consecutive: u32,
        window_sec: u64,
        now_ms: Ms,
    ) {
        let target_mode = match result.mode {
            ReconcileMode::ArmedLive => SafetyMode::ArmedLive,
            ReconcileMode::ArmedSafe => SafetyMode::ArmedSafe,
            ReconcileMode::Halt => SafetyMode::Halt,
        };

        if target_mode != SafetyMode::ArmedLive {
            self.reset_ok_streak().await;
            self.set_safety_state(target_mode, &result.reason_code, &result.reason_message, now_ms).await;
            return;
        }

        let current = self.snapshot().await;
        if current.mode == SafetyMode::ArmedLive {
            self.reset_ok_streak().await;
            return;
        }

        if !allow_auto_promote || !Self::is_auto_promote_eligible(&current.reason_code) {
            return;
        }

        let streak = self.bump_ok_streak(window_sec, now_ms).await;
        if streak >= required_consecutive {
            self.set_safety_state(
                SafetyMode::ArmedLive,
                "RECONCILE_OK_AUTO_PROMOTE",
                "auto-promoted after consecutive OK checks",
                now_ms,
            )
            .await;
            self.reset_ok_streak().await;
        }
    }

    async fn reset_ok_streak(&self) {
        let _ = self.storage.set_system_state("reconcile_ok_streak_count", "0").await;
    }

    /// Increments the streak, resetting it if the window since it started
    /// has elapsed.
    async fn bump_ok_streak(&self, window_sec: u64, now_ms: Ms) -> u32 {
        let started_ms: Ms = self
            .storage
            .get_system_state("reconcile_ok_streak_started_ms")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let count: u32 = self
            .storage
            .get_system_state("reconcile_ok_streak_count")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let window_ms = (window_sec as i64) * 1_000;
        let (started_ms, count) = if count == 0 || (window_ms > 0 && now_ms - started_ms > window_ms) {
            (now_ms, 1)
        } else {
            (started_ms, count + 1)
        };
        let _ = self.storage.set_system_state("reconcile_ok_streak_started_ms", &started_ms.to_string()).await;
        let _ = self.storage.set_system_state("reconcile_ok_streak_count", &count.to_string()).await;
        count
    }
}
