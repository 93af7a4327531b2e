//! Operator notification seam (spec Non-goals: "no notifier transport
//! implementation — a `Notifier` trait is defined; no concrete Slack/email/
//! etc backend ships"). Mirrors the capability-set pattern used by
//! `ExecutionAdapter`/`IngestAdapter`: a single async trait with a no-op
//! default implementation, so the orchestrator can hold a
//! `Box<dyn Notifier>` without caring whether a real transport is wired up.

use async_trait::async_trait;

use crate::safety::SafetyMode;

/// A safety-mode transition worth surfacing to an operator out-of-band.
#[derive(Debug, Clone)]
pub struct SafetyTransition {
    pub from_mode: SafetyMode,
    pub to_mode: SafetyMode,
    pub reason_code: String,
    pub reason_message: String,
    pub timestamp_ms: i64,
}

/// Outbound notification surface. Concrete backends (Slack, email, pager)
/// are deliberately out of scope; `NoopNotifier` is the only implementation
/// shipped here.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_safety_transition(&self, transition: &SafetyTransition);
}

/// Default notifier: drops every transition after a debug-level log line.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_safety_transition(&self, transition: &SafetyTransition) {
        tracing::debug!(
            from = transition.from_mode.as_str(),
            to = transition.to_mode.as_str(),
            reason_code = %transition.reason_code,
            "safety transition (no notifier backend configured)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_does_not_panic() {
        let notifier = NoopNotifier;
        notifier
            .notify_safety_transition(&SafetyTransition {
                from_mode: SafetyMode::ArmedLive,
                to_mode: SafetyMode::Halt,
                reason_code: "RECONCILE_CRITICAL".to_string(),
                reason_message: "drift exceeded".to_string(),
                timestamp_ms: 1_000,
            })
            .await;
    }
}
