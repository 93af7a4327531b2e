//! Shared domain types used across every stage of the pipeline.
//!
//! Kept deliberately thin: these are the semantic scalars named in the
//! data model (`Sym`, `Qty`/`Px`, `Ms`, `CorrId`) plus the contract-version
//! check that every event/intent/result carries.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix milliseconds.
pub type Ms = i64;

/// Opaque correlation handle, e.g. `hl-0xabc-2-BTC-close`.
pub type CorrId = String;

/// Decimal-like scalar used for quantities, prices, and drift.
pub type Qty = Decimal;
pub type Px = Decimal;

/// Normalized symbol: trimmed, uppercased, `-` mapped to `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sym(String);

impl Sym {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let normalized = raw.as_ref().trim().to_uppercase().replace('-', "_");
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sym {
    fn from(value: &str) -> Self {
        Sym::new(value)
    }
}

impl From<String> for Sym {
    fn from(value: String) -> Self {
        Sym::new(value)
    }
}

/// The current contract version this crate produces and accepts.
pub const CONTRACT_VERSION: &str = "1.0";

/// Parsed `<major>.<minor>` contract version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractVersion {
    pub major: u32,
    pub minor: u32,
}

impl ContractVersion {
    pub fn parse(raw: &str) -> Result<Self, crate::errors::PipelineError> {
        let mut parts = raw.split('.');
        let major = parts.next();
        let minor = parts.next();
        let rest = parts.next();
        match (major, minor, rest) {
            (Some(major), Some(minor), None) => {
                let major = major
                    .parse()
                    .map_err(|_| crate::errors::PipelineError::ContractMismatch {
                        producer: raw.to_string(),
                        consumer: CONTRACT_VERSION.to_string(),
                    })?;
                let minor = minor
                    .parse()
                    .map_err(|_| crate::errors::PipelineError::ContractMismatch {
                        producer: raw.to_string(),
                        consumer: CONTRACT_VERSION.to_string(),
                    })?;
                Ok(ContractVersion { major, minor })
            }
            _ => Err(crate::errors::PipelineError::ContractMismatch {
                producer: raw.to_string(),
                consumer: CONTRACT_VERSION.to_string(),
            }),
        }
    }

    pub fn current() -> Self {
        Self::parse(CONTRACT_VERSION).expect("CONTRACT_VERSION constant is well-formed")
    }

    /// Producer is compatible with this (consumer) version when majors match
    /// and the producer's minor does not exceed ours.
    pub fn is_compatible_with(&self, consumer: &ContractVersion) -> bool {
        self.major == consumer.major && self.minor <= consumer.minor
    }
}

/// Assert that `producer_version` is compatible with [`CONTRACT_VERSION`].
pub fn assert_contract_version(producer_version: &str) -> Result<(), crate::errors::PipelineError> {
    let producer = ContractVersion::parse(producer_version)?;
    let consumer = ContractVersion::current();
    if producer.is_compatible_with(&consumer) {
        Ok(())
    } else {
        Err(crate::errors::PipelineError::ContractMismatch {
            producer: producer_version.to_string(),
            consumer: CONTRACT_VERSION.to_string(),
        })
    }
}

/// How a position's target net size changed between two events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Increase,
    Decrease,
    Flip,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Increase => "INCREASE",
            ActionType::Decrease => "DECREASE",
            ActionType::Flip => "FLIP",
        }
    }
}

/// A normalized position-delta event, built by Ingest and consumed by
/// Decision. Never mutated after construction (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDeltaEvent {
    pub symbol: Sym,
    pub timestamp_ms: Ms,
    pub tx_hash: String,
    pub event_index: i64,
    pub is_replay: bool,
    pub prev_target_net_position: Qty,
    pub next_target_net_position: Qty,
    pub delta_target_net_position: Qty,
    pub action_type: ActionType,
    pub open_component: Option<Qty>,
    pub close_component: Option<Qty>,
    pub contract_version: String,
}

/// `hl-<tx_hash>-<event_index>-<normalized_symbol>[-close|-open]`.
pub fn correlation_id(tx_hash: &str, event_index: i64, symbol: &Sym, suffix: Option<&str>) -> CorrId {
    match suffix {
        Some(suffix) => format!("hl-{tx_hash}-{event_index}-{}-{suffix}", symbol.as_str()),
        None => format!("hl-{tx_hash}-{event_index}-{}", symbol.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_symbol() {
        assert_eq!(Sym::new(" btc-usd ").as_str(), "BTC_USD");
    }

    #[test]
    fn same_major_lower_minor_is_compatible() {
        assert!(assert_contract_version("1.0").is_ok());
    }

    #[test]
    fn higher_minor_from_producer_is_incompatible() {
        assert!(assert_contract_version("1.5").is_err());
    }

    #[test]
    fn different_major_is_incompatible() {
        assert!(assert_contract_version("2.0").is_err());
    }
}
