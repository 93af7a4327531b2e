//! Client-order-id minting, grounded on
//! `original_source/src/hyperliquid/common/idempotency.py`.

use rand::RngCore;

use crate::types::Sym;

const CLIENT_ORDER_ID_MAX_LEN: usize = 36;

/// 4 random bytes, hex-encoded, mirroring `secrets.token_hex(4)`.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Splits `hl-<tx_hash>-<event_index>-<symbol>[-close|-open]` into its
/// tx_hash and event_index components.
pub fn parse_correlation_id(correlation_id: &str) -> Option<(&str, i64)> {
    let parts: Vec<&str> = correlation_id.split('-').collect();
    if parts.len() < 4 || parts[0] != "hl" {
        return None;
    }
    let event_index = parts[2].parse().ok()?;
    Some((parts[1], event_index))
}

/// Strips everything but `[A-Za-z0-9_-]`, then truncates by keeping the
/// `hl-` prefix and the trailing `(max_len-3)` characters when over length.
pub fn sanitize_client_order_id(value: &str, max_len: usize) -> String {
    let cleaned: String = value.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').collect();
    if cleaned.chars().count() <= max_len {
        return cleaned;
    }
    if max_len <= 3 {
        return cleaned.chars().take(max_len).collect();
    }
    let keep = max_len - 3;
    let tail: String = cleaned.chars().rev().take(keep).collect::<Vec<_>>().into_iter().rev().collect();
    format!("hl-{tail}")
}

pub fn build_client_order_id(correlation_id: &str, symbol: &Sym, nonce: &str, max_len: usize) -> Option<String> {
    let (tx_hash, event_index) = parse_correlation_id(correlation_id)?;
    let raw = format!("hl-{tx_hash}-{event_index}-{}-{nonce}", symbol.as_str());
    Some(sanitize_client_order_id(&raw, max_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_correlation_id() {
        let (tx_hash, event_index) = parse_correlation_id("hl-0xabc-2-BTC-close").unwrap();
        assert_eq!(tx_hash, "0xabc");
        assert_eq!(event_index, 2);
    }

    #[test]
    fn rejects_malformed_correlation_id() {
        assert!(parse_correlation_id("not-a-valid-id").is_none());
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_client_order_id("hl-0x!!abc-2-BTC", 36), "hl-0xabc-2-BTC");
    }

    #[test]
    fn sanitize_truncates_by_keeping_prefix_and_tail() {
        let long = "hl-".to_string() + &"a".repeat(50);
        let sanitized = sanitize_client_order_id(&long, 36);
        assert_eq!(sanitized.len(), 36);
        assert!(sanitized.starts_with("hl-"));
        assert!(long.ends_with(&sanitized[3..]));
    }

    #[test]
    fn build_client_order_id_roundtrips_through_correlation_id() {
        let id = build_client_order_id("hl-0xabc-2-BTC-close", &Sym::new("BTC"), "deadbeef", 36).unwrap();
        assert_eq!(id, "hl-0xabc-2-BTC-deadbeef");
    }
}
