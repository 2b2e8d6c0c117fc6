//! Defines the canonical, deterministic JSON codec for all signed state.
//!
//! This module provides simple wrappers around `serde_jcs` (RFC 8785 JSON
//! Canonicalization Scheme): object keys are lexicographically sorted at
//! every nesting level, arrays preserve order, and no insignificant
//! whitespace is emitted. By centralizing the codec here in the base
//! `types` crate we ensure that every component hashing or signing
//! structured data (the audit chain, the multisig controller, the
//! reasoning-graph snapshot signer) agrees byte-for-byte on the input.

use serde::Serialize;

/// Encodes a value into its canonical UTF-8 JSON byte representation.
///
/// This function must be used for any data whose bytes feed a hash or a
/// signature. Two structurally equal values always produce identical
/// output regardless of field declaration or insertion order.
pub fn to_canonical_json<T: Serialize>(v: &T) -> Result<Vec<u8>, String> {
    serde_jcs::to_vec(v).map_err(|e| format!("canonical encode failed: {}", e))
}

/// Convenience wrapper returning the canonical form as a `String`.
pub fn to_canonical_string<T: Serialize>(v: &T) -> Result<String, String> {
    serde_jcs::to_string(v).map_err(|e| format!("canonical encode failed: {}", e))
}

/// Builds the audit-event hash preimage.
///
/// Layout: `event_type ∥ canonical(payload) ∥ prev_hash ∥ ts`, with the
/// previous hash rendered as lowercase hex (empty for the genesis event)
/// and the timestamp as an RFC 3339 string. Field boundaries carry a
/// `0x0a` separator so no field can bleed into its neighbour.
pub fn event_preimage(
    event_type: &str,
    canonical_payload: &[u8],
    prev_hash: Option<&str>,
    ts_rfc3339: &str,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        event_type.len() + canonical_payload.len() + prev_hash.map_or(0, str::len) + ts_rfc3339.len() + 3,
    );
    buf.extend_from_slice(event_type.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(canonical_payload);
    buf.push(b'\n');
    if let Some(prev) = prev_hash {
        buf.extend_from_slice(prev.as_bytes());
    }
    buf.push(b'\n');
    buf.extend_from_slice(ts_rfc3339.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_output_is_key_order_independent() {
        let a = json!({"b": 1, "a": {"z": true, "y": [3, 2, 1]}});
        let b = json!({"a": {"y": [3, 2, 1], "z": true}, "b": 1});

        let ca = to_canonical_json(&a).unwrap();
        let cb = to_canonical_json(&b).unwrap();
        assert_eq!(ca, cb);
        // Sorted keys, no whitespace.
        assert_eq!(
            String::from_utf8(ca).unwrap(),
            r#"{"a":{"y":[3,2,1],"z":true},"b":1}"#
        );
    }

    #[test]
    fn arrays_preserve_order() {
        let v = json!({"seq": [3, 1, 2]});
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"seq":[3,1,2]}"#
        );
    }

    #[test]
    fn preimage_separates_fields() {
        // Shifting bytes between fields must change the preimage.
        let p1 = event_preimage("a.b", b"{}", Some("00ff"), "2026-01-01T00:00:00Z");
        let p2 = event_preimage("a.b{", b"}", Some("00ff"), "2026-01-01T00:00:00Z");
        assert_ne!(p1, p2);
    }

    #[test]
    fn genesis_preimage_has_empty_prev() {
        let p = event_preimage("t", b"{}", None, "ts");
        assert_eq!(p, b"t\n{}\n\nts".to_vec());
    }
}
