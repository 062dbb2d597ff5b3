//! Canonical JSON Serialization
//!
//! Provides deterministic JSON serialization for ledger entries so that
//! every writer and verifier of a chain computes identical bytes.
//!
//! # Canonical Format
//!
//! 1. **Key Ordering**: Object keys sorted lexicographically (Unicode code
//!    point order)
//! 2. **No Whitespace**: Compact representation, no spaces or newlines
//! 3. **No Null Values**: Absent fields are omitted, never emitted as null
//! 4. **Number Format**: Integers without fractional part; floats in
//!    shortest round-trip form
//! 5. **Strings**: Minimal JSON escaping
//!
//! The entry hash is the SHA-256 of these bytes, so any drift here breaks
//! verification of every chain written before the change.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid JSON structure: {0}")]
    InvalidStructure(String),
}

pub type Result<T> = std::result::Result<T, CanonicalJsonError>;

/// Serialize value to canonical JSON string
///
/// Keys are sorted lexicographically, no whitespace, nulls omitted.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let json_value = serde_json::to_value(value)?;
    let canonical = canonicalize_value(json_value);
    Ok(serde_json::to_string(&canonical)?)
}

/// Compute the SHA-256 of the canonical JSON representation, as lowercase hex
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String> {
    let canonical_json = to_canonical_json(value)?;
    Ok(sha256_hex(canonical_json.as_bytes()))
}

/// SHA-256 of raw bytes as 64-char lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonicalize a JSON value recursively
fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            // BTreeMap gives sorted keys; nulls are dropped entirely
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in map {
                if !v.is_null() {
                    sorted.insert(k, canonicalize_value(v));
                }
            }

            let mut canonical_map = Map::new();
            for (k, v) in sorted {
                canonical_map.insert(k, v);
            }

            Value::Object(canonical_map)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize_value).collect()),
        Value::Number(n) => {
            // Integer-valued floats collapse to integers; true integers
            // pass through untouched so u64 range is preserved
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < (1u64 << 53) as f64 {
                        return Value::Number(serde_json::Number::from(f as i64));
                    }
                }
            }
            Value::Number(n)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Serialize)]
    struct TestEntry {
        task: String,
        id: u64,
        contributor_agent: String,
    }

    #[test]
    fn test_key_ordering() {
        let entry = TestEntry {
            task: "QUASI-001".to_string(),
            id: 2,
            contributor_agent: "alice".to_string(),
        };

        let out = to_canonical_json(&entry).unwrap();

        // Keys sorted: contributor_agent, id, task
        assert_eq!(
            out,
            r#"{"contributor_agent":"alice","id":2,"task":"QUASI-001"}"#
        );
    }

    #[test]
    fn test_no_whitespace() {
        let value = json!({"b": [1, 2], "a": {"y": true, "x": "s"}});
        let out = to_canonical_json(&value).unwrap();
        assert!(!out.contains(' '));
        assert!(!out.contains('\n'));
    }

    #[test]
    fn test_null_values_omitted() {
        let value = json!({"present": "value", "commit_hash": null});
        let out = to_canonical_json(&value).unwrap();
        assert!(!out.contains("commit_hash"));
        assert!(out.contains("present"));
    }

    #[test]
    fn test_nested_objects_sorted() {
        let value = json!({
            "z_field": "last",
            "a_field": "first",
            "nested": {"z_inner": 2, "a_inner": 1}
        });

        let out = to_canonical_json(&value).unwrap();
        assert!(out.starts_with(r#"{"a_field":"#));
        assert!(out.contains(r#"{"a_inner":1,"z_inner":2}"#));
    }

    #[test]
    fn test_array_order_preserved() {
        let value = json!({"items": [3, 1, 4, 1, 5]});
        let out = to_canonical_json(&value).unwrap();
        assert!(out.contains("[3,1,4,1,5]"));
    }

    #[test]
    fn test_large_integers_survive() {
        let value = json!({"n": 9_007_199_254_740_993u64});
        let out = to_canonical_json(&value).unwrap();
        assert_eq!(out, r#"{"n":9007199254740993}"#);
    }

    #[test]
    fn test_deterministic_hash() {
        let a = json!({"task": "QUASI-001", "id": 2});
        let b = json!({"id": 2, "task": "QUASI-001"});

        assert_eq!(
            canonical_hash_hex(&a).unwrap(),
            canonical_hash_hex(&b).unwrap()
        );
    }

    #[test]
    fn test_different_values_different_hashes() {
        let a = json!({"id": 1});
        let b = json!({"id": 2});
        assert_ne!(
            canonical_hash_hex(&a).unwrap(),
            canonical_hash_hex(&b).unwrap()
        );
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_unicode_passthrough() {
        let value = json!({"title": "Ehrenfest \u{2014} schéma"});
        let out = to_canonical_json(&value).unwrap();
        assert!(out.contains("schéma"));
    }
}
