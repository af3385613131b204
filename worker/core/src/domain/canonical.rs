// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Canonical JSON
//!
//! Deterministic byte encoding used for everything that is signed or
//! hashed: object keys sorted by code point, no insignificant whitespace,
//! integers only. The output does not depend on how the input maps were
//! built, so independent signers and verifiers compute identical bytes.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::metadata::MetadataError;

/// Encode any serializable value canonically
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, MetadataError> {
    let value = serde_json::to_value(value).map_err(|e| MetadataError::Encoding(e.to_string()))?;
    encode_value(&value)
}

/// Encode a JSON value canonically
pub fn encode_value(value: &Value) -> Result<Vec<u8>, MetadataError> {
    let mut out = Vec::with_capacity(256);
    write_value(&mut out, value, "$")?;
    Ok(out)
}

/// Hex SHA-256 of `bytes`
/// Path of the first number in `value` that is not an integer
pub fn first_float(value: &Value) -> Option<String> {
    fn walk(value: &Value, path: String) -> Option<String> {
        match value {
            Value::Number(n) if !(n.is_i64() || n.is_u64()) => Some(path),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| walk(item, format!("{}[{}]", path, i))),
            Value::Object(map) => map
                .iter()
                .find_map(|(key, item)| walk(item, format!("{}.{}", path, key))),
            _ => None,
        }
    }
    walk(value, "$".to_string())
}

pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_value(out: &mut Vec<u8>, value: &Value, path: &str) -> Result<(), MetadataError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if !(n.is_i64() || n.is_u64()) {
                return Err(MetadataError::Encoding(format!(
                    "floating point value at {} cannot be canonicalized",
                    path
                )));
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => write_string(out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item, &format!("{}[{}]", path, i))?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key)?;
                out.push(b':');
                write_value(out, item, &format!("{}.{}", path, key))?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), MetadataError> {
    serde_json::to_writer(&mut *out, s).map_err(|e| MetadataError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_keys_are_sorted_and_compact() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let bytes = encode_value(&value).unwrap();
        assert_eq!(bytes, br#"{"a":{"c":"x","d":[1,2]},"b":1}"#.to_vec());
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for i in 0..32 {
            first.insert(format!("key-{}", i), i);
        }
        for i in (0..32).rev() {
            second.insert(format!("key-{}", i), i);
        }

        assert_eq!(
            to_canonical_bytes(&first).unwrap(),
            to_canonical_bytes(&second).unwrap()
        );
    }

    #[test]
    fn test_floats_are_rejected() {
        let err = encode_value(&json!({"ratio": 0.5})).unwrap_err();
        assert!(matches!(err, MetadataError::Encoding(msg) if msg.contains("$.ratio")));
    }

    #[test]
    fn test_first_float_reports_its_path() {
        assert_eq!(first_float(&json!({"a": [1, {"b": 2}]})), None);
        assert_eq!(
            first_float(&json!({"a": [1, {"b": 2.5}]})),
            Some("$.a[1].b".to_string())
        );
    }

    #[test]
    fn test_strings_are_escaped() {
        let bytes = encode_value(&json!("quote\" and \\ slash\n")).unwrap();
        assert_eq!(bytes, br#""quote\" and \\ slash\n""#.to_vec());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
