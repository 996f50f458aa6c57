//! Canonical JSON for fingerprinting and structural comparison. The wire
//! form sorts object keys at every depth and keeps array order; hashes are
//! taken over those bytes so logically equal payloads always collide.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serializes `value` with object keys emitted in sorted order at every
/// depth. Scalars and keys go through the regular serializer so string
/// escaping and number formatting stay byte-stable.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out);
    out
}

pub fn hash_canonical_json(value: &Value) -> String {
    sha256_hex(&canonical_json_bytes(value))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());

            out.push(b'{');
            for (idx, (key, item)) in entries.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String((*key).clone()), out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    match serde_json::to_vec(value) {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(_) => out.extend_from_slice(b"null"),
    }
}

/// Structural equality: objects compare by key set regardless of insertion
/// order, arrays compare positionally, scalars compare by value.
pub fn json_structurally_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left.iter().all(|(key, value)| {
                    right
                        .get(key)
                        .is_some_and(|other| json_structurally_equal(value, other))
                })
        }
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right.iter())
                    .all(|(x, y)| json_structurally_equal(x, y))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canonical_string(value: &Value) -> String {
        String::from_utf8(canonical_json_bytes(value)).expect("canonical bytes are utf-8")
    }

    #[test]
    fn object_keys_sort_at_every_depth() {
        let value = json!({"b": 1, "a": {"d": 4, "c": 3}});
        assert_eq!(canonical_string(&value), r#"{"a":{"c":3,"d":4},"b":1}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let value = json!({"a": [{"b": 2}, {"a": 1}]});
        assert_eq!(canonical_string(&value), r#"{"a":[{"b":2},{"a":1}]}"#);
    }

    #[test]
    fn keys_and_strings_stay_escaped() {
        let value = json!({"qu\"ote": "line\nbreak"});
        assert_eq!(canonical_string(&value), r#"{"qu\"ote":"line\nbreak"}"#);
    }

    #[test]
    fn hash_is_insensitive_to_key_order() {
        let a = json!({"x": 1, "y": [1, 2], "z": {"k": true}});
        let b = json!({"z": {"k": true}, "y": [1, 2], "x": 1});
        assert_eq!(hash_canonical_json(&a), hash_canonical_json(&b));
        assert_ne!(
            hash_canonical_json(&a),
            hash_canonical_json(&json!({"x": 1, "y": [2, 1], "z": {"k": true}}))
        );
    }

    #[test]
    fn structural_equality_ignores_key_order() {
        let a = json!({"x": 1, "y": [1, 2]});
        let b = json!({"y": [1, 2], "x": 1});
        assert!(json_structurally_equal(&a, &b));
        assert!(!json_structurally_equal(&a, &json!({"x": 1, "y": [2, 1]})));
        assert!(!json_structurally_equal(&a, &json!({"x": 1})));
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
