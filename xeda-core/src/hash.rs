//! Deterministic content hashing over arbitrary nested settings.
//!
//! `semantic_hash` canonicalizes maps by key order (so structurally-equal
//! maps with differently-ordered keys hash identically) while treating
//! lists/tuples positionally. `deep_hash` is the lightweight sibling used
//! to deduplicate candidate settings inside a DSE batch.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::Value;
use sha3::{Digest, Sha3_256};

/// Builds a canonical string form of `value`: map keys sorted, list order
/// preserved, leaves stringified. Two values with the same canonical form
/// are considered structurally equivalent.
fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(key);
                out.push_str("\":");
                canonicalize(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA3-256 hex digest of the canonical representation of `value`.
///
/// Same input produces the same digest regardless of process or map
/// insertion order; list order always matters.
pub fn semantic_hash(value: &Value) -> String {
    let mut canonical = String::new();
    canonicalize(value, &mut canonical);
    let mut hasher = Sha3_256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Convenience: hash anything serializable the same way `semantic_hash`
/// hashes a `serde_json::Value`.
pub fn semantic_hash_of<T: serde::Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).expect("value must be representable as JSON");
    semantic_hash(&v)
}

/// A frozen, order-independent-for-maps form suitable for feeding to a
/// standard [`Hasher`]. Mirrors the canonical string but avoids allocating
/// a full string for the common case of deduplicating DSE batches.
enum Frozen {
    Leaf(String),
    List(Vec<Frozen>),
    Map(Vec<(String, Frozen)>),
}

fn freeze(value: &Value) -> Frozen {
    match value {
        Value::Array(items) => Frozen::List(items.iter().map(freeze).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(String, Frozen)> =
                map.iter().map(|(k, v)| (k.clone(), freeze(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Frozen::Map(entries)
        }
        other => Frozen::Leaf(other.to_string()),
    }
}

impl Hash for Frozen {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Frozen::Leaf(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Frozen::List(items) => {
                1u8.hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            Frozen::Map(entries) => {
                2u8.hash(state);
                for (k, v) in entries {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

/// Lightweight 64-bit hash used to deduplicate candidate settings within a
/// single DSE batch (see `dse::optimizer`). Not cryptographically strong
/// and not guaranteed stable across Rust versions; only used within a
/// single process's lifetime.
pub fn deep_hash<T: serde::Serialize>(value: &T) -> u64 {
    let v = serde_json::to_value(value).expect("value must be representable as JSON");
    let frozen = freeze(&v);
    let mut hasher = DefaultHasher::new();
    frozen.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_key_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(semantic_hash(&a), semantic_hash(&b));
    }

    #[test]
    fn list_order_does_affect_hash() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(semantic_hash(&a), semantic_hash(&b));
    }

    #[test]
    fn nested_structural_equivalence() {
        let a = json!({"x": [1, {"p": 1, "q": 2}], "y": "z"});
        let b = json!({"y": "z", "x": [1, {"q": 2, "p": 1}]});
        assert_eq!(semantic_hash(&a), semantic_hash(&b));
    }

    #[test]
    fn deep_hash_matches_semantic_equivalence() {
        let a = json!({"a": 1, "b": [1, 2]});
        let b = json!({"b": [1, 2], "a": 1});
        assert_eq!(deep_hash(&a), deep_hash(&b));
    }

    #[test]
    fn deep_hash_distinguishes_list_order() {
        let a = json!({"v": [1, 2]});
        let b = json!({"v": [2, 1]});
        assert_ne!(deep_hash(&a), deep_hash(&b));
    }
}
