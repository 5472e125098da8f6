//! Deterministic fingerprint of a phase configuration.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cascade::PhaseDef;

/// SHA-256 (hex) over the canonical JSON of the phase definition.
///
/// Any change to the phase (instructions, tools, soundings, wards, ...)
/// yields a different species, which starts a fresh winner lineage.
pub fn species_hash(phase: &PhaseDef) -> String {
    let value = serde_json::to_value(phase).unwrap_or(Value::Null);
    let canonical = canonicalize(value).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively sort object keys.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
