use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::MemoryEntry;

/// Top-level fields that describe where and when an entry was written rather
/// than what it says. They never contribute to [`content_hash`].
pub const BOOKKEEPING_FIELDS: [&str; 12] = [
    "id",
    "created",
    "createdAt",
    "updated",
    "updatedAt",
    "timestamp",
    "managed",
    "managedKey",
    "managedBaselineHash",
    "contentHash",
    "source",
    "sourceVersion",
];

const DETERMINISTIC_ID_HEX_LEN: usize = 26;

/// Fingerprint the semantic payload of an entry as lowercase hex SHA-256.
///
/// Bookkeeping fields are dropped first; the remainder is serialized with
/// [`canonical_json`], so insertion order never changes the result.
#[must_use]
pub fn content_hash(entry: &MemoryEntry) -> String {
    let semantic = entry
        .as_map()
        .iter()
        .filter(|(field, _)| !BOOKKEEPING_FIELDS.contains(&field.as_str()))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect::<serde_json::Map<_, _>>();
    let canonical = canonical_json(&Value::Object(semantic));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Serialize a JSON value with object keys sorted at every nesting level.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut members = map.iter().collect::<Vec<_>>();
            members.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
            out.push('{');
            for (index, (field, child)) in members.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(field.clone()).to_string());
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, child) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(child, out);
            }
            out.push(']');
        }
        primitive => out.push_str(&primitive.to_string()),
    }
}

/// Stable persisted id for an entry type and seed, e.g.
/// `deterministic_id("context", "managed:context:proactiveCadence")`.
///
/// The same inputs always produce the same id, which lets the log fold collapse
/// repeated applies of one logical entry into a single row.
#[must_use]
pub fn deterministic_id(entry_type: &str, seed: &str) -> String {
    let entry_type = match entry_type.trim() {
        "" => "entry",
        trimmed => trimmed,
    };
    let mut hasher = Sha256::new();
    hasher.update(entry_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(seed.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{entry_type}_{}", &digest[..DETERMINISTIC_ID_HEX_LEN])
}
