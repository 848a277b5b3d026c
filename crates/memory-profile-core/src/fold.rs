use std::collections::BTreeMap;

use crate::{content_hash, MemoryEntry};

/// Collapse an append-only sequence to the latest record per natural key.
///
/// A managed entry is keyed by its managed key, any other entry by `id`,
/// else by its content hash. A later write replaces the earlier one in
/// place, so the result keeps first-appearance order.
#[must_use]
pub fn fold_entries(records: &[MemoryEntry]) -> Vec<MemoryEntry> {
    let mut positions: BTreeMap<String, usize> = BTreeMap::new();
    let mut folded: Vec<MemoryEntry> = Vec::with_capacity(records.len());

    for record in records {
        let natural_key = natural_key(record);
        if let Some(&index) = positions.get(&natural_key) {
            if let Some(slot) = folded.get_mut(index) {
                *slot = record.clone();
            }
            continue;
        }
        positions.insert(natural_key, folded.len());
        folded.push(record.clone());
    }

    folded
}

// Managed ids are derived from the managed key, so keying managed entries by
// that key also merges rows written before they carried an id.
fn natural_key(record: &MemoryEntry) -> String {
    if record.is_managed() {
        return format!("managed:{}", record.managed_key());
    }
    if let Some(id) = record.id() {
        return format!("id:{id}");
    }
    format!("hash:{}", content_hash(record))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn entry(value: Value) -> MemoryEntry {
        match MemoryEntry::from_value(value) {
            Some(entry) => entry,
            None => panic!("fixture must be a JSON object"),
        }
    }

    #[test]
    fn later_write_replaces_in_place() {
        let folded = fold_entries(&[
            entry(json!({ "id": "tone", "value": "warm" })),
            entry(json!({ "id": "tz", "value": "UTC" })),
            entry(json!({ "id": "tone", "value": "direct" })),
        ]);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].get_str("value"), Some("direct"));
        assert_eq!(folded[1].id(), Some("tz"));
    }

    #[test]
    fn managed_key_merges_rows_with_and_without_id() {
        let folded = fold_entries(&[
            entry(json!({ "managed": true, "managedKey": "context:tz", "value": "UTC" })),
            entry(json!({
                "id": "context_0123",
                "managed": true,
                "managedKey": "context:tz",
                "value": "CET"
            })),
        ]);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].get_str("value"), Some("CET"));
        assert_eq!(folded[0].id(), Some("context_0123"));
    }

    #[test]
    fn unmanaged_without_id_folds_by_content() {
        let folded = fold_entries(&[
            entry(json!({ "text": "loose note" })),
            entry(json!({ "text": "other note" })),
            entry(json!({ "text": "loose note", "created": "2026-01-01T00:00:00Z" })),
        ]);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].get_str("created"), Some("2026-01-01T00:00:00Z"));
    }
}
