use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod apply;
mod fold;
mod hash;
mod key;
mod pack;
mod plan;
mod profile;

pub use apply::{apply, format_timestamp, ApplyResult};
pub use fold::fold_entries;
pub use hash::{canonical_json, content_hash, deterministic_id, BOOKKEEPING_FIELDS};
pub use key::{derive_key, normalize_key, slugify};
pub use pack::{version_ordinal, PackRegistry, ProfilePack, PERSONAL_ASSISTANT};
pub use plan::{plan, ActionCounts, MergeAction, MergePlan, PlanAction, PlanMode};
pub use profile::{
    apply_profile_plan, installed_version, plan_profile, profile_source, stamp_pack_entries,
    ProfilePlan, PROFILE_SOURCE_PREFIX,
};

/// Well-known field names read and written by the reconciliation engine.
pub mod fields {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const KEY: &str = "key";
    pub const CATEGORY: &str = "category";
    pub const TEXT: &str = "text";
    pub const CREATED: &str = "created";
    pub const MANAGED: &str = "managed";
    pub const MANAGED_KEY: &str = "managedKey";
    pub const CONTENT_HASH: &str = "contentHash";
    pub const MANAGED_BASELINE_HASH: &str = "managedBaselineHash";
    pub const SOURCE: &str = "source";
    pub const SOURCE_VERSION: &str = "sourceVersion";
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProfileError {
    #[error("unknown profile pack: {profile_id}@{version}")]
    UnknownPack { profile_id: String, version: String },
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
}

/// One memory atom: an open mapping from field name to JSON value.
///
/// The engine only interprets the names in [`fields`]. Every accessor treats a
/// missing or wrongly typed field as absent, so partially shaped input coming
/// from a hand-edited log never raises.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct MemoryEntry(Map<String, Value>);

impl MemoryEntry {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value, returning `None` unless it is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// String field with surrounding whitespace removed; blank strings are `None`.
    #[must_use]
    pub fn non_empty_str(&self, field: &str) -> Option<&str> {
        self.get_str(field).map(str::trim).filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.0.get(field).and_then(Value::as_bool)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    #[must_use]
    pub fn entry_type(&self) -> Option<&str> {
        self.non_empty_str(fields::TYPE)
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.non_empty_str(fields::ID)
    }

    /// True when the entry is under reconciliation control: flagged `managed`
    /// or already carrying a non-empty `managedKey`.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.get_bool(fields::MANAGED).unwrap_or(false)
            || self.non_empty_str(fields::MANAGED_KEY).is_some()
    }

    /// Stored `managedKey`, or the key derived from type/category/key/text.
    #[must_use]
    pub fn managed_key(&self) -> String {
        if let Some(stored) = self.non_empty_str(fields::MANAGED_KEY) {
            return stored.to_string();
        }
        derive_key(
            self.entry_type(),
            self.get_str(fields::CATEGORY),
            self.get_str(fields::KEY),
            self.get_str(fields::TEXT),
        )
    }

    /// Stored `contentHash` when present, otherwise recomputed from content.
    #[must_use]
    pub fn current_hash(&self) -> String {
        self.non_empty_str(fields::CONTENT_HASH)
            .map_or_else(|| content_hash(self), ToString::to_string)
    }

    #[must_use]
    pub fn baseline_hash(&self) -> Option<&str> {
        self.non_empty_str(fields::MANAGED_BASELINE_HASH)
    }

    /// An entry is user-edited when it has a baseline and its current hash no
    /// longer matches it.
    #[must_use]
    pub fn is_user_edited(&self) -> bool {
        self.baseline_hash().is_some_and(|baseline| baseline != self.current_hash())
    }
}

impl From<Map<String, Value>> for MemoryEntry {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<MemoryEntry> for Value {
    fn from(entry: MemoryEntry) -> Self {
        Value::Object(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(value: Value) -> MemoryEntry {
        match MemoryEntry::from_value(value) {
            Some(entry) => entry,
            None => panic!("fixture must be a JSON object"),
        }
    }

    #[test]
    fn non_object_values_are_rejected() {
        assert!(MemoryEntry::from_value(json!([1, 2])).is_none());
        assert!(MemoryEntry::from_value(json!("text")).is_none());
    }

    #[test]
    fn wrongly_typed_fields_read_as_absent() {
        let record = entry(json!({
            "type": 7,
            "managed": "yes",
            "managedKey": "   ",
            "contentHash": false
        }));

        assert_eq!(record.entry_type(), None);
        assert!(!record.is_managed());
        assert_eq!(record.managed_key(), "entry:generated");
        assert_eq!(record.current_hash(), content_hash(&record));
    }

    #[test]
    fn stored_managed_key_wins_over_derivation() {
        let record = entry(json!({
            "type": "preference",
            "key": "other",
            "managedKey": "preference:communication.style"
        }));
        assert_eq!(record.managed_key(), "preference:communication.style");
        assert!(record.is_managed());
    }

    #[test]
    fn user_edit_requires_a_baseline() {
        let no_baseline = entry(json!({ "contentHash": "abc" }));
        assert!(!no_baseline.is_user_edited());

        let unchanged = entry(json!({ "contentHash": "abc", "managedBaselineHash": "abc" }));
        assert!(!unchanged.is_user_edited());

        let edited = entry(json!({ "contentHash": "def", "managedBaselineHash": "abc" }));
        assert!(edited.is_user_edited());
    }

    #[test]
    fn user_edit_falls_back_to_recomputed_hash() {
        let base = entry(json!({ "type": "context", "value": "weekly" }));
        let baseline = content_hash(&base);

        let untouched = base.clone().with(fields::MANAGED_BASELINE_HASH, baseline.clone());
        assert!(!untouched.is_user_edited());

        let edited = entry(json!({ "type": "context", "value": "daily" }))
            .with(fields::MANAGED_BASELINE_HASH, baseline);
        assert!(edited.is_user_edited());
    }
}
