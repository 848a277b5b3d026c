use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{
    content_hash, deterministic_id, fields, ActionCounts, MemoryEntry, MergePlan, PlanAction,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyResult {
    pub next_records: Vec<MemoryEntry>,
    pub applied_actions: Vec<PlanAction>,
    pub applied_counts: ActionCounts,
}

impl ApplyResult {
    /// Records produced by this apply, i.e. the tail appended after `current`.
    #[must_use]
    pub fn new_records(&self, current_len: usize) -> &[MemoryEntry] {
        self.next_records.get(current_len..).unwrap_or_default()
    }
}

/// RFC 3339 rendering of `now`; years outside the RFC range fall back to the
/// unix timestamp instead of failing.
#[must_use]
pub fn format_timestamp(now: OffsetDateTime) -> String {
    now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Turn the writing actions of `plan` into persistable records.
///
/// `current` is copied, never mutated, and nothing is removed from it:
/// DEPRECATE and both SKIP actions are only reported back.
#[must_use]
pub fn apply(current: &[MemoryEntry], plan: &MergePlan, now: OffsetDateTime) -> ApplyResult {
    let created = format_timestamp(now);
    let mut next_records = current.to_vec();
    let mut applied_actions = Vec::with_capacity(plan.actions.len());

    for planned in &plan.actions {
        let materialized = match (&planned.desired, planned.action.writes()) {
            (Some(desired), true) => materialize(desired, &planned.managed_key, &created),
            _ => {
                applied_actions.push(planned.clone());
                continue;
            }
        };

        next_records.push(materialized.clone());
        applied_actions.push(PlanAction { desired: Some(materialized), ..planned.clone() });
    }

    let applied_counts = ActionCounts::tally(&applied_actions);
    tracing::debug!(
        appended = next_records.len() - current.len(),
        actions = applied_actions.len(),
        "merge plan applied"
    );

    ApplyResult { next_records, applied_actions, applied_counts }
}

fn materialize(desired: &MemoryEntry, managed_key: &str, created: &str) -> MemoryEntry {
    let entry_type = desired.entry_type().unwrap_or("entry").to_string();
    let mut record = desired.clone();
    record.set(fields::ID, deterministic_id(&entry_type, &format!("managed:{managed_key}")));
    record.set(fields::MANAGED, true);
    record.set(fields::MANAGED_KEY, managed_key);
    record.set(fields::CREATED, created);

    let fresh_hash = content_hash(&record);
    record.set(fields::CONTENT_HASH, fresh_hash.clone());
    if record.baseline_hash().is_none() {
        record.set(fields::MANAGED_BASELINE_HASH, fresh_hash);
    }
    record
}
