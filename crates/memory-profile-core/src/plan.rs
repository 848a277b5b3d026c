use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{content_hash, MemoryEntry};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeAction {
    Add,
    Update,
    Noop,
    SkipUserEdited,
    SkipConflict,
    Deprecate,
}

impl MergeAction {
    pub const ALL: [Self; 6] = [
        Self::Add,
        Self::Update,
        Self::Noop,
        Self::SkipUserEdited,
        Self::SkipConflict,
        Self::Deprecate,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Noop => "NOOP",
            Self::SkipUserEdited => "SKIP_USER_EDITED",
            Self::SkipConflict => "SKIP_CONFLICT",
            Self::Deprecate => "DEPRECATE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == value)
    }

    /// ADD and UPDATE are the only actions that produce new records.
    #[must_use]
    pub fn writes(self) -> bool {
        matches!(self, Self::Add | Self::Update)
    }
}

/// Why a plan was requested. Only changes the recorded reason strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Run,
    Reapply,
    Upgrade,
}

impl PlanMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Reapply => "reapply",
            Self::Upgrade => "upgrade",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(Self::Run),
            "reapply" => Some(Self::Reapply),
            "upgrade" => Some(Self::Upgrade),
            _ => None,
        }
    }

    fn update_reason(self) -> &'static str {
        match self {
            Self::Upgrade => "version-delta",
            Self::Run | Self::Reapply => "reapply-delta",
        }
    }

    fn deprecate_reason(self) -> &'static str {
        match self {
            Self::Upgrade => "removed-in-target-version",
            Self::Run | Self::Reapply => "absent-in-reapply-set",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanAction {
    pub action: MergeAction,
    pub managed_key: String,
    pub reason: String,
    pub current: Option<MemoryEntry>,
    pub desired: Option<MemoryEntry>,
}

/// Occurrences per action. Every action is always serialized, zero or not.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionCounts {
    #[serde(rename = "ADD", default)]
    pub add: usize,
    #[serde(rename = "UPDATE", default)]
    pub update: usize,
    #[serde(rename = "NOOP", default)]
    pub noop: usize,
    #[serde(rename = "SKIP_USER_EDITED", default)]
    pub skip_user_edited: usize,
    #[serde(rename = "SKIP_CONFLICT", default)]
    pub skip_conflict: usize,
    #[serde(rename = "DEPRECATE", default)]
    pub deprecate: usize,
}

impl ActionCounts {
    #[must_use]
    pub fn tally<'a>(actions: impl IntoIterator<Item = &'a PlanAction>) -> Self {
        let mut counts = Self::default();
        for action in actions {
            counts.record(action.action);
        }
        counts
    }

    pub fn record(&mut self, action: MergeAction) {
        *self.slot(action) += 1;
    }

    #[must_use]
    pub fn get(&self, action: MergeAction) -> usize {
        match action {
            MergeAction::Add => self.add,
            MergeAction::Update => self.update,
            MergeAction::Noop => self.noop,
            MergeAction::SkipUserEdited => self.skip_user_edited,
            MergeAction::SkipConflict => self.skip_conflict,
            MergeAction::Deprecate => self.deprecate,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        MergeAction::ALL.into_iter().map(|action| self.get(action)).sum()
    }

    fn slot(&mut self, action: MergeAction) -> &mut usize {
        match action {
            MergeAction::Add => &mut self.add,
            MergeAction::Update => &mut self.update,
            MergeAction::Noop => &mut self.noop,
            MergeAction::SkipUserEdited => &mut self.skip_user_edited,
            MergeAction::SkipConflict => &mut self.skip_conflict,
            MergeAction::Deprecate => &mut self.deprecate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergePlan {
    pub mode: PlanMode,
    pub actions: Vec<PlanAction>,
    pub counts: ActionCounts,
}

impl MergePlan {
    pub fn actions_of(&self, action: MergeAction) -> impl Iterator<Item = &PlanAction> {
        self.actions.iter().filter(move |candidate| candidate.action == action)
    }

    #[must_use]
    pub fn action_for(&self, managed_key: &str) -> Option<&PlanAction> {
        self.actions.iter().find(|candidate| candidate.managed_key == managed_key)
    }

    /// True when applying the plan would write at least one record.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        self.counts.add + self.counts.update > 0
    }
}

/// Entries keyed by managed key, first occurrence wins, insertion order kept.
struct KeyedEntries<'a> {
    order: Vec<String>,
    by_key: BTreeMap<String, &'a MemoryEntry>,
}

impl<'a> KeyedEntries<'a> {
    fn build(entries: impl IntoIterator<Item = &'a MemoryEntry>) -> Self {
        let mut keyed = Self { order: Vec::new(), by_key: BTreeMap::new() };
        for entry in entries {
            let managed_key = entry.managed_key();
            if keyed.by_key.contains_key(&managed_key) {
                continue;
            }
            keyed.by_key.insert(managed_key.clone(), entry);
            keyed.order.push(managed_key);
        }
        keyed
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &'a MemoryEntry)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.by_key.get(key).map(|entry| (key.as_str(), *entry)))
    }
}

fn action(
    action: MergeAction,
    managed_key: &str,
    reason: &str,
    current: Option<&MemoryEntry>,
    desired: Option<&MemoryEntry>,
) -> PlanAction {
    PlanAction {
        action,
        managed_key: managed_key.to_string(),
        reason: reason.to_string(),
        current: current.cloned(),
        desired: desired.cloned(),
    }
}

/// Classify every desired entry and every current managed entry.
///
/// Pure: nothing is written. Desired entries are visited in first-occurrence
/// order, then current managed keys missing from `desired` are deprecated.
/// A user edit on the current entry outranks every other outcome for its key.
#[must_use]
pub fn plan(current: &[MemoryEntry], desired: &[MemoryEntry], mode: PlanMode) -> MergePlan {
    let current_managed = KeyedEntries::build(current.iter().filter(|entry| entry.is_managed()));
    let desired_keyed = KeyedEntries::build(desired);
    let unmanaged_hashes = current
        .iter()
        .filter(|entry| !entry.is_managed())
        .map(content_hash)
        .collect::<BTreeSet<_>>();

    let mut actions = Vec::with_capacity(desired_keyed.order.len());

    for (managed_key, wanted) in desired_keyed.iter() {
        let Some(existing) = current_managed.by_key.get(managed_key).copied() else {
            if unmanaged_hashes.contains(&content_hash(wanted)) {
                actions.push(action(
                    MergeAction::SkipConflict,
                    managed_key,
                    "semantic-duplicate-unmanaged",
                    None,
                    Some(wanted),
                ));
            } else {
                actions.push(action(
                    MergeAction::Add,
                    managed_key,
                    "missing-managed-entry",
                    None,
                    Some(wanted),
                ));
            }
            continue;
        };

        let (kind, reason) = if existing.is_user_edited() {
            (MergeAction::SkipUserEdited, "managed-entry-modified-by-user")
        } else if content_hash(existing) == content_hash(wanted) {
            (MergeAction::Noop, "content-unchanged")
        } else {
            (MergeAction::Update, mode.update_reason())
        };
        actions.push(action(kind, managed_key, reason, Some(existing), Some(wanted)));
    }

    for (managed_key, existing) in current_managed.iter() {
        if desired_keyed.by_key.contains_key(managed_key) {
            continue;
        }
        actions.push(action(
            MergeAction::Deprecate,
            managed_key,
            mode.deprecate_reason(),
            Some(existing),
            None,
        ));
    }

    let counts = ActionCounts::tally(&actions);
    tracing::debug!(
        mode = mode.as_str(),
        add = counts.add,
        update = counts.update,
        noop = counts.noop,
        skip_user_edited = counts.skip_user_edited,
        skip_conflict = counts.skip_conflict,
        deprecate = counts.deprecate,
        "merge plan computed"
    );

    MergePlan { mode, actions, counts }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::fields;

    fn entry(value: Value) -> MemoryEntry {
        match MemoryEntry::from_value(value) {
            Some(entry) => entry,
            None => panic!("fixture must be a JSON object"),
        }
    }

    fn managed(value: Value) -> MemoryEntry {
        let record = entry(value).with(fields::MANAGED, true);
        let hash = content_hash(&record);
        record.with(fields::CONTENT_HASH, hash.clone()).with(fields::MANAGED_BASELINE_HASH, hash)
    }

    fn only_action(plan: &MergePlan) -> &PlanAction {
        assert_eq!(plan.actions.len(), 1, "expected exactly one action: {plan:#?}");
        &plan.actions[0]
    }

    #[test]
    fn unchanged_reapply_is_a_single_noop() {
        let current = vec![entry(json!({
            "managedKey": "preference:communication.style",
            "contentHash": "abc",
            "managedBaselineHash": "abc",
            "value": "balanced"
        }))];
        let desired = vec![entry(json!({
            "managedKey": "preference:communication.style",
            "value": "balanced"
        }))];

        let plan = plan(&current, &desired, PlanMode::Reapply);
        let only = only_action(&plan);
        assert_eq!(only.action, MergeAction::Noop);
        assert_eq!(only.managed_key, "preference:communication.style");
        assert_eq!(plan.counts, ActionCounts { noop: 1, ..ActionCounts::default() });
    }

    #[test]
    fn user_edit_is_skipped_regardless_of_desired_content() {
        let current = vec![entry(json!({
            "type": "behavior",
            "managed": true,
            "managedKey": "behavior:do:ask-before-risky-external-actions",
            "managedBaselineHash": "seed",
            "contentHash": "user-edited",
            "text": "Always ask me first"
        }))];

        for text in ["Ask before risky external actions", "Always ask me first", ""] {
            let desired = vec![entry(json!({
                "type": "behavior",
                "key": "do:ask-before-risky-external-actions",
                "text": text
            }))];
            let plan = plan(&current, &desired, PlanMode::Upgrade);
            let only = only_action(&plan);
            assert_eq!(only.action, MergeAction::SkipUserEdited);
            assert_eq!(only.reason, "managed-entry-modified-by-user");
        }
    }

    #[test]
    fn missing_key_is_added() {
        let desired = vec![entry(json!({
            "type": "context",
            "key": "proactiveCadence",
            "value": "weekly"
        }))];

        let plan = plan(&[], &desired, PlanMode::Upgrade);
        let only = only_action(&plan);
        assert_eq!(only.action, MergeAction::Add);
        assert_eq!(only.managed_key, "context:proactiveCadence");
        assert!(only.current.is_none());
        assert!(only.desired.is_some());
    }

    #[test]
    fn unmanaged_duplicate_blocks_add() {
        let current = vec![entry(json!({
            "id": "01J0000000000000000000USER",
            "type": "preference",
            "category": "communication",
            "value": "balanced"
        }))];
        let desired = vec![entry(json!({
            "type": "preference",
            "category": "communication",
            "key": "communication.style",
            "value": "balanced"
        }))];

        let keyed = plan(&current, &desired, PlanMode::Run);
        // key field makes the desired content differ from the user entry
        assert_eq!(only_action(&keyed).action, MergeAction::Add);

        let desired_same_payload = vec![entry(json!({
            "type": "preference",
            "category": "communication",
            "value": "balanced",
            "managedKey": "preference:communication.style"
        }))];
        let duplicate = plan(&current, &desired_same_payload, PlanMode::Run);
        let only = only_action(&duplicate);
        assert_eq!(only.action, MergeAction::SkipConflict);
        assert_eq!(only.reason, "semantic-duplicate-unmanaged");
    }

    #[test]
    fn managed_duplicate_elsewhere_does_not_conflict() {
        let current = vec![managed(json!({
            "type": "preference",
            "managedKey": "preference:other",
            "value": "balanced"
        }))];
        let desired = vec![entry(json!({
            "type": "preference",
            "managedKey": "preference:communication.style",
            "value": "balanced"
        }))];

        let plan = plan(&current, &desired, PlanMode::Run);
        assert_eq!(plan.counts.add, 1);
        assert_eq!(plan.counts.deprecate, 1);
        assert_eq!(plan.counts.skip_conflict, 0);
    }

    #[test]
    fn changed_content_updates_with_mode_reason() {
        let current = vec![managed(json!({
            "type": "preference",
            "key": "communication.style",
            "value": "balanced"
        }))];
        let desired = vec![entry(json!({
            "type": "preference",
            "key": "communication.style",
            "value": "concise"
        }))];

        let upgrade = plan(&current, &desired, PlanMode::Upgrade);
        assert_eq!(only_action(&upgrade).action, MergeAction::Update);
        assert_eq!(only_action(&upgrade).reason, "version-delta");

        let reapply = plan(&current, &desired, PlanMode::Reapply);
        assert_eq!(only_action(&reapply).action, MergeAction::Update);
        assert_eq!(only_action(&reapply).reason, "reapply-delta");

        let run = plan(&current, &desired, PlanMode::Run);
        assert_eq!(only_action(&run).reason, "reapply-delta");
    }

    #[test]
    fn removed_keys_are_deprecated_after_desired_actions() {
        let current = vec![
            managed(json!({ "type": "context", "key": "timezone", "value": "UTC" })),
            managed(json!({ "type": "context", "key": "locale", "value": "en" })),
        ];
        let desired = vec![entry(json!({ "type": "context", "key": "locale", "value": "en" }))];

        let upgrade = plan(&current, &desired, PlanMode::Upgrade);
        let kinds = upgrade.actions.iter().map(|item| item.action).collect::<Vec<_>>();
        assert_eq!(kinds, vec![MergeAction::Noop, MergeAction::Deprecate]);
        let deprecated = &upgrade.actions[1];
        assert_eq!(deprecated.managed_key, "context:timezone");
        assert_eq!(deprecated.reason, "removed-in-target-version");
        assert!(deprecated.desired.is_none());

        let reapply = plan(&current, &desired, PlanMode::Reapply);
        assert_eq!(reapply.actions[1].reason, "absent-in-reapply-set");
    }

    #[test]
    fn mode_never_changes_the_chosen_action() {
        let current = vec![
            managed(json!({ "type": "context", "key": "a", "value": 1 })),
            managed(json!({ "type": "context", "key": "b", "value": 1 })),
            entry(json!({ "type": "note", "text": "mine" })),
        ];
        let desired = vec![
            entry(json!({ "type": "context", "key": "a", "value": 2 })),
            entry(json!({ "type": "context", "key": "c", "value": 3 })),
            entry(json!({ "type": "note", "text": "mine" })),
        ];

        let kinds = |mode| {
            plan(&current, &desired, mode)
                .actions
                .into_iter()
                .map(|item| (item.managed_key, item.action))
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(PlanMode::Run), kinds(PlanMode::Reapply));
        assert_eq!(kinds(PlanMode::Run), kinds(PlanMode::Upgrade));
    }

    #[test]
    fn first_occurrence_wins_on_key_collision() {
        let current = vec![
            managed(json!({ "type": "context", "key": "tz", "value": "UTC" })),
            managed(json!({ "type": "context", "key": "tz", "value": "CET" })),
        ];
        let desired = vec![
            entry(json!({ "type": "context", "key": "tz", "value": "UTC" })),
            entry(json!({ "type": "context", "key": "tz", "value": "PST" })),
        ];

        let plan = plan(&current, &desired, PlanMode::Reapply);
        let only = only_action(&plan);
        assert_eq!(only.action, MergeAction::Noop);
    }

    #[test]
    fn unmanaged_entries_are_never_deprecated() {
        let current = vec![entry(json!({ "type": "user", "text": "Call me Sam" }))];
        let plan = plan(&current, &[], PlanMode::Upgrade);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.counts.total(), 0);
    }

    #[test]
    fn counts_serialize_every_action_name() {
        let value = match serde_json::to_value(ActionCounts { add: 2, ..ActionCounts::default() }) {
            Ok(value) => value,
            Err(err) => panic!("counts should serialize: {err}"),
        };
        assert_eq!(
            value,
            json!({
                "ADD": 2,
                "UPDATE": 0,
                "NOOP": 0,
                "SKIP_USER_EDITED": 0,
                "SKIP_CONFLICT": 0,
                "DEPRECATE": 0
            })
        );
    }

    #[test]
    fn action_names_round_trip_through_parse() {
        for action in MergeAction::ALL {
            assert_eq!(MergeAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(MergeAction::parse("REMOVE"), None);
        assert_eq!(PlanMode::parse("upgrade"), Some(PlanMode::Upgrade));
        assert_eq!(PlanMode::parse("diff"), None);
    }
}
