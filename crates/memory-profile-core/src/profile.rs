use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::pack::version_order;
use crate::{
    apply, fields, plan, ApplyResult, MemoryEntry, MergePlan, PackRegistry, PlanMode, ProfileError,
    ProfilePack,
};

pub const PROFILE_SOURCE_PREFIX: &str = "profile:";

#[must_use]
pub fn profile_source(profile_id: &str) -> String {
    format!("{PROFILE_SOURCE_PREFIX}{profile_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePlan {
    pub profile_id: String,
    pub version: String,
    pub plan: MergePlan,
    pub desired_entries: Vec<MemoryEntry>,
    pub current_entries: Vec<MemoryEntry>,
}

/// Copy pack entries and stamp the provenance the planner and applier expect.
#[must_use]
pub fn stamp_pack_entries(pack: &ProfilePack) -> Vec<MemoryEntry> {
    let source = profile_source(&pack.profile_id);
    pack.entries
        .iter()
        .map(|entry| {
            let managed_key = entry.managed_key();
            entry
                .clone()
                .with(fields::MANAGED, true)
                .with(fields::MANAGED_KEY, managed_key)
                .with(fields::SOURCE, source.clone())
                .with(fields::SOURCE_VERSION, pack.version.clone())
        })
        .collect()
}

/// Plan one profile pack against the folded view of the memory log.
///
/// # Errors
/// Returns [`ProfileError::UnknownPack`] when `(profile_id, version)` is not in
/// `registry`; nothing is planned in that case.
pub fn plan_profile(
    registry: &PackRegistry,
    current_raw: &[MemoryEntry],
    profile_id: &str,
    version: &str,
    mode: PlanMode,
) -> Result<ProfilePlan, ProfileError> {
    let pack = registry.get_pack(profile_id, version)?;
    let desired_entries = stamp_pack_entries(&pack);
    let plan = plan(current_raw, &desired_entries, mode);
    Ok(ProfilePlan {
        profile_id: pack.profile_id,
        version: pack.version,
        plan,
        desired_entries,
        current_entries: current_raw.to_vec(),
    })
}

#[must_use]
pub fn apply_profile_plan(
    current_raw: &[MemoryEntry],
    plan: &MergePlan,
    now: OffsetDateTime,
) -> ApplyResult {
    apply(current_raw, plan, now)
}

/// Highest `sourceVersion` among managed entries written for `profile_id`.
#[must_use]
pub fn installed_version(current: &[MemoryEntry], profile_id: &str) -> Option<String> {
    let source = profile_source(profile_id);
    current
        .iter()
        .filter(|entry| {
            entry.is_managed() && entry.get_str(fields::SOURCE) == Some(source.as_str())
        })
        .filter_map(|entry| entry.non_empty_str(fields::SOURCE_VERSION))
        .max_by(|lhs, rhs| version_order(lhs, rhs))
        .map(ToString::to_string)
}
