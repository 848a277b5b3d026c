use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{MemoryEntry, ProfileError};

pub const PERSONAL_ASSISTANT: &str = "personal-assistant";

/// An immutable, versioned set of desired entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePack {
    pub profile_id: String,
    pub version: String,
    pub entries: Vec<MemoryEntry>,
}

/// Read-only catalog of profile packs. Lookups hand out owned copies.
#[derive(Debug, Clone, Default)]
pub struct PackRegistry {
    packs: Vec<ProfilePack>,
}

/// Numeric suffix of a version label: `v2` → 2, `2024.10` → 10.
///
/// `None` when the label has no trailing digits or the suffix does not fit
/// in a `u64`.
#[must_use]
pub fn version_ordinal(version: &str) -> Option<u64> {
    trailing_digits(version)?.parse().ok()
}

fn trailing_digits(version: &str) -> Option<&str> {
    let digits_start = version
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_digit())
        .last()
        .map(|(index, _)| index)?;
    Some(&version[digits_start..])
}

/// Orders labels by the numeric value of their trailing digits, labels
/// without digits first. Suffixes of any length compare correctly: with
/// leading zeros gone, a longer run is the larger number.
pub(crate) fn version_order(lhs: &str, rhs: &str) -> std::cmp::Ordering {
    suffix_magnitude(lhs).cmp(&suffix_magnitude(rhs)).then_with(|| lhs.cmp(rhs))
}

fn suffix_magnitude(version: &str) -> Option<(usize, &str)> {
    let significant = trailing_digits(version)?.trim_start_matches('0');
    Some((significant.len(), significant))
}

impl PackRegistry {
    #[must_use]
    pub fn new(packs: Vec<ProfilePack>) -> Self {
        Self { packs }
    }

    /// The packs shipped with this build.
    #[must_use]
    pub fn builtin() -> &'static Self {
        static BUILTIN: OnceLock<PackRegistry> = OnceLock::new();
        BUILTIN.get_or_init(|| Self::new(builtin_packs()))
    }

    /// Look up one pack by id and version.
    ///
    /// # Errors
    /// Returns [`ProfileError::UnknownPack`] when the pair is not registered.
    pub fn get_pack(&self, profile_id: &str, version: &str) -> Result<ProfilePack, ProfileError> {
        self.packs
            .iter()
            .find(|pack| pack.profile_id == profile_id && pack.version == version)
            .cloned()
            .ok_or_else(|| ProfileError::UnknownPack {
                profile_id: profile_id.to_string(),
                version: version.to_string(),
            })
    }

    /// Versions of one profile in ascending numeric-suffix order; empty when
    /// the profile is unknown.
    #[must_use]
    pub fn list_versions(&self, profile_id: &str) -> Vec<String> {
        let mut versions = self
            .packs
            .iter()
            .filter(|pack| pack.profile_id == profile_id)
            .map(|pack| pack.version.clone())
            .collect::<Vec<_>>();
        versions.sort_by(|lhs, rhs| version_order(lhs, rhs));
        versions.dedup();
        versions
    }

    #[must_use]
    pub fn latest_version(&self, profile_id: &str) -> Option<String> {
        self.list_versions(profile_id).pop()
    }

    #[must_use]
    pub fn profiles(&self) -> Vec<String> {
        let mut profiles =
            self.packs.iter().map(|pack| pack.profile_id.clone()).collect::<Vec<_>>();
        profiles.sort();
        profiles.dedup();
        profiles
    }

    /// The requested version, or the latest one when none is requested.
    ///
    /// # Errors
    /// Returns [`ProfileError::UnknownProfile`] when no version is requested
    /// and the profile has no packs, or [`ProfileError::UnknownPack`] when the
    /// requested version is not registered.
    pub fn resolve_version(
        &self,
        profile_id: &str,
        requested: Option<&str>,
    ) -> Result<String, ProfileError> {
        match requested {
            Some(version) => self.get_pack(profile_id, version).map(|pack| pack.version),
            None => self
                .latest_version(profile_id)
                .ok_or_else(|| ProfileError::UnknownProfile(profile_id.to_string())),
        }
    }
}

fn entries(values: Vec<Value>) -> Vec<MemoryEntry> {
    values.into_iter().filter_map(MemoryEntry::from_value).collect()
}

fn builtin_packs() -> Vec<ProfilePack> {
    vec![
        ProfilePack {
            profile_id: PERSONAL_ASSISTANT.to_string(),
            version: "v1".to_string(),
            entries: personal_assistant_v1(),
        },
        ProfilePack {
            profile_id: PERSONAL_ASSISTANT.to_string(),
            version: "v2".to_string(),
            entries: personal_assistant_v2(),
        },
    ]
}

fn personal_assistant_v1() -> Vec<MemoryEntry> {
    entries(vec![
        json!({
            "type": "preference",
            "key": "communication.style",
            "category": "communication",
            "value": "balanced"
        }),
        json!({
            "type": "preference",
            "key": "communication.format",
            "category": "communication",
            "value": "short paragraphs, bullets for lists"
        }),
        json!({
            "type": "behavior",
            "key": "do:ask-before-risky-external-actions",
            "category": "do",
            "text": "Ask before taking risky external actions"
        }),
        json!({
            "type": "behavior",
            "category": "do",
            "text": "Summarize long threads before replying"
        }),
        json!({
            "type": "behavior",
            "category": "dont",
            "text": "Share private data without consent"
        }),
        json!({
            "type": "context",
            "key": "workingHours",
            "value": "unspecified"
        }),
        json!({
            "type": "meta",
            "key": "profile.kind",
            "value": "personal-assistant"
        }),
    ])
}

fn personal_assistant_v2() -> Vec<MemoryEntry> {
    entries(vec![
        json!({
            "type": "preference",
            "key": "communication.style",
            "category": "communication",
            "value": "balanced"
        }),
        json!({
            "type": "preference",
            "key": "communication.format",
            "category": "communication",
            "value": "short paragraphs, bullets for lists, no filler"
        }),
        json!({
            "type": "behavior",
            "key": "do:ask-before-risky-external-actions",
            "category": "do",
            "text": "Ask for confirmation before any risky or irreversible external action"
        }),
        json!({
            "type": "behavior",
            "category": "dont",
            "text": "Share personal data without explicit consent"
        }),
        json!({
            "type": "context",
            "key": "workingHours",
            "value": "unspecified"
        }),
        json!({
            "type": "context",
            "key": "proactiveCadence",
            "value": "weekly check-in"
        }),
        json!({
            "type": "meta",
            "key": "profile.kind",
            "value": "personal-assistant"
        }),
    ])
}
