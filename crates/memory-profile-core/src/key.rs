const FALLBACK_TYPE: &str = "entry";

/// Derive the logical identity of an entry.
///
/// Priority: explicit `key` → `category` + `text` → `text` → `<type>:generated`.
/// Parts that normalize to nothing are treated as absent, so the result is
/// never empty.
#[must_use]
pub fn derive_key(
    entry_type: Option<&str>,
    category: Option<&str>,
    key: Option<&str>,
    text: Option<&str>,
) -> String {
    let entry_type = entry_type.map(str::trim).filter(|value| !value.is_empty());
    let entry_type = entry_type.unwrap_or(FALLBACK_TYPE);

    let key = key.map(normalize_key).filter(|value| !value.is_empty());
    if let Some(key) = key {
        return format!("{entry_type}:{key}");
    }

    let category = category.map(slugify).filter(|value| !value.is_empty());
    let text = text.map(slugify).filter(|value| !value.is_empty());
    match (category, text) {
        (Some(category), Some(text)) => format!("{entry_type}:{category}:{text}"),
        (None, Some(text)) => format!("{entry_type}:{text}"),
        _ => format!("{entry_type}:generated"),
    }
}

/// Normalize an authored key. Case is kept; runs of characters outside
/// `[A-Za-z0-9._:-]` collapse to a single `-`.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    collapse(raw, |ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-'), false)
}

/// Lowercase slug of free text: runs of non-alphanumeric ASCII become `-`.
#[must_use]
pub fn slugify(raw: &str) -> String {
    collapse(raw, |ch| ch.is_ascii_alphanumeric(), true)
}

fn collapse(raw: &str, keep: impl Fn(char) -> bool, lowercase: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if keep(ch) {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(if lowercase { ch.to_ascii_lowercase() } else { ch });
        } else {
            pending_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
