//! Property and measurement sanitization.
//!
//! User-supplied dimension maps are untrusted: keys and values are trimmed
//! and truncated to the wire limits, keys that trim to nothing are renamed
//! to `"empty"`, and collisions introduced by truncation or renaming are
//! resolved with a numeric suffix. Both entry points are pure: the input map
//! is never mutated and is returned untouched (cloned) when nothing needs
//! fixing.

use std::collections::BTreeMap;

pub const MAX_KEY_LENGTH: usize = 150;
pub const MAX_VALUE_LENGTH: usize = 8192;
pub const MAX_NAME_LENGTH: usize = 1024;
pub const MAX_ID_LENGTH: usize = 512;
pub const MAX_MESSAGE_LENGTH: usize = 32_768;
pub const MAX_URL_LENGTH: usize = 2048;

/// Replacement key for keys that are empty after trimming.
const EMPTY_KEY: &str = "empty";

/// Sanitizes a property map. Entries whose value trims to nothing are
/// dropped.
///
/// # Arguments
///
/// * `properties` - The raw user-supplied map; never mutated
///
/// # Returns
///
/// A new map whose keys are pairwise distinct, non-empty, and within
/// [`MAX_KEY_LENGTH`], with values trimmed to [`MAX_VALUE_LENGTH`].
///
/// # Example
///
/// ```rust
/// use appinsights_agent_native::telemetry::sanitize::sanitize_properties;
/// use std::collections::BTreeMap;
///
/// let mut raw = BTreeMap::new();
/// raw.insert("  tenant  ".to_string(), "acme".to_string());
/// raw.insert("   ".to_string(), "kept".to_string());
///
/// let clean = sanitize_properties(&raw);
/// assert_eq!(clean.get("tenant").map(String::as_str), Some("acme"));
/// assert_eq!(clean.get("empty").map(String::as_str), Some("kept"));
/// ```
#[must_use]
pub fn sanitize_properties(properties: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    if !needs_sanitizing(properties) {
        return properties.clone();
    }
    let mut sanitized = BTreeMap::new();
    for (key, value) in properties {
        let value = trim_and_truncate(value, MAX_VALUE_LENGTH);
        if value.is_empty() {
            continue;
        }
        let key = make_key_unique(sanitize_key(key), &sanitized);
        sanitized.insert(key, value.to_string());
    }
    sanitized
}

/// Sanitizes a measurement map. Values are numbers, so only keys are
/// touched; entries are always retained.
///
/// # Arguments
///
/// * `measurements` - The raw user-supplied map; never mutated
///
/// # Returns
///
/// A new map with the same values under sanitized, deduplicated keys.
#[must_use]
pub fn sanitize_measurements(measurements: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let mut sanitized = BTreeMap::new();
    for (key, value) in measurements {
        let key = make_key_unique(sanitize_key(key), &sanitized);
        sanitized.insert(key, *value);
    }
    sanitized
}

fn needs_sanitizing(properties: &BTreeMap<String, String>) -> bool {
    properties.iter().any(|(key, value)| {
        key.is_empty()
            || value.is_empty()
            || key.len() > MAX_KEY_LENGTH
            || value.len() > MAX_VALUE_LENGTH
            || key.trim() != key
            || value.trim() != value
    })
}

fn sanitize_key(key: &str) -> String {
    let key = trim_and_truncate(key, MAX_KEY_LENGTH);
    if key.is_empty() {
        EMPTY_KEY.to_string()
    } else {
        key.to_string()
    }
}

/// Resolves a key collision by appending 1, 2, ... to the key, truncated so
/// the suffixed key still fits the limit.
fn make_key_unique<V>(key: String, map: &BTreeMap<String, V>) -> String {
    if !map.contains_key(&key) {
        return key;
    }
    let stem = truncate(&key, MAX_KEY_LENGTH - 3);
    let mut candidate = 1;
    loop {
        let unique = format!("{stem}{candidate}");
        if !map.contains_key(&unique) {
            return unique;
        }
        candidate += 1;
    }
}

/// Trims whitespace and truncates to `max_length` without splitting a
/// character.
///
/// # Arguments
///
/// * `value` - The string to bound
/// * `max_length` - Maximum length in bytes; the cut backs up to the
///   nearest character boundary
#[must_use]
pub fn trim_and_truncate(value: &str, max_length: usize) -> &str {
    truncate(value.trim(), max_length)
}

fn truncate(value: &str, max_length: usize) -> &str {
    if value.len() <= max_length {
        return value;
    }
    let mut end = max_length;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
