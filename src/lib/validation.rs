use tracing::warn;

use crate::error::{Result, VaultError};

pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Marker inserted into the directory name of a soft-deleted aggregate.
pub const DELETED_MARKER: &str = ".deleted.";

const INVALID_FILE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Rejects identifiers that cannot be used verbatim as a single path segment.
/// Nothing is ever sanitized: a bad identifier is an error before any
/// filesystem access happens.
pub fn ensure_path_segment(field: &'static str, value: &str) -> Result<()> {
    if let Some(reason) = segment_violation(value) {
        warn!(field, value, reason, "rejected identifier used in storage path");
        return Err(VaultError::PathTraversal {
            field,
            value: value.to_string(),
            reason,
        });
    }
    Ok(())
}

pub fn ensure_aggregate_id(value: &str) -> Result<()> {
    ensure_path_segment("aggregate_id", value)?;
    if value.contains(DELETED_MARKER) {
        warn!(value, "rejected aggregate id containing the soft-delete marker");
        return Err(VaultError::PathTraversal {
            field: "aggregate_id",
            value: value.to_string(),
            reason: "contains the reserved soft-delete marker",
        });
    }
    Ok(())
}

pub fn ensure_owner_id(value: &str) -> Result<()> {
    ensure_path_segment("owner_id", value)
}

fn segment_violation(value: &str) -> Option<&'static str> {
    if value.is_empty() {
        return Some("must not be empty");
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Some("exceeds the maximum identifier length");
    }
    if value.trim() != value {
        return Some("has leading or trailing whitespace");
    }
    if value == "." || value.contains("..") {
        return Some("contains a parent directory reference");
    }
    if value.contains('/') || value.contains('\\') {
        return Some("contains a path separator");
    }
    if value
        .chars()
        .any(|ch| ch.is_control() || INVALID_FILE_NAME_CHARS.contains(&ch))
    {
        return Some("contains a character not allowed in file names");
    }
    if value.ends_with('.') {
        return Some("ends with a dot");
    }
    let stem = value.split('.').next().unwrap_or(value);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Some("is a reserved device name");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason_for(value: &str) -> &'static str {
        match ensure_aggregate_id(value).unwrap_err() {
            VaultError::PathTraversal { reason, .. } => reason,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn accepts_uuid_and_slug_identifiers() {
        ensure_aggregate_id("6f1c1b9e-3f7a-4d8c-9a55-0d4a2f6f9d10").expect("uuid is valid");
        ensure_aggregate_id("tax-return_2024").expect("slug is valid");
        ensure_owner_id("user.name").expect("single dots are allowed");
    }

    #[test]
    fn rejects_traversal_sequences() {
        assert_eq!(reason_for(".."), "contains a parent directory reference");
        assert_eq!(reason_for("a..b"), "contains a parent directory reference");
        assert_eq!(reason_for("../etc"), "contains a parent directory reference");
        assert_eq!(reason_for("a/b"), "contains a path separator");
        assert_eq!(reason_for("a\\b"), "contains a path separator");
    }

    #[test]
    fn rejects_platform_invalid_names() {
        assert_eq!(
            reason_for("what?"),
            "contains a character not allowed in file names"
        );
        assert_eq!(
            reason_for("nul\0byte"),
            "contains a character not allowed in file names"
        );
        assert_eq!(reason_for("con"), "is a reserved device name");
        assert_eq!(reason_for("trailing."), "ends with a dot");
        assert_eq!(reason_for(" padded"), "has leading or trailing whitespace");
        assert_eq!(reason_for(""), "must not be empty");
    }

    #[test]
    fn rejects_soft_delete_marker_in_aggregate_ids() {
        assert_eq!(
            reason_for("p1.deleted.1700000000"),
            "contains the reserved soft-delete marker"
        );
        ensure_owner_id("p1.deleted.1700000000").expect("owner ids may contain the marker");
    }

    #[test]
    fn rejects_overlong_identifiers() {
        let long = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert_eq!(reason_for(&long), "exceeds the maximum identifier length");
    }
}
