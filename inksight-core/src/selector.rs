//! Canonical UUID matching for device file names.
//!
//! A name is recognized as a document artifact iff its prefix matches the
//! canonical UUID pattern anchored at position 0.

use regex::Regex;
use std::sync::OnceLock;

const UUID_PATTERN: &str =
    r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

fn uuid_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(UUID_PATTERN).expect("static UUID pattern is valid"))
}

/// Extract the canonical UUID prefix of `name`, if one is present at the
/// start of the string.
pub fn extract_document_id(name: &str) -> Option<String> {
    uuid_prefix_re()
        .find(name)
        .filter(|m| m.start() == 0)
        .map(|m| m.as_str().to_string())
}

/// True iff `name` begins with a canonical UUID.
pub fn has_document_id_prefix(name: &str) -> bool {
    extract_document_id(name).is_some()
}

/// True iff `name` is exactly `<doc_id>` (the stroke-data directory) or
/// begins with `<doc_id>.` (one of the per-document artifact files).
pub fn matches_document(name: &str, doc_id: &str) -> bool {
    name == doc_id || name.starts_with(&format!("{doc_id}."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_uuid_prefix_from_metadata_filename() {
        let id = extract_document_id("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee.metadata").unwrap();
        assert_eq!(id, "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
    }

    #[test]
    fn rejects_non_uuid_prefixed_names() {
        assert!(extract_document_id("notes.txt").is_none());
        assert!(extract_document_id(".sync-state.json").is_none());
    }

    #[test]
    fn matches_directory_and_file_forms() {
        let id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        assert!(matches_document(id, id));
        assert!(matches_document(&format!("{id}.content"), id));
        assert!(!matches_document("other-doc.content", id));
    }
}
