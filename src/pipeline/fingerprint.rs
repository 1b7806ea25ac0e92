//! Content fingerprinting for change detection.

use sha2::{Digest, Sha256};

use crate::models::Opportunity;

/// Longer description edits past this point are noise, not meaningful change.
const DESCRIPTION_HASH_LIMIT: usize = 500;

/// Compute the content fingerprint of a record.
///
/// SHA-256 hex over the identity fields joined with `|` in a fixed, explicit
/// order, so the hash is stable across runs and process restarts. The
/// description is truncated before hashing to avoid churn from trailing
/// edits.
pub fn fingerprint(record: &Opportunity) -> String {
    let deadline = record.deadline.as_deref().unwrap_or("");
    let description = truncate_at_boundary(record.description.trim(), DESCRIPTION_HASH_LIMIT);

    let content = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        record.id,
        record.title,
        record.posted_date,
        record.notice_type,
        record.set_aside,
        record.classification_code,
        deadline,
        description,
    );

    let hash = Sha256::digest(content.as_bytes());
    hex::encode(hash)
}

/// Truncate to at most `limit` bytes without splitting a UTF-8 character.
fn truncate_at_boundary(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Opportunity {
        Opportunity {
            id: "N1".to_string(),
            title: "Runway resurfacing".to_string(),
            posted_date: "2026-08-01".to_string(),
            notice_type: "solicitation".to_string(),
            deadline: Some("2026-09-01".to_string()),
            set_aside: "SBA".to_string(),
            classification_code: "237310".to_string(),
            description: "Full depth reclamation".to_string(),
            link: "https://example.com/N1".to_string(),
        }
    }

    #[test]
    fn test_deterministic() {
        let record = sample();
        assert_eq!(fingerprint(&record), fingerprint(&record));
    }

    #[test]
    fn test_identity_field_changes_hash() {
        let record = sample();
        let mut changed = sample();
        changed.title = "Runway repaving".to_string();
        assert_ne!(fingerprint(&record), fingerprint(&changed));

        let mut changed = sample();
        changed.deadline = None;
        assert_ne!(fingerprint(&record), fingerprint(&changed));
    }

    #[test]
    fn test_link_not_part_of_identity() {
        let record = sample();
        let mut moved = sample();
        moved.link = "https://example.com/other".to_string();
        assert_eq!(fingerprint(&record), fingerprint(&moved));
    }

    #[test]
    fn test_trailing_description_edit_ignored() {
        let mut a = sample();
        let mut b = sample();
        a.description = format!("{}{}", "x".repeat(600), "tail one");
        b.description = format!("{}{}", "x".repeat(600), "tail two");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        // Multi-byte character straddling the limit must not panic
        let s = format!("{}é", "x".repeat(499));
        let truncated = truncate_at_boundary(&s, 500);
        assert_eq!(truncated.len(), 499);
    }
}
