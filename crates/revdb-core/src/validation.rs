//! Revision validation: structural checks run before a revision is inserted.

use crate::attachment::AttachmentData;
use crate::blob::BlobKey;
use crate::body::check_reserved_keys;
use crate::error::ValidationError;
use crate::revision::Revision;
use crate::types::{is_valid_doc_id, RevId};

/// An application-level validation hook.
///
/// Validators run after the structural checks in [`validate_revision`] and
/// can reject a write with a reason.
pub trait Validator: Send + Sync {
    /// Name reported in [`ValidationError::Rejected`].
    fn name(&self) -> &str;

    /// Accept or reject `new`, given the revision it replaces.
    fn validate(&self, new: &Revision, previous: Option<&Revision>) -> Result<(), String>;
}

/// Validate a new revision against the revision it descends from.
///
/// This performs:
/// - Document ID check
/// - Generation continuity (`gen = parent gen + 1`, root = 1)
/// - Parent consistency with `previous`
/// - Reserved body keys
/// - Attachment sanity (inline digest and length, revpos bounds)
pub fn validate_revision(new: &Revision, previous: Option<&Revision>) -> Result<(), ValidationError> {
    // 1. Document ID
    if !is_valid_doc_id(&new.doc_id) {
        return Err(ValidationError::InvalidDocId(new.doc_id.clone()));
    }

    // 2. Parent and generation
    let expected_parent = previous.map(|p| p.rev_id.clone());
    if new.parent_rev_id != expected_parent {
        return Err(ValidationError::ParentMismatch {
            expected: expected_parent,
            got: new.parent_rev_id.clone(),
        });
    }
    let expected_gen = previous.map_or(1, |p| p.generation() + 1);
    if new.generation() != expected_gen {
        return Err(ValidationError::GenerationMismatch {
            parent: expected_parent,
            expected: expected_gen,
            got: new.generation(),
        });
    }

    // 3. Body
    match &new.body {
        Some(body) => check_reserved_keys(body)?,
        None if !new.deleted => return Err(ValidationError::MissingBody),
        None => {}
    }

    // 4. Attachments
    for (name, att) in &new.attachments {
        let bad = |reason: &str| ValidationError::BadAttachment {
            name: name.clone(),
            reason: reason.to_string(),
        };
        if att.revpos > new.generation() {
            return Err(bad("revpos is later than the revision"));
        }
        match &att.data {
            AttachmentData::Inline(bytes) => {
                if att.length != bytes.len() as u64 {
                    return Err(bad("length does not match data"));
                }
                if att.digest != Some(BlobKey::for_bytes(bytes)) {
                    return Err(bad("digest does not match data"));
                }
            }
            AttachmentData::Stub => {
                if previous.is_none() {
                    return Err(bad("stub on a revision without parent"));
                }
            }
            AttachmentData::Follows => {
                return Err(bad("follows attachment was not resolved"));
            }
            AttachmentData::Stored => {
                if att.digest.is_none() {
                    return Err(bad("stored attachment without digest"));
                }
            }
        }
    }

    Ok(())
}

/// Validate a replicated revision's history: newest first, starting at the
/// revision itself, each entry exactly one generation below the previous.
pub fn validate_history(rev: &Revision, history: &[RevId]) -> Result<(), ValidationError> {
    if !is_valid_doc_id(&rev.doc_id) {
        return Err(ValidationError::InvalidDocId(rev.doc_id.clone()));
    }
    let Some(first) = history.first() else {
        return Err(ValidationError::BadHistory("empty history".into()));
    };
    if first != &rev.rev_id {
        return Err(ValidationError::BadHistory(format!(
            "history starts at {first}, revision is {}",
            rev.rev_id
        )));
    }
    for pair in history.windows(2) {
        if pair[1].generation() + 1 != pair[0].generation() {
            return Err(ValidationError::BadHistory(format!(
                "{} does not follow {}",
                pair[0], pair[1]
            )));
        }
    }
    if let Some(body) = &rev.body {
        check_reserved_keys(body)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::Attachment;
    use crate::body::Properties;
    use serde_json::json;

    fn body() -> Properties {
        json!({"k": "v"}).as_object().cloned().unwrap()
    }

    fn root(id: &str) -> Revision {
        Revision::new("doc", RevId::parse(id).unwrap(), false).with_body(body())
    }

    fn child(parent: &Revision, id: &str) -> Revision {
        Revision::new("doc", RevId::parse(id).unwrap(), false)
            .with_parent(Some(parent.rev_id.clone()))
            .with_body(body())
    }

    #[test]
    fn test_valid_root_and_child() {
        let r1 = root("1-a");
        assert!(validate_revision(&r1, None).is_ok());
        let r2 = child(&r1, "2-b");
        assert!(validate_revision(&r2, Some(&r1)).is_ok());
    }

    #[test]
    fn test_generation_gap_rejected() {
        let r1 = root("1-a");
        let r3 = child(&r1, "3-c");
        assert!(matches!(
            validate_revision(&r3, Some(&r1)),
            Err(ValidationError::GenerationMismatch { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn test_root_must_be_generation_one() {
        let r = root("2-a");
        assert!(matches!(
            validate_revision(&r, None),
            Err(ValidationError::GenerationMismatch { expected: 1, .. })
        ));
    }

    #[test]
    fn test_parent_mismatch_rejected() {
        let r1 = root("1-a");
        let other = root("1-z");
        let r2 = child(&other, "2-b");
        assert!(matches!(
            validate_revision(&r2, Some(&r1)),
            Err(ValidationError::ParentMismatch { .. })
        ));
    }

    #[test]
    fn test_live_revision_needs_body() {
        let r = Revision::new("doc", RevId::parse("1-a").unwrap(), false);
        assert!(matches!(validate_revision(&r, None), Err(ValidationError::MissingBody)));
        let tombstone = Revision::new("doc", RevId::parse("1-a").unwrap(), true);
        assert!(validate_revision(&tombstone, None).is_ok());
    }

    #[test]
    fn test_bad_doc_id_rejected() {
        let mut r = root("1-a");
        r.doc_id = "_hidden".into();
        assert!(matches!(validate_revision(&r, None), Err(ValidationError::InvalidDocId(_))));
    }

    #[test]
    fn test_unresolved_follows_rejected() {
        let mut att = Attachment::inline("a", "text/plain", b"abc".to_vec());
        att.data = AttachmentData::Follows;
        let r = root("1-a").with_attachment(att);
        assert!(matches!(
            validate_revision(&r, None),
            Err(ValidationError::BadAttachment { .. })
        ));
    }

    #[test]
    fn test_history_checks() {
        let rev = root("3-c");
        let good: Vec<RevId> = ["3-c", "2-b", "1-a"].iter().map(|s| RevId::parse(s).unwrap()).collect();
        assert!(validate_history(&rev, &good).is_ok());

        let gap: Vec<RevId> = ["3-c", "1-a"].iter().map(|s| RevId::parse(s).unwrap()).collect();
        assert!(validate_history(&rev, &gap).is_err());
        assert!(validate_history(&rev, &[]).is_err());
    }
}
