//! Writing revisions: local edits (`put_revision`) and replicated inserts
//! (`force_insert`).

use std::collections::BTreeMap;

use rusqlite::params;

use revdb_core::body::strip_special_keys;
use revdb_core::{
    encode_body, is_valid_doc_id, validate_history, Attachment, AttachmentData, NewRevision, RevId,
    Revision, Sequence, ValidationError,
};

use crate::error::{Result, StoreError};
use crate::revisions::ContentOptions;
use crate::txn::Txn;

/// Outcome of [`Txn::force_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceInsert {
    /// Written at this sequence.
    Inserted(Sequence),
    /// The revision already existed; nothing changed.
    AlreadyPresent(Sequence),
}

impl ForceInsert {
    pub fn sequence(&self) -> Sequence {
        match self {
            Self::Inserted(seq) | Self::AlreadyPresent(seq) => *seq,
        }
    }
}

impl Txn<'_> {
    /// Structural validation plus every registered application validator.
    pub fn validate_revision(&self, new: &Revision, previous: Option<&Revision>) -> Result<()> {
        revdb_core::validate_revision(new, previous)?;
        self.run_validators(new, previous)
    }

    fn run_validators(&self, new: &Revision, previous: Option<&Revision>) -> Result<()> {
        for validator in self.database().validators() {
            validator
                .validate(new, previous)
                .map_err(|reason| ValidationError::Rejected {
                    validator: validator.name().to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// The JSON stored for a revision's body, `None` when it has none.
    pub fn encode_document_json(&self, rev: &Revision) -> Result<Option<Vec<u8>>> {
        Ok(encode_body(rev.body.as_ref())?)
    }

    /// Create a new revision from a local edit.
    ///
    /// `prev_rev_id` names the revision being replaced and must be a current
    /// leaf unless `allow_conflict` is set. Without it, the document must not
    /// exist or its winner must be a tombstone. Returns the stored revision
    /// with its new ID and sequence.
    pub fn put_revision(
        &self,
        new: NewRevision,
        prev_rev_id: Option<&RevId>,
        allow_conflict: bool,
    ) -> Result<Revision> {
        let NewRevision {
            doc_id,
            deleted,
            body,
            attachments,
        } = new;
        if !is_valid_doc_id(&doc_id) {
            return Err(ValidationError::InvalidDocId(doc_id).into());
        }

        let previous = self.resolve_previous(&doc_id, prev_rev_id, allow_conflict)?;
        if deleted && previous.as_ref().map_or(true, |p| p.deleted) {
            return Err(StoreError::NotFound(format!("document {doc_id}")));
        }

        let generation = previous.as_ref().map_or(1, |p| p.generation() + 1);
        let attachments = if deleted {
            BTreeMap::new()
        } else {
            resolve_attachments(attachments, previous.as_ref(), generation)?
        };
        let body = if deleted {
            body.map(|b| strip_special_keys(&b))
        } else {
            Some(body.map(|b| strip_special_keys(&b)).unwrap_or_default())
        };

        let canonical = encode_body(body.as_ref())?;
        let digests: Vec<String> = attachments
            .values()
            .filter_map(Attachment::digest_string)
            .collect();
        let parent_rev_id = previous.as_ref().map(|p| p.rev_id.clone());
        let rev_id = RevId::derive(
            parent_rev_id.as_ref(),
            deleted,
            canonical.as_deref().unwrap_or_default(),
            &digests,
        );

        let mut rev = Revision::new(doc_id, rev_id, deleted).with_parent(parent_rev_id);
        rev.body = body;
        rev.attachments = attachments;
        self.validate_revision(&rev, previous.as_ref())?;

        let (numeric_id, _) = self.get_or_create_document_numeric_id(&rev.doc_id)?;
        if self.get_sequence(numeric_id, &rev.rev_id, false)?.is_some() {
            return Err(StoreError::Conflict {
                doc_id: rev.doc_id.clone(),
            });
        }

        let parent_seq = previous.as_ref().and_then(|p| p.sequence);
        let seq = self.insert_revision_row(
            numeric_id,
            &rev.rev_id,
            parent_seq,
            rev.deleted,
            canonical.as_deref(),
            true,
        )?;
        for att in rev.attachments.values_mut() {
            self.insert_attachment(att, seq)?;
            att.data = AttachmentData::Stored;
        }
        rev.sequence = Some(seq);

        tracing::debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, seq, "put revision");
        Ok(rev)
    }

    /// The revision a local edit replaces, or `None` for a fresh document.
    fn resolve_previous(
        &self,
        doc_id: &str,
        prev_rev_id: Option<&RevId>,
        allow_conflict: bool,
    ) -> Result<Option<Revision>> {
        let numeric_id = self.get_document_numeric_id(doc_id)?;
        let conflict = || StoreError::Conflict {
            doc_id: doc_id.to_string(),
        };

        match (prev_rev_id, numeric_id) {
            (Some(prev), Some(numeric_id)) => {
                if self.get_sequence(numeric_id, prev, !allow_conflict)?.is_none() {
                    return Err(if self.get_sequence(numeric_id, prev, false)?.is_some() {
                        conflict()
                    } else {
                        StoreError::NotFound(format!("revision {prev} of {doc_id}"))
                    });
                }
                self.get_document(doc_id, Some(prev), ContentOptions::default())?
                    .map(Some)
                    .ok_or_else(|| StoreError::NotFound(format!("revision {prev} of {doc_id}")))
            }
            (Some(prev), None) => Err(StoreError::NotFound(format!("revision {prev} of {doc_id}"))),
            (None, Some(numeric_id)) => match self.get_winning_revision_id(numeric_id)? {
                Some((_, false)) => Err(conflict()),
                // Re-creating a deleted document extends its tombstone.
                Some((tombstone, true)) => {
                    self.get_document(doc_id, Some(&tombstone), ContentOptions::default())
                }
                None => Ok(None),
            },
            (None, None) => Ok(None),
        }
    }

    /// Insert a revision received from a peer, with `history` newest first.
    ///
    /// Ancestors missing locally are inserted as bodiless placeholders. The
    /// revision keeps its ID; conflicts are stored as sibling leaves.
    pub fn force_insert(&self, rev: &Revision, history: &[RevId]) -> Result<ForceInsert> {
        validate_history(rev, history)?;
        if let Some(att) = rev.attachments.values().find(|a| a.follows()) {
            return Err(StoreError::AttachmentNotResolved {
                name: att.name.clone(),
            });
        }

        let (numeric_id, _) = self.get_or_create_document_numeric_id(&rev.doc_id)?;
        if let Some(seq) = self.get_sequence(numeric_id, &rev.rev_id, false)? {
            return self.fill_placeholder(rev, seq);
        }

        let mut parent_seq = None;
        for ancestor in history[1..].iter().rev() {
            parent_seq = Some(match self.get_sequence(numeric_id, ancestor, false)? {
                Some(seq) => seq,
                None => self.insert_revision_row(numeric_id, ancestor, parent_seq, false, None, false)?,
            });
        }

        let previous = match history.get(1) {
            Some(parent) => self.get_document(&rev.doc_id, Some(parent), ContentOptions::default())?,
            None => None,
        };
        self.run_validators(rev, previous.as_ref())?;

        let json = self.encode_document_json(rev)?;
        let seq = self.insert_revision_row(
            numeric_id,
            &rev.rev_id,
            parent_seq,
            rev.deleted,
            json.as_deref(),
            true,
        )?;
        for att in rev.attachments.values() {
            self.insert_attachment(att, seq)?;
        }

        tracing::debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, seq, "inserted replicated revision");
        Ok(ForceInsert::Inserted(seq))
    }

    /// A replicated revision that is already known only as a history
    /// placeholder gets its content stored in place.
    fn fill_placeholder(&self, rev: &Revision, seq: Sequence) -> Result<ForceInsert> {
        let has_content: bool = self.conn().query_row(
            "SELECT json IS NOT NULL OR deleted FROM revs WHERE sequence = ?1",
            params![seq as i64],
            |row| row.get(0),
        )?;
        if has_content {
            return Ok(ForceInsert::AlreadyPresent(seq));
        }
        let json = self.encode_document_json(rev)?;
        if json.is_none() && !rev.deleted {
            return Ok(ForceInsert::AlreadyPresent(seq));
        }
        self.conn().execute(
            "UPDATE revs SET json = ?1, deleted = ?2 WHERE sequence = ?3",
            params![json, rev.deleted, seq as i64],
        )?;
        for att in rev.attachments.values() {
            self.insert_attachment(att, seq)?;
        }
        self.note_written(seq);
        Ok(ForceInsert::Inserted(seq))
    }

    /// Append one `revs` row; a parent stops being a leaf.
    pub(crate) fn insert_revision_row(
        &self,
        numeric_id: i64,
        rev_id: &RevId,
        parent_seq: Option<Sequence>,
        deleted: bool,
        json: Option<&[u8]>,
        current: bool,
    ) -> Result<Sequence> {
        self.conn().execute(
            "INSERT INTO revs (doc_id, revid, generation, parent, current, deleted, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                numeric_id,
                rev_id.to_string(),
                rev_id.generation() as i64,
                parent_seq.map(|s| s as i64),
                current,
                deleted,
                json,
            ],
        )?;
        let seq = self.conn().last_insert_rowid() as Sequence;
        if let Some(parent) = parent_seq {
            self.conn().execute(
                "UPDATE revs SET current = 0 WHERE sequence = ?1",
                params![parent as i64],
            )?;
        }
        self.note_written(seq);
        Ok(seq)
    }
}

/// Fill in stubs from the parent and assign `revpos`.
fn resolve_attachments(
    attachments: BTreeMap<String, Attachment>,
    previous: Option<&Revision>,
    generation: u64,
) -> Result<BTreeMap<String, Attachment>> {
    let inherited = |name: &str| previous.and_then(|p| p.attachments.get(name));
    let mut resolved = BTreeMap::new();

    for (name, mut att) in attachments {
        let bad = |reason: &str| ValidationError::BadAttachment {
            name: name.clone(),
            reason: reason.to_string(),
        };
        match &att.data {
            AttachmentData::Stub => {
                let parent = inherited(&name).ok_or_else(|| bad("stub has nothing to inherit"))?;
                att = Attachment {
                    data: AttachmentData::Stub,
                    ..parent.clone()
                };
            }
            AttachmentData::Follows => return Err(bad("follows is only valid for replicated revisions").into()),
            AttachmentData::Inline(_) | AttachmentData::Stored => {
                att.revpos = match inherited(&name) {
                    Some(parent) if parent.digest.is_some() && parent.digest == att.digest => parent.revpos,
                    _ => generation,
                };
            }
        }
        resolved.insert(name, att);
    }
    Ok(resolved)
}
