//! Revision tree reads: lookups, winners, history, the changes feed and
//! revs-diff.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use revdb_core::{decode_body, winning_revision, RevId, Revision, RevisionList, Sequence};

use crate::error::{Result, StoreError};
use crate::txn::Txn;

/// How much of a revision [`Txn::get_document`] loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentOptions {
    pub body: bool,
    pub attachments: AttachmentContent,
}

/// Attachment detail for [`ContentOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentContent {
    None,
    /// Metadata only, data source `Stored`.
    #[default]
    Stubs,
    /// Bytes loaded from the blob store.
    Inline,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            body: true,
            attachments: AttachmentContent::Stubs,
        }
    }
}

impl ContentOptions {
    /// Only metadata: no body, no attachments.
    pub fn metadata() -> Self {
        Self {
            body: false,
            attachments: AttachmentContent::None,
        }
    }

    pub fn with_attachments(mut self, attachments: AttachmentContent) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Per-document answer of [`Txn::revs_diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<RevId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<RevId>,
}

const REV_SELECT: &str = "SELECT r.sequence, r.revid, r.deleted, p.revid, r.json
     FROM revs r LEFT JOIN revs p ON p.sequence = r.parent";

/// A `revs` row before parsing.
struct RevRow {
    sequence: Sequence,
    rev_id: String,
    deleted: bool,
    parent: Option<String>,
    json: Option<Vec<u8>>,
}

impl RevRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get::<_, i64>(0)? as Sequence,
            rev_id: row.get(1)?,
            deleted: row.get(2)?,
            parent: row.get(3)?,
            json: row.get(4)?,
        })
    }

    fn into_revision(self, doc_id: &str, with_body: bool) -> Result<Revision> {
        let rev_id = RevId::parse(&self.rev_id)?;
        let parent = self.parent.as_deref().map(RevId::parse).transpose()?;
        let mut rev = Revision::new(doc_id, rev_id, self.deleted)
            .with_parent(parent)
            .with_sequence(self.sequence);
        if with_body {
            if let Some(json) = &self.json {
                rev.body = Some(decode_body(json)?);
            }
        }
        Ok(rev)
    }
}

impl Txn<'_> {
    /// The internal numeric ID of a document, if it exists.
    pub fn get_document_numeric_id(&self, doc_id: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT doc_id FROM docs WHERE docid = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Look up the numeric ID, creating the document row if needed.
    /// Returns `(numeric_id, created)`.
    pub(crate) fn get_or_create_document_numeric_id(&self, doc_id: &str) -> Result<(i64, bool)> {
        if let Some(id) = self.get_document_numeric_id(doc_id)? {
            return Ok((id, false));
        }
        self.conn()
            .execute("INSERT INTO docs (docid) VALUES (?1)", params![doc_id])?;
        Ok((self.conn().last_insert_rowid(), true))
    }

    fn require_numeric_id(&self, doc_id: &str, numeric_id: Option<i64>) -> Result<Option<i64>> {
        match numeric_id {
            Some(id) => Ok(Some(id)),
            None => self.get_document_numeric_id(doc_id),
        }
    }

    /// Sequence of a revision. With `only_current`, leaves only.
    pub fn get_sequence(
        &self,
        numeric_id: i64,
        rev_id: &RevId,
        only_current: bool,
    ) -> Result<Option<Sequence>> {
        let sql = if only_current {
            "SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2 AND current = 1"
        } else {
            "SELECT sequence FROM revs WHERE doc_id = ?1 AND revid = ?2"
        };
        let seq: Option<i64> = self
            .conn()
            .query_row(sql, params![numeric_id, rev_id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(seq.map(|s| s as Sequence))
    }

    /// All revisions of a document, newest sequence first, without bodies.
    ///
    /// `numeric_id` may be passed when already known; otherwise it is looked
    /// up from `doc_id`. A missing document yields an empty list.
    pub fn get_all_revisions(
        &self,
        doc_id: &str,
        numeric_id: Option<i64>,
        only_current: bool,
        exclude_deleted: bool,
    ) -> Result<RevisionList> {
        let Some(numeric_id) = self.require_numeric_id(doc_id, numeric_id)? else {
            return Ok(RevisionList::new());
        };
        let mut sql = format!("{REV_SELECT} WHERE r.doc_id = ?1");
        if only_current {
            sql.push_str(" AND r.current = 1");
        }
        if exclude_deleted {
            sql.push_str(" AND r.deleted = 0");
        }
        sql.push_str(" ORDER BY r.sequence DESC");

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params![numeric_id], RevRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|row| row.into_revision(doc_id, false))
            .collect()
    }

    /// The winning leaf of a document and whether it is a tombstone.
    pub fn get_winning_revision_id(&self, numeric_id: i64) -> Result<Option<(RevId, bool)>> {
        let leaves = self.current_leaves(numeric_id)?;
        Ok(winning_revision(leaves.iter().map(|(r, d)| (r, *d))).map(|(r, d)| (r.clone(), d)))
    }

    /// Live leaves other than the winner.
    pub fn get_conflicting_revision_ids(&self, numeric_id: i64) -> Result<Vec<RevId>> {
        let leaves = self.current_leaves(numeric_id)?;
        let winner = winning_revision(leaves.iter().map(|(r, d)| (r, *d))).map(|(r, _)| r.clone());
        let mut conflicts: Vec<RevId> = leaves
            .into_iter()
            .filter(|(rev, deleted)| !deleted && Some(rev) != winner.as_ref())
            .map(|(rev, _)| rev)
            .collect();
        conflicts.sort_by(|a, b| b.cmp(a));
        Ok(conflicts)
    }

    fn current_leaves(&self, numeric_id: i64) -> Result<Vec<(RevId, bool)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT revid, deleted FROM revs WHERE doc_id = ?1 AND current = 1")?;
        let rows = stmt
            .query_map(params![numeric_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(rev, deleted)| Ok((RevId::parse(&rev)?, deleted)))
            .collect()
    }

    /// Load a revision. `rev_id = None` loads the winner.
    ///
    /// Returns `None` for unknown documents and revisions, and for revisions
    /// whose content is not stored (history placeholders, compacted bodies).
    /// Asking for the winner of a deleted document returns its tombstone.
    pub fn get_document(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
        options: ContentOptions,
    ) -> Result<Option<Revision>> {
        let Some(numeric_id) = self.get_document_numeric_id(doc_id)? else {
            return Ok(None);
        };
        let rev_id = match rev_id {
            Some(rev_id) => rev_id.clone(),
            None => match self.get_winning_revision_id(numeric_id)? {
                Some((winner, _)) => winner,
                None => return Ok(None),
            },
        };

        let row = self
            .conn()
            .query_row(
                &format!("{REV_SELECT} WHERE r.doc_id = ?1 AND r.revid = ?2"),
                params![numeric_id, rev_id.to_string()],
                RevRow::read,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.json.is_none() && !row.deleted {
            return Ok(None);
        }

        let mut rev = row.into_revision(doc_id, options.body)?;
        if let Some(seq) = rev.sequence {
            rev.attachments = match options.attachments {
                AttachmentContent::None => BTreeMap::new(),
                AttachmentContent::Stubs => self.attachments_for_sequence(seq, false)?,
                AttachmentContent::Inline => self.attachments_for_sequence(seq, true)?,
            };
        }
        Ok(Some(rev))
    }

    /// Ancestry of a revision, newest first, starting with the revision.
    pub fn get_revision_history(&self, doc_id: &str, rev_id: &RevId) -> Result<Vec<RevId>> {
        let Some(numeric_id) = self.get_document_numeric_id(doc_id)? else {
            return Err(StoreError::NotFound(format!("document {doc_id}")));
        };
        let Some(start) = self.get_sequence(numeric_id, rev_id, false)? else {
            return Err(StoreError::NotFound(format!("revision {rev_id} of {doc_id}")));
        };

        let mut stmt = self
            .conn()
            .prepare_cached("SELECT revid, parent FROM revs WHERE sequence = ?1")?;
        let mut history = Vec::new();
        let mut next = Some(start as i64);
        while let Some(seq) = next {
            let (revid, parent): (String, Option<i64>) =
                stmt.query_row(params![seq], |row| Ok((row.get(0)?, row.get(1)?)))?;
            history.push(RevId::parse(&revid)?);
            next = parent;
        }
        Ok(history)
    }

    /// Current leaves written after `since`, in increasing sequence order.
    pub fn changes_since(&self, since: Sequence, limit: Option<usize>) -> Result<RevisionList> {
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = self.conn().prepare_cached(
            "SELECT r.sequence, r.revid, r.deleted, p.revid, NULL, d.docid
             FROM revs r
             JOIN docs d ON d.doc_id = r.doc_id
             LEFT JOIN revs p ON p.sequence = r.parent
             WHERE r.sequence > ?1 AND r.current = 1
             ORDER BY r.sequence
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since as i64, limit], |row| {
                Ok((RevRow::read(row)?, row.get::<_, String>(5)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(row, doc_id)| row.into_revision(&doc_id, false))
            .collect()
    }

    /// The highest sequence ever assigned, 0 if none.
    pub fn last_sequence(&self) -> Result<Sequence> {
        let seq: Option<i64> = self
            .conn()
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'revs'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as Sequence)
    }

    /// Which of the given revisions are not in the local revision tree.
    ///
    /// Documents with nothing missing are left out of the result. For each
    /// missing set, `possible_ancestors` lists local leaves of lower
    /// generation than the newest missing revision.
    pub fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<RevId>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>> {
        let mut result = BTreeMap::new();
        for (doc_id, rev_ids) in revs {
            let numeric_id = self.get_document_numeric_id(doc_id)?;
            let mut missing = Vec::new();
            for rev_id in rev_ids {
                let present = match numeric_id {
                    Some(id) => self.get_sequence(id, rev_id, false)?.is_some(),
                    None => false,
                };
                if !present && !missing.contains(rev_id) {
                    missing.push(rev_id.clone());
                }
            }
            if missing.is_empty() {
                continue;
            }

            let mut possible_ancestors = Vec::new();
            if let Some(id) = numeric_id {
                let max_gen = missing.iter().map(RevId::generation).max().unwrap_or(0);
                possible_ancestors = self
                    .current_leaves(id)?
                    .into_iter()
                    .map(|(rev, _)| rev)
                    .filter(|rev| rev.generation() < max_gen)
                    .collect();
                possible_ancestors.sort();
            }
            result.insert(
                doc_id.clone(),
                RevsDiffEntry {
                    missing,
                    possible_ancestors,
                },
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use proptest::prelude::*;
    use revdb_core::{NewRevision, Properties};
    use serde_json::json;
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, db)
    }

    fn rev(s: &str) -> RevId {
        RevId::parse(s).unwrap()
    }

    fn remote(doc: &str, id: &str, history: &[&str]) -> (Revision, Vec<RevId>) {
        let history: Vec<RevId> = history.iter().map(|s| rev(s)).collect();
        let r = Revision::new(doc, rev(id), false)
            .with_parent(history.get(1).cloned())
            .with_body(json!({"from": id}).as_object().cloned().unwrap());
        (r, history)
    }

    #[test]
    fn test_conflict_winner_is_greatest_rev_id() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            for (id, history) in [
                ("1-aaa", vec!["1-aaa"]),
                ("2-bbb", vec!["2-bbb", "1-aaa"]),
                ("2-ccc", vec!["2-ccc", "1-aaa"]),
            ] {
                let (r, h) = remote("doc", id, &history);
                txn.force_insert(&r, &h)?;
            }
            let numeric = txn.get_document_numeric_id("doc")?.unwrap();
            assert_eq!(txn.get_winning_revision_id(numeric)?, Some((rev("2-ccc"), false)));
            assert_eq!(txn.get_conflicting_revision_ids(numeric)?, vec![rev("2-bbb")]);

            let winner = txn.get_document("doc", None, ContentOptions::default())?.unwrap();
            assert_eq!(winner.rev_id, rev("2-ccc"));
            assert_eq!(winner.body.unwrap()["from"], "2-ccc");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_all_revisions_newest_sequence_first() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let r1 = txn.put_revision(NewRevision::new("doc", Properties::new()), None, false)?;
            let r2 = txn.put_revision(NewRevision::deletion("doc"), Some(&r1.rev_id), false)?;
            let all = txn.get_all_revisions("doc", None, false, false)?;
            assert_eq!(all.rev_ids(), vec![r2.rev_id.clone(), r1.rev_id.clone()]);
            assert!(txn.get_all_revisions("doc", None, false, true)?.rev_ids() == vec![r1.rev_id.clone()]);
            assert!(txn.get_all_revisions("doc", None, true, true)?.is_empty());
            assert!(txn.get_all_revisions("missing", None, false, false)?.is_empty());

            let numeric = txn.get_document_numeric_id("doc")?.unwrap();
            assert_eq!(txn.get_sequence(numeric, &r1.rev_id, false)?, r1.sequence);
            assert_eq!(txn.get_sequence(numeric, &r1.rev_id, true)?, None);

            // The tombstone is the winner and still loads.
            let tombstone = txn.get_document("doc", None, ContentOptions::default())?.unwrap();
            assert!(tombstone.deleted);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_changes_since_reports_current_leaves_in_order() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let a1 = txn.put_revision(NewRevision::new("a", Properties::new()), None, false)?;
            txn.put_revision(NewRevision::new("b", Properties::new()), None, false)?;
            let a2 = txn.put_revision(
                NewRevision::new("a", json!({"v": 2}).as_object().cloned().unwrap()),
                Some(&a1.rev_id),
                false,
            )?;

            let changes = txn.changes_since(0, None)?;
            assert_eq!(changes.all_doc_ids(), vec!["b".to_string(), "a".to_string()]);
            assert_eq!(changes.iter().last().unwrap().rev_id, a2.rev_id);
            assert_eq!(changes.iter().last().unwrap().parent_rev_id, Some(a1.rev_id));

            assert_eq!(txn.changes_since(0, Some(1))?.len(), 1);
            assert!(txn.changes_since(a2.sequence.unwrap(), None)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_revs_diff() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let (r, h) = remote("doc", "2-b", &["2-b", "1-a"]);
            txn.force_insert(&r, &h)?;

            let mut query = BTreeMap::new();
            query.insert("doc".to_string(), vec![rev("1-a"), rev("2-b"), rev("3-c")]);
            query.insert("other".to_string(), vec![rev("1-x")]);
            let diff = txn.revs_diff(&query)?;

            assert_eq!(diff["doc"].missing, vec![rev("3-c")]);
            assert_eq!(diff["doc"].possible_ancestors, vec![rev("2-b")]);
            assert_eq!(diff["other"].missing, vec![rev("1-x")]);
            assert!(diff["other"].possible_ancestors.is_empty());

            let mut present = BTreeMap::new();
            present.insert("doc".to_string(), vec![rev("2-b")]);
            assert!(txn.revs_diff(&present)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_history_of_unknown_revision() {
        let (_dir, db) = open();
        let err = db
            .in_transaction(|txn| txn.get_revision_history("doc", &rev("1-a")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_sequences_not_reused_after_rollback_and_compaction() {
        let (_dir, db) = open();
        let r1 = db
            .in_transaction(|txn| txn.put_revision(NewRevision::new("doc", Properties::new()), None, false))
            .unwrap();
        let r2 = db
            .in_transaction(|txn| txn.put_revision(NewRevision::deletion("doc"), Some(&r1.rev_id), false))
            .unwrap();
        db.compact().unwrap();
        let r3 = db
            .in_transaction(|txn| txn.put_revision(NewRevision::new("doc", Properties::new()), None, false))
            .unwrap();
        assert!(r3.sequence > r2.sequence);
        assert_eq!(db.last_sequence().unwrap(), r3.sequence.unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn sequences_strictly_increase(docs in prop::collection::vec(0usize..4, 1..20)) {
            let (_dir, db) = open();
            let mut last = 0;
            for doc in docs {
                let doc_id = format!("doc-{doc}");
                let written = db.in_transaction(|txn| {
                    let prev = match txn.get_document_numeric_id(&doc_id)? {
                        Some(numeric) => txn.get_winning_revision_id(numeric)?.map(|(r, _)| r),
                        None => None,
                    };
                    let body = json!({"n": last}).as_object().cloned().unwrap();
                    txn.put_revision(NewRevision::new(doc_id.clone(), body), prev.as_ref(), false)
                }).unwrap();
                let seq = written.sequence.unwrap();
                prop_assert!(seq > last);
                last = seq;
            }
            let changes = db.in_transaction(|txn| txn.changes_since(0, None)).unwrap();
            let seqs: Vec<_> = changes.iter().filter_map(|r| r.sequence).collect();
            prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
