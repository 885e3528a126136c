//! Local documents: `_local/` IDs, never replicated, no revision tree.
//!
//! Replication checkpoints are stored here too.

use rusqlite::{params, OptionalExtension};

use revdb_core::{decode_body, is_local_doc_id, Properties, RevId, ValidationError, LOCAL_DOC_PREFIX};

use crate::error::{Result, StoreError};
use crate::txn::Txn;

/// A stored local document.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    pub doc_id: String,
    pub rev_id: RevId,
    pub body: Properties,
}

const LOCAL_REV_SUFFIX: &str = "local";

fn checkpoint_doc_id(checkpoint_id: &str) -> String {
    format!("{LOCAL_DOC_PREFIX}{checkpoint_id}")
}

impl Txn<'_> {
    pub fn get_local_document(&self, doc_id: &str) -> Result<Option<LocalDocument>> {
        let row: Option<(String, Vec<u8>)> = self
            .conn()
            .query_row(
                "SELECT revid, json FROM localdocs WHERE docid = ?1",
                params![doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(rev, json)| {
            Ok(LocalDocument {
                doc_id: doc_id.to_string(),
                rev_id: RevId::parse(&rev)?,
                body: decode_body(&json)?,
            })
        })
        .transpose()
    }

    /// Write a local document. `prev_rev_id` must match the stored revision
    /// (`None` when creating). Returns the new revision ID.
    pub fn put_local_document(
        &self,
        doc_id: &str,
        body: &Properties,
        prev_rev_id: Option<&RevId>,
    ) -> Result<RevId> {
        if !is_local_doc_id(doc_id) {
            return Err(ValidationError::InvalidDocId(doc_id.to_string()).into());
        }
        let current = self.get_local_document(doc_id)?.map(|d| d.rev_id);
        if current.as_ref() != prev_rev_id {
            return Err(StoreError::Conflict {
                doc_id: doc_id.to_string(),
            });
        }
        let generation = current.map_or(1, |r| r.generation() + 1);
        let rev_id = RevId::new(generation, LOCAL_REV_SUFFIX)?;
        self.write_local(doc_id, &rev_id, body)?;
        Ok(rev_id)
    }

    /// Delete a local document whose revision is `prev_rev_id`.
    pub fn delete_local_document(&self, doc_id: &str, prev_rev_id: &RevId) -> Result<()> {
        let Some(current) = self.get_local_document(doc_id)? else {
            return Err(StoreError::NotFound(format!("local document {doc_id}")));
        };
        if &current.rev_id != prev_rev_id {
            return Err(StoreError::Conflict {
                doc_id: doc_id.to_string(),
            });
        }
        self.conn()
            .execute("DELETE FROM localdocs WHERE docid = ?1", params![doc_id])?;
        Ok(())
    }

    fn write_local(&self, doc_id: &str, rev_id: &RevId, body: &Properties) -> Result<()> {
        let json = serde_json::to_vec(body)?;
        self.conn().execute(
            "INSERT INTO localdocs (docid, revid, json) VALUES (?1, ?2, ?3)
             ON CONFLICT(docid) DO UPDATE SET revid = excluded.revid, json = excluded.json",
            params![doc_id, rev_id.to_string(), json],
        )?;
        Ok(())
    }

    /// The body of the checkpoint stored under `_local/<checkpoint_id>`.
    pub fn checkpoint_document(&self, checkpoint_id: &str) -> Result<Option<Properties>> {
        Ok(self
            .get_local_document(&checkpoint_doc_id(checkpoint_id))?
            .map(|d| d.body))
    }

    /// Overwrite a checkpoint, whatever revision it had.
    pub fn save_checkpoint_document(&self, checkpoint_id: &str, body: &Properties) -> Result<()> {
        let doc_id = checkpoint_doc_id(checkpoint_id);
        let generation = self
            .get_local_document(&doc_id)?
            .map_or(1, |d| d.rev_id.generation() + 1);
        self.write_local(&doc_id, &RevId::new(generation, LOCAL_REV_SUFFIX)?, body)?;
        tracing::trace!(checkpoint_id, "saved checkpoint document");
        Ok(())
    }

    /// Remove a checkpoint. Returns whether one existed.
    pub fn delete_checkpoint_document(&self, checkpoint_id: &str) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM localdocs WHERE docid = ?1",
            params![checkpoint_doc_id(checkpoint_id)],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;
    use tempfile::TempDir;

    fn body(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_local_document_revisions() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.in_transaction(|txn| {
            let r1 = txn.put_local_document("_local/prefs", &body(json!({"theme": "dark"})), None)?;
            assert_eq!(r1.generation(), 1);

            let stale = txn.put_local_document("_local/prefs", &body(json!({})), None);
            assert!(matches!(stale, Err(StoreError::Conflict { .. })));

            let r2 = txn.put_local_document("_local/prefs", &body(json!({"theme": "light"})), Some(&r1))?;
            let doc = txn.get_local_document("_local/prefs")?.unwrap();
            assert_eq!(doc.rev_id, r2);
            assert_eq!(doc.body["theme"], "light");

            txn.delete_local_document("_local/prefs", &r2)?;
            assert!(txn.get_local_document("_local/prefs")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_local_docs_stay_out_of_the_changes_feed() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.in_transaction(|txn| {
            txn.put_local_document("_local/x", &body(json!({"a": 1})), None)?;
            assert!(txn.changes_since(0, None)?.is_empty());
            assert_eq!(txn.last_sequence()?, 0);

            let not_local = txn.put_local_document("plain", &body(json!({})), None);
            assert!(matches!(not_local, Err(StoreError::Validation(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_checkpoint_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.in_transaction(|txn| {
            assert!(txn.checkpoint_document("abc")?.is_none());
            txn.save_checkpoint_document("abc", &body(json!({"lastSequence": "5"})))?;
            txn.save_checkpoint_document("abc", &body(json!({"lastSequence": "9"})))?;
            assert_eq!(txn.checkpoint_document("abc")?.unwrap()["lastSequence"], "9");
            assert!(txn.get_local_document("_local/abc")?.is_some());

            assert!(txn.delete_checkpoint_document("abc")?);
            assert!(!txn.delete_checkpoint_document("abc")?);
            Ok(())
        })
        .unwrap();
    }
}
