//! Attachment rows and the in-flight attachment writer registry.
//!
//! Attachment rows point at blobs by key. A revision whose attachment is
//! unchanged from its parent gets a copy of the parent's row, so unchanged
//! content is never stored twice.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rusqlite::{params, OptionalExtension};
use tokio::sync::OnceCell;

use revdb_core::{Attachment, AttachmentData, BlobKey, RevId, Revision, Sequence};

use crate::blob_store::BlobStore;
use crate::error::{Result, StoreError};
use crate::txn::Txn;

/// How [`Txn::insert_attachment`] recorded an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentInsert {
    /// Unchanged from the parent revision: the parent's row was copied.
    Copied,
    /// New bytes were written to the blob store.
    Stored,
    /// The bytes were already in the blob store; only a row was added.
    Linked,
}

impl Txn<'_> {
    /// Record `attachment` for the revision at `sequence`.
    pub fn insert_attachment(&self, attachment: &Attachment, sequence: Sequence) -> Result<AttachmentInsert> {
        let parent = self.parent_sequence(sequence)?;
        let name = attachment.name.as_str();

        if let Some(parent) = parent {
            let unchanged = match (&attachment.data, attachment.digest) {
                (AttachmentData::Stub, _) => true,
                (_, Some(digest)) => self.attachment_key(parent, name)? == Some(digest),
                _ => false,
            };
            if unchanged {
                match self.copy_attachment(name, parent, sequence) {
                    Ok(()) => {
                        tracing::trace!(name, seq = sequence, "copied unchanged attachment");
                        return Ok(AttachmentInsert::Copied);
                    }
                    // The parent row is gone (compacted); store from the data.
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        match &attachment.data {
            AttachmentData::Inline(bytes) => {
                let key = self.blobs().store_blob(bytes)?;
                self.insert_attachment_row(sequence, attachment, &key)?;
                Ok(AttachmentInsert::Stored)
            }
            AttachmentData::Stored | AttachmentData::Stub => {
                let key = attachment
                    .digest
                    .ok_or_else(|| StoreError::NotFound(format!("content of attachment {name}")))?;
                if !self.blobs().has(&key) {
                    return Err(StoreError::BlobNotFound(key));
                }
                self.insert_attachment_row(sequence, attachment, &key)?;
                Ok(AttachmentInsert::Linked)
            }
            AttachmentData::Follows => Err(StoreError::AttachmentNotResolved {
                name: name.to_string(),
            }),
        }
    }

    fn insert_attachment_row(&self, sequence: Sequence, att: &Attachment, key: &BlobKey) -> Result<()> {
        self.conn().execute(
            "INSERT INTO attachments (sequence, filename, key, type, length, revpos)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sequence as i64,
                att.name,
                key.as_bytes().as_slice(),
                att.content_type,
                att.length as i64,
                att.revpos as i64,
            ],
        )?;
        Ok(())
    }

    fn parent_sequence(&self, sequence: Sequence) -> Result<Option<Sequence>> {
        let parent: Option<Option<i64>> = self
            .conn()
            .query_row(
                "SELECT parent FROM revs WHERE sequence = ?1",
                params![sequence as i64],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent) => Ok(parent.map(|p| p as Sequence)),
            None => Err(StoreError::NotFound(format!("sequence {sequence}"))),
        }
    }

    fn attachment_key(&self, sequence: Sequence, name: &str) -> Result<Option<BlobKey>> {
        let key: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT key FROM attachments WHERE sequence = ?1 AND filename = ?2",
                params![sequence as i64, name],
                |row| row.get(0),
            )
            .optional()?;
        key.map(|k| parse_key(&k)).transpose()
    }

    /// Copy one attachment row from `from` to `to`. Bytes are not touched.
    pub fn copy_attachment(&self, name: &str, from: Sequence, to: Sequence) -> Result<()> {
        let copied = self.conn().execute(
            "INSERT INTO attachments (sequence, filename, key, type, length, revpos)
             SELECT ?1, filename, key, type, length, revpos
             FROM attachments WHERE sequence = ?2 AND filename = ?3",
            params![to as i64, from as i64, name],
        )?;
        if copied == 0 {
            return Err(StoreError::NotFound(format!("attachment {name} at sequence {from}")));
        }
        Ok(())
    }

    /// Copy every attachment row of `from` to `to`. Returns how many.
    pub fn copy_all_attachments(&self, from: Sequence, to: Sequence) -> Result<usize> {
        Ok(self.conn().execute(
            "INSERT INTO attachments (sequence, filename, key, type, length, revpos)
             SELECT ?1, filename, key, type, length, revpos
             FROM attachments WHERE sequence = ?2",
            params![to as i64, from as i64],
        )?)
    }

    /// The attachments of the revision at `sequence`, by name.
    ///
    /// Without `with_data` the data source is `Stored`; with it the bytes are
    /// read from the blob store.
    pub fn attachments_for_sequence(
        &self,
        sequence: Sequence,
        with_data: bool,
    ) -> Result<BTreeMap<String, Attachment>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT filename, key, type, length, revpos FROM attachments
             WHERE sequence = ?1 ORDER BY filename",
        )?;
        let rows = stmt
            .query_map(params![sequence as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut attachments = BTreeMap::new();
        for (name, key, content_type, length, revpos) in rows {
            let key = parse_key(&key)?;
            let data = if with_data {
                let bytes = self
                    .blobs()
                    .read_blob(&key)?
                    .ok_or(StoreError::BlobNotFound(key))?;
                AttachmentData::Inline(bytes)
            } else {
                AttachmentData::Stored
            };
            attachments.insert(
                name.clone(),
                Attachment {
                    name,
                    content_type,
                    length: length as u64,
                    digest: Some(key),
                    revpos: revpos as u64,
                    data,
                },
            );
        }
        Ok(attachments)
    }

    /// One attachment of a revision with its bytes.
    pub fn get_attachment(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        name: &str,
    ) -> Result<Option<(Attachment, Bytes)>> {
        let Some(numeric_id) = self.get_document_numeric_id(doc_id)? else {
            return Ok(None);
        };
        let Some(seq) = self.get_sequence(numeric_id, rev_id, false)? else {
            return Ok(None);
        };
        let mut attachments = self.attachments_for_sequence(seq, false)?;
        let Some(mut att) = attachments.remove(name) else {
            return Ok(None);
        };
        let key = att.digest.ok_or_else(|| StoreError::InvalidData("attachment without key".into()))?;
        let bytes = self
            .blobs()
            .read_blob(&key)?
            .ok_or(StoreError::BlobNotFound(key))?;
        att.data = AttachmentData::Inline(bytes.clone());
        Ok(Some((att, bytes)))
    }

    pub(crate) fn all_attachment_keys(&self) -> Result<Vec<BlobKey>> {
        let mut stmt = self.conn().prepare("SELECT DISTINCT key FROM attachments")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        keys.iter().map(|k| parse_key(k)).collect()
    }
}

fn parse_key(bytes: &[u8]) -> Result<BlobKey> {
    BlobKey::try_from(bytes).map_err(|_| StoreError::InvalidData("attachment key is not 32 bytes".into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// In-flight writers
// ─────────────────────────────────────────────────────────────────────────────

/// A download of one attachment body, shared by every revision that
/// references the same digest.
#[derive(Debug)]
pub struct AttachmentWriter {
    digest: BlobKey,
    length: u64,
    blob: OnceCell<BlobKey>,
}

impl AttachmentWriter {
    /// A writer expecting content with this digest. `length` 0 means unknown.
    pub fn new(digest: BlobKey, length: u64) -> Arc<Self> {
        Arc::new(Self {
            digest,
            length,
            blob: OnceCell::new(),
        })
    }

    pub fn digest(&self) -> BlobKey {
        self.digest
    }

    /// The stored blob once the download completed.
    pub fn key(&self) -> Option<BlobKey> {
        self.blob.get().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.blob.initialized()
    }

    /// Download the content at most once.
    ///
    /// The first caller runs `fetch` and installs the bytes; concurrent
    /// callers wait for the same result. A failed fetch leaves the writer
    /// empty so a later call may retry. Content already in `blobs` is not
    /// fetched at all.
    pub async fn get_or_fetch<F, Fut, E>(&self, blobs: &BlobStore, fetch: F) -> std::result::Result<BlobKey, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>>,
        E: From<StoreError>,
    {
        self.blob
            .get_or_try_init(|| async move {
                if blobs.has(&self.digest) {
                    return Ok(self.digest);
                }
                let bytes = fetch().await?;
                if self.length != 0 && bytes.len() as u64 != self.length {
                    return Err(StoreError::InvalidData(format!(
                        "attachment {} is {} bytes, expected {}",
                        self.digest,
                        bytes.len(),
                        self.length
                    ))
                    .into());
                }
                let mut writer = blobs.writer()?;
                writer.append(&bytes)?;
                Ok(writer.finish_expecting(&self.digest)?)
            })
            .await
            .copied()
    }
}

/// Registry of in-flight writers keyed by digest.
#[derive(Debug, Default)]
pub(crate) struct AttachmentWriters {
    inner: Mutex<HashMap<BlobKey, Arc<AttachmentWriter>>>,
}

impl AttachmentWriters {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlobKey, Arc<AttachmentWriter>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn remember(&self, writer: Arc<AttachmentWriter>) -> Arc<AttachmentWriter> {
        self.lock().entry(writer.digest).or_insert(writer).clone()
    }

    pub(crate) fn get(&self, digest: &BlobKey) -> Option<Arc<AttachmentWriter>> {
        self.lock().get(digest).cloned()
    }

    pub(crate) fn forget<'a>(&self, digests: impl IntoIterator<Item = &'a BlobKey>) {
        let mut inner = self.lock();
        for digest in digests {
            inner.remove(digest);
        }
    }

    pub(crate) fn digests(&self) -> Vec<BlobKey> {
        self.lock().keys().copied().collect()
    }

    pub(crate) fn inline_following(&self, blobs: &BlobStore, rev: &mut Revision) -> Result<()> {
        let mut resolved = Vec::new();
        for (name, att) in &rev.attachments {
            if !att.follows() {
                continue;
            }
            let unresolved = || StoreError::AttachmentNotResolved { name: name.clone() };
            let digest = att.digest.ok_or_else(unresolved)?;
            // A registered writer must have finished; without one the
            // content may already be in the blob store.
            let key = match self.get(&digest) {
                Some(writer) => writer.key(),
                None => Some(digest),
            }
            .filter(|key| blobs.has(key))
            .ok_or_else(unresolved)?;
            resolved.push((name.clone(), key));
        }

        for (name, key) in resolved {
            if let Some(att) = rev.attachments.get_mut(&name) {
                att.digest = Some(key);
                att.data = AttachmentData::Stored;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::revisions::{AttachmentContent, ContentOptions};
    use revdb_core::{NewRevision, Properties};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, db)
    }

    fn body(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_unchanged_attachment_is_copied() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let photo = Attachment::inline("photo", "image/png", b"pixels".to_vec());
            let r1 = txn.put_revision(
                NewRevision::new("doc", body(json!({"v": 1}))).with_attachment(photo),
                None,
                false,
            )?;
            assert_eq!(txn.blobs().blob_count()?, 1);

            let r2 = txn.put_revision(
                NewRevision::new("doc", body(json!({"v": 2}))).with_attachment(Attachment::stub("photo")),
                Some(&r1.rev_id),
                false,
            )?;
            assert_eq!(txn.blobs().blob_count()?, 1);

            let atts = txn.attachments_for_sequence(r2.sequence.unwrap(), false)?;
            assert_eq!(atts["photo"].revpos, 1);
            assert_eq!(atts["photo"].length, 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_insert_attachment_reports_copy_path() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let photo = Attachment::inline("photo", "image/png", b"pixels".to_vec());
            let r1 = txn.put_revision(
                NewRevision::new("doc", body(json!({}))).with_attachment(photo.clone()),
                None,
                false,
            )?;
            let r2 = txn.put_revision(NewRevision::new("doc", body(json!({"v": 2}))), Some(&r1.rev_id), false)?;
            let seq = r2.sequence.unwrap();

            // r2 dropped the attachment. Re-adding the parent's content under the
            // same name copies the row; a new name stores (deduplicated) bytes.
            assert_eq!(txn.insert_attachment(&photo, seq)?, AttachmentInsert::Copied);
            assert_eq!(txn.blobs().blob_count()?, 1);

            let mut renamed = photo.clone();
            renamed.name = "other".into();
            assert_eq!(txn.insert_attachment(&renamed, seq)?, AttachmentInsert::Stored);
            assert_eq!(txn.blobs().blob_count()?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_copy_failure_other_than_missing_row_propagates() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let r1 = txn.put_revision(
                NewRevision::new("doc", body(json!({})))
                    .with_attachment(Attachment::inline("photo", "image/png", b"pixels".to_vec())),
                None,
                false,
            )?;
            let r2 = txn.put_revision(
                NewRevision::new("doc", body(json!({"v": 2}))).with_attachment(Attachment::stub("photo")),
                Some(&r1.rev_id),
                false,
            )?;

            // r2 already holds a `photo` row, so the copy violates the
            // primary key. That is a storage error, not a missing source.
            let err = txn
                .insert_attachment(&Attachment::stub("photo"), r2.sequence.unwrap())
                .unwrap_err();
            assert!(matches!(err, StoreError::Database(_)), "{err:?}");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_changed_attachment_gets_new_revpos() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let r1 = txn.put_revision(
                NewRevision::new("doc", body(json!({})))
                    .with_attachment(Attachment::inline("a", "text/plain", b"one".to_vec())),
                None,
                false,
            )?;
            let r2 = txn.put_revision(
                NewRevision::new("doc", body(json!({})))
                    .with_attachment(Attachment::inline("a", "text/plain", b"two".to_vec())),
                Some(&r1.rev_id),
                false,
            )?;
            let loaded = txn
                .get_document("doc", Some(&r2.rev_id), ContentOptions::default().with_attachments(AttachmentContent::Inline))?
                .unwrap();
            let att = &loaded.attachments["a"];
            assert_eq!(att.revpos, 2);
            assert_eq!(att.data, AttachmentData::Inline(Bytes::from_static(b"two")));
            assert_eq!(txn.blobs().blob_count()?, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_copy_missing_attachment_not_found() {
        let (_dir, db) = open();
        db.in_transaction(|txn| {
            let r1 = txn.put_revision(NewRevision::new("doc", body(json!({}))), None, false)?;
            let seq = r1.sequence.unwrap();
            assert!(matches!(txn.copy_attachment("nope", seq, seq), Err(StoreError::NotFound(_))));
            assert_eq!(txn.copy_all_attachments(seq, seq)?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stub_without_parent_attachment_rejected() {
        let (_dir, db) = open();
        let err = db
            .in_transaction(|txn| {
                let r1 = txn.put_revision(NewRevision::new("doc", body(json!({}))), None, false)?;
                txn.put_revision(
                    NewRevision::new("doc", body(json!({}))).with_attachment(Attachment::stub("ghost")),
                    Some(&r1.rev_id),
                    false,
                )
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    fn following(name: &str, content: &[u8]) -> Attachment {
        let mut att = Attachment::inline(name, "text/plain", content.to_vec());
        att.data = AttachmentData::Follows;
        att
    }

    #[tokio::test]
    async fn test_inline_following_is_all_or_nothing() {
        let (_dir, db) = open();
        let mut rev = Revision::new("doc", RevId::parse("1-a").unwrap(), false)
            .with_body(Properties::new())
            .with_attachment(following("a", b"alpha"))
            .with_attachment(following("b", b"beta"));

        let writer_a = db.remember_attachment_writer(AttachmentWriter::new(BlobKey::for_bytes(b"alpha"), 5));
        writer_a
            .get_or_fetch(db.blob_store(), || async { Ok::<_, StoreError>(Bytes::from_static(b"alpha")) })
            .await
            .unwrap();

        let before = rev.clone();
        assert!(matches!(
            db.inline_following_attachments(&mut rev),
            Err(StoreError::AttachmentNotResolved { name }) if name == "b"
        ));
        assert_eq!(rev, before);

        let writer_b = db.remember_attachment_writer(AttachmentWriter::new(BlobKey::for_bytes(b"beta"), 4));
        writer_b
            .get_or_fetch(db.blob_store(), || async { Ok::<_, StoreError>(Bytes::from_static(b"beta")) })
            .await
            .unwrap();
        db.inline_following_attachments(&mut rev).unwrap();
        assert!(rev.attachments.values().all(|a| a.data == AttachmentData::Stored));

        db.in_transaction(|txn| txn.force_insert(&rev, &[rev.rev_id.clone()])).unwrap();
    }

    #[tokio::test]
    async fn test_shared_writer_fetches_once() {
        let (_dir, db) = open();
        let digest = BlobKey::for_bytes(b"shared");
        let first = db.remember_attachment_writer(AttachmentWriter::new(digest, 6));
        let second = db.remember_attachment_writer(AttachmentWriter::new(digest, 6));
        assert!(Arc::ptr_eq(&first, &second));

        let counter = AtomicUsize::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(Bytes::from_static(b"shared"))
        };
        let (a, b) = tokio::join!(
            first.get_or_fetch(db.blob_store(), fetch),
            second.get_or_fetch(db.blob_store(), fetch)
        );
        assert_eq!(a.unwrap(), digest);
        assert_eq!(b.unwrap(), digest);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        db.forget_attachment_writers([&digest]);
        assert!(db.attachment_writer_for(&digest).is_none());
    }

    #[tokio::test]
    async fn test_corrupt_download_rejected() {
        let (_dir, db) = open();
        let writer = AttachmentWriter::new(BlobKey::for_bytes(b"expected"), 0);
        let err = writer
            .get_or_fetch(db.blob_store(), || async { Ok::<_, StoreError>(Bytes::from_static(b"tampered")) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
        assert!(!writer.is_complete());
        assert_eq!(db.blob_store().blob_count().unwrap(), 0);
    }
}
