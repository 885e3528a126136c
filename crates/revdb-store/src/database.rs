//! The database handle: one SQLite connection, one blob store, and the
//! registries that store operations consult.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::broadcast;

use revdb_core::{BlobKey, Properties, Revision, Sequence, Validator};

use crate::attachments::{AttachmentWriter, AttachmentWriters};
use crate::blob_store::BlobStore;
use crate::error::{Result, StoreError};
use crate::migration;
use crate::txn::Txn;
use crate::views::ViewIndex;

/// Configuration for opening a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Name the database is registered under.
    pub name: String,
    /// SQLite file. `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// Directory of the attachment blob store.
    pub blob_dir: PathBuf,
    /// Capacity of the change notification channel.
    pub change_buffer: usize,
}

impl DatabaseConfig {
    /// A database stored under `dir`: `dir/db.sqlite` and `dir/attachments/`.
    pub fn in_dir(name: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            name: name.into(),
            path: Some(dir.join("db.sqlite")),
            blob_dir: dir.join("attachments"),
            change_buffer: 256,
        }
    }

    /// An in-memory SQLite database whose blobs live in `blob_dir`.
    pub fn in_memory(name: impl Into<String>, blob_dir: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            path: None,
            blob_dir: blob_dir.as_ref().to_path_buf(),
            change_buffer: 256,
        }
    }

    pub fn with_change_buffer(mut self, capacity: usize) -> Self {
        self.change_buffer = capacity.max(1);
        self
    }
}

/// A replication filter evaluated against local revisions.
pub trait RevisionFilter: Send + Sync {
    fn matches(&self, rev: &Revision, params: &Properties) -> bool;
}

impl<F> RevisionFilter for F
where
    F: Fn(&Revision, &Properties) -> bool + Send + Sync,
{
    fn matches(&self, rev: &Revision, params: &Properties) -> bool {
        self(rev, params)
    }
}

/// Result of [`Database::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Non-leaf revisions whose bodies were dropped.
    pub bodies_pruned: usize,
    /// Blobs deleted because no attachment referenced them.
    pub blobs_deleted: usize,
}

/// An open revdb database.
///
/// Thread-safe: the SQLite connection sits behind a mutex and every
/// operation runs in one transaction on it.
pub struct Database {
    name: String,
    conn: Mutex<Connection>,
    blobs: BlobStore,
    writers: AttachmentWriters,
    validators: RwLock<Vec<Arc<dyn Validator>>>,
    filters: RwLock<HashMap<String, Arc<dyn RevisionFilter>>>,
    view_index: RwLock<Option<Arc<dyn ViewIndex>>>,
    changes: broadcast::Sender<Sequence>,
    private_uuid: String,
    public_uuid: String,
}

impl Database {
    /// Open (or create) the database stored under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("db")
            .to_string();
        Self::open_with(DatabaseConfig::in_dir(name, dir))
    }

    /// Open a database from an explicit configuration.
    pub fn open_with(config: DatabaseConfig) -> Result<Self> {
        let mut conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        migration::migrate(&mut conn)?;
        let private_uuid = ensure_uuid(&conn, "privateUUID")?;
        let public_uuid = ensure_uuid(&conn, "publicUUID")?;
        let blobs = BlobStore::open(&config.blob_dir)?;
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));

        tracing::debug!(name = %config.name, path = ?config.path, "opened database");

        Ok(Self {
            name: config.name,
            conn: Mutex::new(conn),
            blobs,
            writers: AttachmentWriters::default(),
            validators: RwLock::new(Vec::new()),
            filters: RwLock::new(HashMap::new()),
            view_index: RwLock::new(None),
            changes,
            private_uuid,
            public_uuid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// UUID never shared with peers; feeds checkpoint IDs.
    pub fn private_uuid(&self) -> &str {
        &self.private_uuid
    }

    /// UUID that identifies this database to peers.
    pub fn public_uuid(&self) -> &str {
        &self.public_uuid
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err` or panic. Committed
    /// writes are published to [`subscribe_changes`](Self::subscribe_changes).
    pub fn in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        // A poisoned lock means a closure panicked; its transaction was
        // rolled back on unwind, so the connection is still consistent.
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = Txn::new(tx, self);
        let value = f(&txn)?;
        let written = txn.commit()?;
        drop(conn);

        if let Some(sequence) = written {
            tracing::trace!(db = %self.name, seq = sequence, "committed write");
            let _ = self.changes.send(sequence);
        }
        Ok(value)
    }

    /// Async form of [`in_transaction`](Self::in_transaction), run on the
    /// blocking thread pool.
    pub async fn transact<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || db.in_transaction(f))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }

    /// Highest sequence ever assigned (0 for an empty database).
    pub fn last_sequence(&self) -> Result<Sequence> {
        self.in_transaction(|txn| txn.last_sequence())
    }

    /// Receive the highest sequence of every committed write.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Sequence> {
        self.changes.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registries
    // ─────────────────────────────────────────────────────────────────────────

    /// Add an application validator run on every local and replicated write.
    pub fn register_validator(&self, validator: Arc<dyn Validator>) {
        self.validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(validator);
    }

    pub(crate) fn validators(&self) -> Vec<Arc<dyn Validator>> {
        self.validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a named replication filter.
    pub fn register_filter(&self, name: impl Into<String>, filter: Arc<dyn RevisionFilter>) {
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), filter);
    }

    pub fn filter(&self, name: &str) -> Option<Arc<dyn RevisionFilter>> {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Install the collaborator that owns view index data.
    pub fn set_view_index(&self, index: Arc<dyn ViewIndex>) {
        *self.view_index.write().unwrap_or_else(PoisonError::into_inner) = Some(index);
    }

    pub(crate) fn view_index(&self) -> Option<Arc<dyn ViewIndex>> {
        self.view_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // In-flight attachment writers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a writer for its digest. If one is already registered, that
    /// writer is returned instead and `writer` is discarded.
    pub fn remember_attachment_writer(&self, writer: Arc<AttachmentWriter>) -> Arc<AttachmentWriter> {
        self.writers.remember(writer)
    }

    pub fn attachment_writer_for(&self, digest: &BlobKey) -> Option<Arc<AttachmentWriter>> {
        self.writers.get(digest)
    }

    pub fn forget_attachment_writers<'a>(&self, digests: impl IntoIterator<Item = &'a BlobKey>) {
        self.writers.forget(digests);
    }

    /// Resolve every `follows` attachment of `rev` from its completed writer.
    ///
    /// All or nothing: if any attachment cannot be resolved, `rev` is left
    /// unchanged and an error is returned.
    pub fn inline_following_attachments(&self, rev: &mut Revision) -> Result<()> {
        self.writers.inline_following(&self.blobs, rev)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop bodies and attachments of non-leaf revisions, then delete blobs
    /// no longer referenced by any attachment or in-flight writer.
    pub fn compact(&self) -> Result<CompactionReport> {
        self.in_transaction(|txn| {
            let conn = txn.conn();
            let bodies_pruned = conn.execute(
                "UPDATE revs SET json = NULL WHERE current = 0 AND json IS NOT NULL",
                [],
            )?;
            conn.execute(
                "DELETE FROM attachments
                 WHERE sequence IN (SELECT sequence FROM revs WHERE current = 0)",
                [],
            )?;

            let mut keep: HashSet<BlobKey> = txn.all_attachment_keys()?.into_iter().collect();
            keep.extend(self.writers.digests());
            let blobs_deleted = self.blobs.delete_blobs_except(&keep)?;

            tracing::info!(db = %self.name, bodies_pruned, blobs_deleted, "compacted database");
            Ok(CompactionReport {
                bodies_pruned,
                blobs_deleted,
            })
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("blob_dir", &self.blobs.root())
            .finish_non_exhaustive()
    }
}

fn ensure_uuid(conn: &Connection, key: &str) -> Result<String> {
    let existing: Option<String> = conn
        .query_row("SELECT value FROM info WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    if let Some(value) = existing {
        return Ok(value);
    }
    let value = uuid::Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO info (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revdb_core::NewRevision;
    use serde_json::json;
    use tempfile::TempDir;

    fn body(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_uuids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let (private, public) = {
            let db = Database::open(dir.path()).unwrap();
            (db.private_uuid().to_string(), db.public_uuid().to_string())
        };
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.private_uuid(), private);
        assert_eq!(db.public_uuid(), public);
        assert_ne!(private, public);
    }

    #[test]
    fn test_error_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let result: Result<()> = db.in_transaction(|txn| {
            txn.put_revision(NewRevision::new("doc", body(json!({"a": 1}))), None, false)?;
            Err(StoreError::InvalidData("abort".into()))
        });
        assert!(result.is_err());

        let found = db
            .in_transaction(|txn| txn.get_document_numeric_id("doc"))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_panic_rolls_back_and_database_stays_usable() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = db.in_transaction(|txn| {
                txn.put_revision(NewRevision::new("doc", body(json!({"a": 1}))), None, false)?;
                if txn.last_sequence()? > 0 {
                    panic!("boom");
                }
                Ok(())
            });
        }));
        assert!(outcome.is_err());

        assert_eq!(db.last_sequence().unwrap(), 0);
        db.in_transaction(|txn| {
            txn.put_revision(NewRevision::new("doc", body(json!({"a": 2}))), None, false)
        })
        .unwrap();
        assert_eq!(
            db.in_transaction(|txn| txn.get_all_revisions("doc", None, false, false))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_commit_publishes_sequence() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let mut changes = db.subscribe_changes();

        let rev = db
            .in_transaction(|txn| {
                txn.put_revision(NewRevision::new("doc", body(json!({"a": 1}))), None, false)
            })
            .unwrap();
        assert_eq!(changes.try_recv().unwrap(), rev.sequence.unwrap());

        db.in_transaction(|txn| txn.last_sequence()).unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transact_runs_on_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let rev = db
            .transact(|txn| txn.put_revision(NewRevision::new("doc", body(json!({"k": "v"}))), None, false))
            .await
            .unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(db.last_sequence().unwrap(), rev.sequence.unwrap());
    }

    #[test]
    fn test_filters_registry() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.register_filter(
            "only-a",
            Arc::new(|rev: &Revision, _: &Properties| rev.doc_id.starts_with('a')),
        );
        let filter = db.filter("only-a").unwrap();
        let rev = Revision::new("apple", revdb_core::RevId::parse("1-x").unwrap(), false);
        assert!(filter.matches(&rev, &Properties::new()));
        assert!(db.filter("missing").is_none());
    }
}
