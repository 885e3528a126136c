//! Test fixtures and helpers.
//!
//! Common setup code for integration tests. Helpers panic on failure.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Once};

use rand::{Rng, SeedableRng};
use serde_json::Value;
use tempfile::TempDir;

use revdb_core::{NewRevision, Properties, RevId, Revision, Validator};
use revdb_store::{ContentOptions, Database, DatabaseConfig};
use revdb_sync::{MemoryPeer, Replicator, ReplicatorConfig, ReplicatorHandle};

/// URL the [`ReplicationPair`] peer answers to.
pub const REMOTE_URL: &str = "memory://remote/db";

/// Install a `tracing` subscriber writing to the test output, once.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A JSON object literal as a document body.
///
/// Panics if `value` is not an object.
pub fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        other => panic!("document body must be an object, got {other}"),
    }
}

/// Parse a revision ID literal such as `"2-bbb"`.
pub fn rev(s: &str) -> RevId {
    RevId::parse(s).unwrap_or_else(|e| panic!("bad revision id {s:?}: {e}"))
}

/// Deterministic pseudo-random bytes.
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// TestDb
// ─────────────────────────────────────────────────────────────────────────────

/// A database in a temporary directory, removed on drop.
pub struct TestDb {
    pub db: Arc<Database>,
    dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self::named("test")
    }

    pub fn named(name: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::open_with(DatabaseConfig::in_dir(name, dir.path())).expect("open database");
        Self {
            db: Arc::new(db),
            dir,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Create `doc_id` with `body`.
    pub fn put(&self, doc_id: &str, body: Properties) -> Revision {
        self.put_new(NewRevision::new(doc_id, body), None)
    }

    /// Replace the current revision `parent` of `doc_id`.
    pub fn update(&self, doc_id: &str, parent: &RevId, body: Properties) -> Revision {
        self.put_new(NewRevision::new(doc_id, body), Some(parent))
    }

    pub fn delete(&self, doc_id: &str, parent: &RevId) -> Revision {
        self.put_new(NewRevision::deletion(doc_id), Some(parent))
    }

    pub fn put_new(&self, new: NewRevision, parent: Option<&RevId>) -> Revision {
        self.db
            .in_transaction(|txn| txn.put_revision(new, parent, false))
            .expect("put revision")
    }

    /// The winning revision with its body.
    pub fn get(&self, doc_id: &str) -> Option<Revision> {
        self.db
            .in_transaction(|txn| txn.get_document(doc_id, None, ContentOptions::default()))
            .expect("get document")
    }

    pub fn get_rev(&self, doc_id: &str, rev_id: &RevId) -> Option<Revision> {
        self.db
            .in_transaction(|txn| txn.get_document(doc_id, Some(rev_id), ContentOptions::default()))
            .expect("get document")
    }

    pub fn exists(&self, doc_id: &str) -> bool {
        self.get(doc_id).is_some()
    }

    pub fn last_sequence(&self) -> u64 {
        self.db.last_sequence().expect("last sequence")
    }

    pub fn blob_count(&self) -> usize {
        self.db.blob_store().blob_count().expect("blob count")
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestDb {
    type Target = Arc<Database>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReplicationPair
// ─────────────────────────────────────────────────────────────────────────────

/// A local database and a remote one served through a [`MemoryPeer`].
pub struct ReplicationPair {
    pub local: TestDb,
    pub remote: TestDb,
    pub peer: Arc<MemoryPeer>,
}

impl ReplicationPair {
    pub fn new() -> Self {
        Self::with_peer(|peer| peer)
    }

    /// Customize the peer before it is shared.
    pub fn with_peer(f: impl FnOnce(MemoryPeer) -> MemoryPeer) -> Self {
        let local = TestDb::named("local");
        let remote = TestDb::named("remote");
        let peer = Arc::new(f(MemoryPeer::new(REMOTE_URL, Arc::clone(&remote.db))));
        Self { local, remote, peer }
    }

    pub fn push_config(&self) -> ReplicatorConfig {
        ReplicatorConfig::push(REMOTE_URL)
    }

    pub fn pull_config(&self) -> ReplicatorConfig {
        ReplicatorConfig::pull(REMOTE_URL)
    }

    pub fn replicator(&self, config: ReplicatorConfig) -> Replicator {
        Replicator::new(Arc::clone(&self.local.db), self.peer.clone(), config).expect("replicator config")
    }

    /// Build and start a replicator. Needs a tokio runtime.
    pub fn start(&self, config: ReplicatorConfig) -> ReplicatorHandle {
        self.replicator(config).start()
    }
}

impl Default for ReplicationPair {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validators
// ─────────────────────────────────────────────────────────────────────────────

/// Rejects writes to a chosen set of document IDs until released.
#[derive(Default)]
pub struct ToggleValidator {
    rejected: Mutex<HashSet<String>>,
}

impl ToggleValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, doc_id: &str) {
        self.rejected.lock().expect("lock").insert(doc_id.to_string());
    }

    pub fn release(&self, doc_id: &str) {
        self.rejected.lock().expect("lock").remove(doc_id);
    }
}

impl Validator for ToggleValidator {
    fn name(&self) -> &str {
        "toggle"
    }

    fn validate(&self, new: &Revision, _previous: Option<&Revision>) -> Result<(), String> {
        if self.rejected.lock().expect("lock").contains(&new.doc_id) {
            return Err(format!("{} is not accepted right now", new.doc_id));
        }
        Ok(())
    }
}
