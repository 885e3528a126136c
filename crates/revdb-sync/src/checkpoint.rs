//! Replication checkpoints.
//!
//! A checkpoint records the last source sequence whose changes (and every
//! change before it) have been replicated. It is stored twice: locally as a
//! checkpoint document and on the remote as `_local/<checkpoint id>`. The
//! replicator only trusts it when both copies agree.

use std::sync::Arc;

use serde_json::{json, Value};

use revdb_core::Properties;
use revdb_store::Database;

use crate::config::{Direction, ReplicationFilter};
use crate::error::{Result, SyncError};
use crate::request::RemoteClient;
use crate::transport::{Method, RemoteRequest};

/// Checkpoint body key holding the sequence.
pub const LAST_SEQUENCE_KEY: &str = "lastSequence";

/// Stable ID of a replication: same database, remote, direction and
/// filter give the same ID.
pub fn checkpoint_id(
    private_uuid: &str,
    remote_url: &str,
    direction: Direction,
    filter: Option<&ReplicationFilter>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(private_uuid.as_bytes());
    hasher.update(b"\n");
    hasher.update(remote_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(direction.as_str().as_bytes());
    if let Some(filter) = filter {
        hasher.update(b"\n");
        hasher.update(filter.fingerprint().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Loads and saves one replication's checkpoint.
pub struct Checkpointer {
    id: String,
    db: Arc<Database>,
    remote: RemoteClient,
    /// Revision of the remote checkpoint document, if it exists.
    remote_rev: Option<String>,
    last_saved: Option<Value>,
}

impl Checkpointer {
    pub fn new(id: impl Into<String>, db: Arc<Database>, remote: RemoteClient) -> Self {
        Self {
            id: id.into(),
            db,
            remote,
            remote_rev: None,
            last_saved: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Value most recently saved or loaded.
    pub fn last_saved(&self) -> Option<&Value> {
        self.last_saved.as_ref()
    }

    /// Load the checkpoint. `None` means start from the beginning: no
    /// checkpoint yet, or the local and remote copies disagree.
    pub async fn load(&mut self) -> Result<Option<Value>> {
        let id = self.id.clone();
        let local = self
            .db
            .transact(move |txn| txn.checkpoint_document(&id))
            .await?
            .and_then(|body| body.get(LAST_SEQUENCE_KEY).cloned());

        let remote = self.fetch_remote().await?;
        let value = if local == remote {
            local
        } else {
            tracing::info!(
                checkpoint_id = %self.id,
                ?local,
                ?remote,
                "local and remote checkpoints differ, starting over"
            );
            None
        };
        self.last_saved = value.clone();
        Ok(value)
    }

    /// Save `value` remotely, then locally.
    pub async fn save(&mut self, value: &Value) -> Result<()> {
        if self.last_saved.as_ref() == Some(value) {
            return Ok(());
        }
        match self.put_remote(value).await {
            Err(SyncError::Http { status: 409, .. }) => {
                // Someone else wrote it; pick up their revision and overwrite.
                self.fetch_remote().await?;
                self.put_remote(value).await?;
            }
            other => other?,
        }

        let mut body = Properties::new();
        body.insert(LAST_SEQUENCE_KEY.into(), value.clone());
        let id = self.id.clone();
        self.db
            .transact(move |txn| txn.save_checkpoint_document(&id, &body))
            .await?;

        tracing::info!(checkpoint_id = %self.id, seq = %value, "saved checkpoint");
        self.last_saved = Some(value.clone());
        Ok(())
    }

    /// Forget the local copy so the next load starts from zero.
    pub async fn reset(&mut self) -> Result<()> {
        let id = self.id.clone();
        let existed = self
            .db
            .transact(move |txn| txn.delete_checkpoint_document(&id))
            .await?;
        if existed {
            tracing::info!(checkpoint_id = %self.id, "checkpoint reset");
        }
        self.last_saved = None;
        Ok(())
    }

    async fn fetch_remote(&mut self) -> Result<Option<Value>> {
        let request = RemoteRequest::get(["_local", self.id.as_str()]);
        let response = self.remote.send(request).await?;
        if response.status == 404 {
            self.remote_rev = None;
            return Ok(None);
        }
        let path = format!("/_local/{}", self.id);
        let body = response
            .error_for_status(Method::Get, &path)?
            .into_json()?;
        self.remote_rev = body.get("_rev").and_then(Value::as_str).map(str::to_string);
        Ok(body.get(LAST_SEQUENCE_KEY).cloned())
    }

    async fn put_remote(&mut self, value: &Value) -> Result<()> {
        let mut body = json!({ LAST_SEQUENCE_KEY: value });
        if let Some(rev) = &self.remote_rev {
            body["_rev"] = Value::String(rev.clone());
        }
        let response = self
            .remote
            .send_async_request(RemoteRequest::put(["_local", self.id.as_str()], body))
            .await?
            .into_json()?;
        self.remote_rev = response.get("rev").and_then(Value::as_str).map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryPeer;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Setup {
        _dirs: (TempDir, TempDir),
        local: Arc<Database>,
        peer: Arc<MemoryPeer>,
    }

    fn setup() -> Setup {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let local = Arc::new(Database::open(a.path()).unwrap());
        let remote = Arc::new(Database::open(b.path()).unwrap());
        Setup {
            _dirs: (a, b),
            local,
            peer: Arc::new(MemoryPeer::new("memory://remote/db", remote)),
        }
    }

    fn client(peer: &Arc<MemoryPeer>) -> RemoteClient {
        RemoteClient::new(peer.clone(), 2, Duration::from_secs(5))
    }

    #[test]
    fn test_checkpoint_id_is_stable() {
        let a = checkpoint_id("uuid", "http://h/db", Direction::Push, None);
        assert_eq!(a, checkpoint_id("uuid", "http://h/db", Direction::Push, None));
        assert_ne!(a, checkpoint_id("uuid", "http://h/db", Direction::Pull, None));
        assert_ne!(a, checkpoint_id("other", "http://h/db", Direction::Push, None));
        let filter = ReplicationFilter::DocIds(vec!["x".into()]);
        assert_ne!(a, checkpoint_id("uuid", "http://h/db", Direction::Push, Some(&filter)));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let s = setup();
        let mut cp = Checkpointer::new("cp1", s.local.clone(), client(&s.peer));
        assert_eq!(cp.load().await.unwrap(), None);

        cp.save(&json!(5)).await.unwrap();
        cp.save(&json!(9)).await.unwrap();

        let mut fresh = Checkpointer::new("cp1", s.local.clone(), client(&s.peer));
        assert_eq!(fresh.load().await.unwrap(), Some(json!(9)));
    }

    #[tokio::test]
    async fn test_mismatch_restarts_from_zero() {
        let s = setup();
        let mut cp = Checkpointer::new("cp2", s.local.clone(), client(&s.peer));
        cp.load().await.unwrap();
        cp.save(&json!(5)).await.unwrap();

        // The remote lost its copy.
        s.peer
            .database()
            .in_transaction(|txn| txn.delete_checkpoint_document("cp2"))
            .unwrap();

        let mut fresh = Checkpointer::new("cp2", s.local.clone(), client(&s.peer));
        assert_eq!(fresh.load().await.unwrap(), None);
        // Saving again recreates the remote copy.
        fresh.save(&json!(6)).await.unwrap();
        let mut again = Checkpointer::new("cp2", s.local.clone(), client(&s.peer));
        assert_eq!(again.load().await.unwrap(), Some(json!(6)));
    }

    #[tokio::test]
    async fn test_reset_starts_over() {
        let s = setup();
        let mut cp = Checkpointer::new("cp4", s.local.clone(), client(&s.peer));
        cp.load().await.unwrap();
        cp.save(&json!(7)).await.unwrap();
        cp.reset().await.unwrap();
        assert_eq!(cp.last_saved(), None);

        let mut fresh = Checkpointer::new("cp4", s.local.clone(), client(&s.peer));
        assert_eq!(fresh.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_remote_rev_recovers() {
        let s = setup();
        let mut a = Checkpointer::new("cp3", s.local.clone(), client(&s.peer));
        let mut b = Checkpointer::new("cp3", s.local.clone(), client(&s.peer));
        a.load().await.unwrap();
        b.load().await.unwrap();
        a.save(&json!(1)).await.unwrap();
        b.save(&json!(2)).await.unwrap();

        let mut fresh = Checkpointer::new("cp3", s.local.clone(), client(&s.peer));
        assert_eq!(fresh.load().await.unwrap(), Some(json!(2)));
    }
}
