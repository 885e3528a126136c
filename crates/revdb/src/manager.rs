//! The Manager: registry of open databases and active replicators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use revdb_store::{Database, DatabaseConfig};
use revdb_sync::{RemoteTransport, Replicator, ReplicatorConfig, ReplicatorHandle};

use crate::error::{Result, RevdbError};

/// Configuration for the Manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding one subdirectory per database.
    pub root: PathBuf,
    /// Keep the SQLite files in memory. Blobs still go under `root`.
    pub in_memory: bool,
    /// Capacity of each database's change notification channel.
    pub change_buffer: usize,
}

impl ManagerConfig {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            in_memory: false,
            change_buffer: 256,
        }
    }

    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn with_change_buffer(mut self, capacity: usize) -> Self {
        self.change_buffer = capacity;
        self
    }

    fn database_config(&self, name: &str) -> DatabaseConfig {
        let dir = self.root.join(name);
        let config = if self.in_memory {
            DatabaseConfig::in_memory(name, dir.join("attachments"))
        } else {
            DatabaseConfig::in_dir(name, dir)
        };
        config.with_change_buffer(self.change_buffer)
    }
}

struct OpenDatabase {
    db: Arc<Database>,
    handles: usize,
}

struct ActiveReplicator {
    db_name: String,
    handle: ReplicatorHandle,
}

/// Owns the databases of one application and the replicators running
/// against them.
///
/// Opening a name twice returns the same `Arc<Database>`; the database is
/// released once every `open` has been matched by a `close`.
pub struct Manager {
    config: ManagerConfig,
    databases: Mutex<HashMap<String, OpenDatabase>>,
    replicators: Mutex<HashMap<String, ActiveReplicator>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            databases: Mutex::new(HashMap::new()),
            replicators: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Databases
    // ─────────────────────────────────────────────────────────────────────────

    /// Open `name`, creating it on first use.
    pub fn open(&self, name: &str) -> Result<Arc<Database>> {
        if !is_valid_database_name(name) {
            return Err(RevdbError::InvalidDatabaseName(name.to_string()));
        }
        let mut databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(open) = databases.get_mut(name) {
            open.handles += 1;
            return Ok(Arc::clone(&open.db));
        }

        let db = Arc::new(Database::open_with(self.config.database_config(name))?);
        tracing::info!(name, "database opened");
        databases.insert(
            name.to_string(),
            OpenDatabase {
                db: Arc::clone(&db),
                handles: 1,
            },
        );
        Ok(db)
    }

    /// The open database called `name`, without taking a handle.
    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|open| Arc::clone(&open.db))
    }

    /// Names of the open databases, sorted.
    pub fn database_names(&self) -> Vec<String> {
        let databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = databases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Release one handle on `name`. The last close stops the database's
    /// replicators and drops it from the registry.
    pub fn close(&self, name: &str) -> Result<()> {
        {
            let mut databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
            let open = databases
                .get_mut(name)
                .ok_or_else(|| RevdbError::DatabaseNotOpen(name.to_string()))?;
            open.handles -= 1;
            if open.handles > 0 {
                return Ok(());
            }
            databases.remove(name);
        }

        let mut replicators = self.replicators.lock().unwrap_or_else(PoisonError::into_inner);
        replicators.retain(|id, active| {
            if active.db_name != name {
                return true;
            }
            tracing::debug!(checkpoint_id = %id, "stopping replicator of closed database");
            active.handle.stop();
            false
        });
        tracing::info!(name, "database closed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────────

    /// Start replicating `db` with `config`. A replication with the same
    /// checkpoint ID that is still running is returned instead.
    pub fn replicate(
        &self,
        db: &Arc<Database>,
        transport: Arc<dyn RemoteTransport>,
        config: ReplicatorConfig,
    ) -> Result<ReplicatorHandle> {
        let replicator = Replicator::new(Arc::clone(db), transport, config)?;
        Ok(self.register(db.name(), replicator))
    }

    /// Register and start a prepared replicator (for example one with a
    /// reachability signal attached).
    pub fn register(&self, db_name: &str, replicator: Replicator) -> ReplicatorHandle {
        let mut replicators = self.replicators.lock().unwrap_or_else(PoisonError::into_inner);
        replicators.retain(|_, active| !active.handle.is_stopped());

        let id = replicator.checkpoint_id().to_string();
        if let Some(active) = replicators.get(&id) {
            tracing::debug!(checkpoint_id = %id, "replicator already running");
            return active.handle.clone();
        }
        let handle = replicator.start();
        replicators.insert(
            id,
            ActiveReplicator {
                db_name: db_name.to_string(),
                handle: handle.clone(),
            },
        );
        handle
    }

    pub fn replicator(&self, checkpoint_id: &str) -> Option<ReplicatorHandle> {
        self.replicators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(checkpoint_id)
            .map(|active| active.handle.clone())
    }

    /// Checkpoint IDs of the registered replicators that have not stopped.
    pub fn active_replicators(&self) -> Vec<String> {
        let replicators = self.replicators.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = replicators
            .iter()
            .filter(|(_, active)| !active.handle.is_stopped())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop the replicator and remove it from the registry. Returns whether
    /// it was registered.
    pub fn stop_and_forget_replicator(&self, checkpoint_id: &str) -> bool {
        let removed = self
            .replicators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(checkpoint_id);
        match removed {
            Some(active) => {
                active.handle.stop();
                tracing::info!(checkpoint_id, "replicator forgotten");
                true
            }
            None => false,
        }
    }
}

/// Database names start with a lowercase letter and contain only
/// lowercase letters, digits and `_ $ ( ) + - /`.
pub fn is_valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use revdb_sync::MemoryPeer;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> Manager {
        Manager::new(ManagerConfig::new(dir.path()))
    }

    #[test]
    fn test_database_names() {
        assert!(is_valid_database_name("photos"));
        assert!(is_valid_database_name("a1_$()+-/b"));
        assert!(!is_valid_database_name(""));
        assert!(!is_valid_database_name("1abc"));
        assert!(!is_valid_database_name("Photos"));
        assert!(!is_valid_database_name("_users"));
    }

    #[test]
    fn test_open_shares_one_database() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let a = m.open("notes").unwrap();
        let b = m.open("notes").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.database_names(), vec!["notes".to_string()]);

        m.close("notes").unwrap();
        assert!(m.database("notes").is_some());
        m.close("notes").unwrap();
        assert!(m.database("notes").is_none());
        assert!(matches!(m.close("notes"), Err(RevdbError::DatabaseNotOpen(_))));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        assert!(matches!(m.open("Bad"), Err(RevdbError::InvalidDatabaseName(_))));
    }

    #[tokio::test]
    async fn test_replicate_dedupes_by_checkpoint_id() {
        let dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let db = m.open("local").unwrap();
        let remote = Arc::new(Database::open(remote_dir.path()).unwrap());
        let peer = Arc::new(MemoryPeer::new("memory://remote/db", remote));

        let config = ReplicatorConfig::push("memory://remote/db").with_continuous(true);
        let a = m.replicate(&db, peer.clone(), config.clone()).unwrap();
        let b = m.replicate(&db, peer.clone(), config).unwrap();
        assert_eq!(a.checkpoint_id(), b.checkpoint_id());
        assert_eq!(m.active_replicators(), vec![a.checkpoint_id().to_string()]);

        assert!(m.stop_and_forget_replicator(a.checkpoint_id()));
        assert!(!m.stop_and_forget_replicator(a.checkpoint_id()));
        a.wait_until_stopped().await;
        assert!(b.is_stopped());
    }

    #[tokio::test]
    async fn test_close_stops_replicators() {
        let dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let db = m.open("local").unwrap();
        let remote = Arc::new(Database::open(remote_dir.path()).unwrap());
        let peer = Arc::new(MemoryPeer::new("memory://remote/db", remote));

        let handle = m
            .replicate(&db, peer, ReplicatorConfig::pull("memory://remote/db").with_continuous(true))
            .unwrap();
        m.close("local").unwrap();
        handle.wait_until_stopped().await;
        assert!(m.active_replicators().is_empty());
    }
}
