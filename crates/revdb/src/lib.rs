//! # revdb
//!
//! An embedded, replicating document database.
//!
//! ## Overview
//!
//! - **Documents** are trees of immutable revisions; concurrent edits become
//!   conflicting branches and every replica picks the same winner
//! - **Attachments** live in a content-addressed blob store, so identical
//!   content is stored once
//! - **Replication** pushes or pulls revisions and attachments to a remote
//!   peer, resuming from a checkpoint stored on both sides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use revdb::{Manager, ManagerConfig, NewRevision};
//! use revdb::sync::{MemoryPeer, ReplicatorConfig};
//!
//! async fn example() -> revdb::Result<()> {
//!     let manager = Manager::new(ManagerConfig::new("data"));
//!     let db = manager.open("notes")?;
//!
//!     let body = serde_json::json!({"title": "hello"}).as_object().cloned().unwrap_or_default();
//!     db.in_transaction(|txn| txn.put_revision(NewRevision::new("note1", body), None, false))?;
//!
//!     let remote = manager.open("backup")?;
//!     let peer = Arc::new(MemoryPeer::new("memory://backup", remote));
//!     let handle = manager.replicate(&db, peer, ReplicatorConfig::push("memory://backup"))?;
//!     handle.wait_until_stopped().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `revdb::core` - revision model (RevId, Revision, Attachment, ...)
//! - `revdb::store` - revision store, blob store, transactions
//! - `revdb::sync` - replicator and transports

pub mod error;
pub mod manager;

// Re-export component crates
pub use revdb_core as core;
pub use revdb_store as store;
pub use revdb_sync as sync;

pub use error::{Result, RevdbError};
pub use manager::{is_valid_database_name, Manager, ManagerConfig};

// Re-export commonly used types
pub use revdb_core::{
    Attachment, AttachmentData, BlobKey, NewRevision, Properties, RevId, Revision, RevisionList,
    Sequence,
};
pub use revdb_store::{ContentOptions, Database, DatabaseConfig, Txn};
pub use revdb_sync::{
    Direction, ReplicationState, ReplicationStatus, Replicator, ReplicatorConfig, ReplicatorHandle,
};
