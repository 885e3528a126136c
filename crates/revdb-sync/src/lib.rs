//! # revdb Sync
//!
//! Replication between a local revdb database and a remote peer that
//! speaks the CouchDB-style replication endpoints (`_changes`,
//! `_revs_diff`, `_bulk_docs`, `_local/`).
//!
//! ## Overview
//!
//! A [`Replicator`] pushes local changes to the remote or pulls remote
//! changes into the local database. It reads the source's changes in
//! pages, queues them in an inbox, and transfers them in batches. Progress
//! is recorded in a checkpoint stored on both sides.
//!
//! ## Key Properties
//!
//! - **Resumable**: a restart continues from the last checkpoint
//! - **Idempotent**: revisions already on the target are skipped
//! - **Ordered checkpoints**: the checkpoint never passes a change that
//!   has not been transferred, even when batches finish out of order
//! - **Retrying**: failed rounds are retried with exponential backoff
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use revdb_store::Database;
//! use revdb_sync::{MemoryPeer, Replicator, ReplicatorConfig};
//!
//! async fn example() -> revdb_sync::Result<()> {
//!     let local = Arc::new(Database::open("local")?);
//!     let remote = Arc::new(Database::open("remote")?);
//!     let peer = Arc::new(MemoryPeer::new("memory://remote/db", remote));
//!
//!     let handle = Replicator::new(local, peer, ReplicatorConfig::push("memory://remote/db"))?
//!         .start();
//!     let status = handle.wait_until_stopped().await;
//!     println!("pushed {} revisions", status.changes_processed);
//!     Ok(())
//! }
//! ```
//!
//! ## Flow
//!
//! ```text
//! Local                                Remote
//!   |-------- GET _local/<id> -------->|   load checkpoint
//!   |   changes_since(checkpoint)      |
//!   |-------- POST _revs_diff -------->|
//!   |<------- missing revisions -------|
//!   |-------- POST _bulk_docs -------->|   new_edits=false
//!   |-------- PUT _local/<id> -------->|   save checkpoint
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod inbox;
pub mod replicator;
pub mod request;
pub mod sequence_map;
pub mod status;
pub mod strategy;
pub mod transport;

pub use checkpoint::{checkpoint_id, Checkpointer, LAST_SEQUENCE_KEY};
pub use config::{Direction, ReplicationFilter, ReplicatorConfig, RetryPolicy};
pub use error::{Result, SyncError};
pub use inbox::Inbox;
pub use replicator::{Replicator, ReplicatorHandle};
pub use request::{RemoteClient, RequestGate, RequestGuard, RequestInfo, RequestRegistry};
pub use sequence_map::SequenceMap;
pub use status::{Reachability, ReplicationState, ReplicationStatus};
pub use strategy::{DirectionStrategy, PullStrategy, PushStrategy, ReplicationContext};
pub use transport::{
    memory::{FailureRule, InjectedFailure, MemoryPeer},
    Method, RemoteRequest, RemoteResponse, RemoteTransport, ResponseBody,
};
