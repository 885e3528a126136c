//! # revdb Store
//!
//! Storage for revdb: the revision store on SQLite, the content-addressed
//! blob store on the filesystem, and attachment bookkeeping between them.
//!
//! ## Transactions
//!
//! Store operations are methods on [`Txn`], which only exists inside
//! [`Database::in_transaction`] (sync) or [`Database::transact`] (async, on
//! the blocking pool). A closure returning `Err` or panicking rolls back.
//!
//! ```ignore
//! let rev = db.in_transaction(|txn| {
//!     txn.put_revision(NewRevision::new("doc", body), None, false)
//! })?;
//! ```
//!
//! ## Tables
//!
//! - `docs` - document IDs and their numeric IDs
//! - `revs` - revision tree nodes, `sequence` is `AUTOINCREMENT`
//! - `attachments` - attachment rows keyed by `(sequence, filename)`
//! - `localdocs` - `_local/` documents and checkpoints
//! - `views` - view catalog

pub mod attachments;
pub mod blob_store;
pub mod database;
pub mod error;
pub mod insertion;
pub mod local_docs;
pub mod migration;
pub mod revisions;
pub mod txn;
pub mod views;

pub use attachments::{AttachmentInsert, AttachmentWriter};
pub use blob_store::{BlobReader, BlobStore, BlobWriter};
pub use database::{CompactionReport, Database, DatabaseConfig, RevisionFilter};
pub use error::{Result, StoreError};
pub use insertion::ForceInsert;
pub use local_docs::LocalDocument;
pub use revisions::{AttachmentContent, ContentOptions, RevsDiffEntry};
pub use txn::Txn;
pub use views::{ViewIndex, ViewInfo};
