//! Error types for the store module.

use revdb_core::{BlobKey, CoreError, ValidationError};
use thiserror::Error;

/// Errors that can occur during store operations.
///
/// Any error returned from inside a transaction rolls that transaction back.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Body or checkpoint JSON could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The revision was rejected before anything was written.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A model value could not be parsed.
    #[error("invalid value: {0}")]
    Core(#[from] CoreError),

    /// Document, revision, attachment or view not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write does not extend a current leaf.
    #[error("conflict on document {doc_id:?}")]
    Conflict { doc_id: String },

    /// An attachment row references a blob that is not in the blob store.
    #[error("blob {0} missing from blob store")]
    BlobNotFound(BlobKey),

    /// A `follows` attachment had no completed writer.
    #[error("attachment {name:?} was not received")]
    AttachmentNotResolved { name: String },

    /// Streamed bytes did not hash to the announced digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: BlobKey, actual: BlobKey },

    /// The view index collaborator failed.
    #[error("view index error: {0}")]
    ViewIndex(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error (blob files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task failed to complete.
    #[error("store task failed: {0}")]
    TaskFailed(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
