//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store operation failed.
    #[error("store error: {0}")]
    Store(#[from] revdb_store::StoreError),

    /// A document or revision from the peer could not be parsed.
    #[error("invalid document: {0}")]
    Core(#[from] revdb_core::CoreError),

    /// Transport-level error (connection refused, reset, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered with a non-success status.
    #[error("HTTP {status} from {method} {path}")]
    Http {
        status: u16,
        method: String,
        path: String,
    },

    /// The peer refused one document of a bulk write.
    #[error("peer rejected {doc_id}: {reason}")]
    Rejected { doc_id: String, reason: String },

    /// The peer's response did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Timeout waiting for the peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid replicator configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A spawned replication task failed to complete.
    #[error("replication task failed: {0}")]
    TaskFailed(String),

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the error points at connectivity rather than data.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
