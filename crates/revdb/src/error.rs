//! Error types for the umbrella API.

use revdb_core::{CoreError, ValidationError};
use revdb_store::StoreError;
use revdb_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during revdb operations.
#[derive(Debug, Error)]
pub enum RevdbError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("replication error: {0}")]
    Sync(#[from] SyncError),

    /// Names must start with a lowercase letter and use only
    /// `a-z 0-9 _ $ ( ) + - /`.
    #[error("invalid database name: {0:?}")]
    InvalidDatabaseName(String),

    #[error("database not open: {0}")]
    DatabaseNotOpen(String),
}

/// Result type for revdb operations.
pub type Result<T> = std::result::Result<T, RevdbError>;
