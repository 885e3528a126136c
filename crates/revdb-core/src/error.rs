//! Error types for revdb-core.

use thiserror::Error;

use crate::types::RevId;

/// Errors from parsing or converting model values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid revision ID: {0:?}")]
    InvalidRevId(String),

    #[error("invalid blob digest: {0:?}")]
    InvalidDigest(String),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("malformed attachment {name:?}: {reason}")]
    MalformedAttachment { name: String, reason: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for new revisions.
///
/// Returned before anything is written; a revision that fails validation is
/// never partially applied.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid document ID: {0:?}")]
    InvalidDocId(String),

    #[error("invalid revision ID: {0:?}")]
    InvalidRevId(String),

    #[error("generation mismatch: parent {parent:?} requires generation {expected}, got {got}")]
    GenerationMismatch {
        parent: Option<RevId>,
        expected: u64,
        got: u64,
    },

    #[error("parent mismatch: expected {expected:?}, got {got:?}")]
    ParentMismatch {
        expected: Option<RevId>,
        got: Option<RevId>,
    },

    #[error("reserved property {0:?} not allowed in document body")]
    ReservedProperty(String),

    #[error("revision history is inconsistent: {0}")]
    BadHistory(String),

    #[error("attachment {name:?} is invalid: {reason}")]
    BadAttachment { name: String, reason: String },

    #[error("non-deleted revision has no body")]
    MissingBody,

    #[error("malformed revision: {0}")]
    Malformed(String),

    #[error("rejected by validator {validator:?}: {reason}")]
    Rejected { validator: String, reason: String },
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidRevId(s) => ValidationError::InvalidRevId(s),
            CoreError::MalformedAttachment { name, reason } => {
                ValidationError::BadAttachment { name, reason }
            }
            CoreError::InvalidDigest(d) => ValidationError::BadAttachment {
                name: String::new(),
                reason: format!("invalid digest {d:?}"),
            },
            CoreError::MalformedDocument(msg)
            | CoreError::EncodingError(msg)
            | CoreError::DecodingError(msg) => ValidationError::Malformed(msg),
        }
    }
}
