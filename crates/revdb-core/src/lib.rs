//! # revdb Core
//!
//! Pure model for revdb: revision IDs, revisions, revision lists,
//! attachments, blob keys, the winning-revision rule and validation.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`RevId`] - `"<generation>-<hash>"` revision identifier
//! - [`Revision`] - An immutable node of a document's revision tree
//! - [`RevisionList`] - Ordered revisions, used for traversal and batching
//! - [`Attachment`] - Attachment metadata and data source
//! - [`BlobKey`] - Content address of attachment bytes
//!
//! ## Conflicts
//!
//! A document may have several leaf revisions. [`winning_revision`] picks the
//! one every replica agrees to show.

pub mod attachment;
pub mod blob;
pub mod body;
pub mod error;
pub mod revision;
pub mod types;
pub mod validation;
pub mod winner;

pub use attachment::{Attachment, AttachmentData};
pub use blob::{BlobKey, DIGEST_PREFIX};
pub use body::{decode_body, encode_body, Properties};
pub use error::{CoreError, ValidationError};
pub use revision::{decode_history, encode_history, NewRevision, Revision, RevisionList};
pub use types::{
    is_local_doc_id, is_valid_doc_id, RevId, Sequence, DESIGN_DOC_PREFIX, LOCAL_DOC_PREFIX,
};
pub use validation::{validate_history, validate_revision, Validator};
pub use winner::{compare_leaves, winning_revision};
