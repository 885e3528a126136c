//! Strong type definitions for revdb.
//!
//! Revision IDs are parsed once at the boundary so the rest of the crate never
//! has to split `"<gen>-<hash>"` strings.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A database-wide, monotonically increasing write counter.
pub type Sequence = u64;

/// Prefix of local (non-replicated) document IDs.
pub const LOCAL_DOC_PREFIX: &str = "_local/";

/// Prefix of design document IDs.
pub const DESIGN_DOC_PREFIX: &str = "_design/";

/// Number of hex characters kept from the blake3 digest in derived revision IDs.
pub const REV_HASH_LEN: usize = 32;

/// A revision identifier: `"<generation>-<suffix>"`.
///
/// Ordering is by generation first, then by suffix, which matches the
/// lexicographic order of the full string for revisions of equal generation.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevId {
    generation: u64,
    suffix: String,
}

impl RevId {
    /// Build a revision ID from its parts.
    pub fn new(generation: u64, suffix: impl Into<String>) -> Result<Self, CoreError> {
        let suffix = suffix.into();
        if generation == 0 || suffix.is_empty() || suffix.contains('-') {
            return Err(CoreError::InvalidRevId(format!("{generation}-{suffix}")));
        }
        Ok(Self { generation, suffix })
    }

    /// Parse `"<gen>-<suffix>"`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (gen, suffix) = s
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidRevId(s.to_string()))?;
        let generation: u64 = gen
            .parse()
            .map_err(|_| CoreError::InvalidRevId(s.to_string()))?;
        Self::new(generation, suffix).map_err(|_| CoreError::InvalidRevId(s.to_string()))
    }

    /// Derive the ID of a locally created revision.
    ///
    /// The digest covers the parent, the deleted flag, the canonical body JSON
    /// and the attachment digests, so identical edits on two replicas produce
    /// identical revision IDs.
    pub fn derive(
        parent: Option<&RevId>,
        deleted: bool,
        canonical_body: &[u8],
        attachment_digests: &[String],
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"revdb-rev-v0:");
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update(&[0, deleted as u8]);
        hasher.update(canonical_body);
        for digest in attachment_digests {
            hasher.update(b"\0");
            hasher.update(digest.as_bytes());
        }
        let mut suffix = hex::encode(hasher.finalize().as_bytes());
        suffix.truncate(REV_HASH_LEN);
        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            suffix,
        }
    }

    /// The generation number (1 for a root revision).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The hash part after the dash.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({}-{})", self.generation, self.suffix)
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

impl FromStr for RevId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RevId> for String {
    fn from(id: RevId) -> Self {
        id.to_string()
    }
}

/// Whether `doc_id` names a local (non-replicated) document.
pub fn is_local_doc_id(doc_id: &str) -> bool {
    doc_id.starts_with(LOCAL_DOC_PREFIX)
}

/// Whether `doc_id` is acceptable for a revision-tree document.
///
/// Empty IDs and IDs with a leading underscore are rejected, except for
/// design documents.
pub fn is_valid_doc_id(doc_id: &str) -> bool {
    if doc_id.is_empty() {
        return false;
    }
    if doc_id.starts_with('_') {
        return doc_id.len() > DESIGN_DOC_PREFIX.len() && doc_id.starts_with(DESIGN_DOC_PREFIX);
    }
    true
}
