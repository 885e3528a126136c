//! Content-addressed blob keys.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Prefix of attachment digest strings, e.g. `"blake3-9f2c..."`.
pub const DIGEST_PREFIX: &str = "blake3-";

/// A 32-byte blake3 digest identifying a blob by its content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey(pub [u8; 32]);

impl BlobKey {
    /// Compute the key of the given bytes.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidDigest(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidDigest(s.to_string()))?;
        Ok(Self(arr))
    }

    /// The attachment digest string for this key.
    pub fn to_digest(&self) -> String {
        format!("{DIGEST_PREFIX}{}", self.to_hex())
    }

    /// Parse an attachment digest string.
    pub fn from_digest(digest: &str) -> Result<Self, CoreError> {
        let hex_part = digest
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| CoreError::InvalidDigest(digest.to_string()))?;
        Self::from_hex(hex_part)
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_digest())
    }
}

impl AsRef<[u8]> for BlobKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlobKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for BlobKey {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 32] = slice.try_into()?;
        Ok(Self(arr))
    }
}
