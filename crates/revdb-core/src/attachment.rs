//! Attachments: named binary payloads belonging to one revision.
//!
//! An attachment's bytes live in the blob store; the revision only carries
//! metadata and one of several data sources (see [`AttachmentData`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::BlobKey;
use crate::error::CoreError;

/// Where an attachment's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentData {
    /// Bytes travel with the revision.
    Inline(Bytes),
    /// Bytes are in the local blob store under the attachment's digest.
    Stored,
    /// Unchanged since an ancestor; the bytes are found via the parent revision.
    Stub,
    /// Bytes arrive separately and are resolved by
    /// `inline_following_attachments` before the revision is committed.
    Follows,
}

/// Attachment metadata plus its data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub length: u64,
    pub digest: Option<BlobKey>,
    /// Generation of the revision in which this content last changed.
    pub revpos: u64,
    pub data: AttachmentData,
}

/// Wire form of one entry of a document's `_attachments` object.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AttachmentJson {
    content_type: String,
    #[serde(default)]
    length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(default)]
    revpos: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    follows: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stub: bool,
}

impl Attachment {
    /// A new attachment with inline bytes. `revpos` is assigned on insert.
    pub fn inline(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            content_type: content_type.into(),
            length: bytes.len() as u64,
            digest: Some(BlobKey::for_bytes(&bytes)),
            revpos: 0,
            data: AttachmentData::Inline(bytes),
        }
    }

    /// A stub meaning "keep whatever the parent revision had under this name".
    pub fn stub(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: String::new(),
            length: 0,
            digest: None,
            revpos: 0,
            data: AttachmentData::Stub,
        }
    }

    /// Whether the bytes must be resolved from an ancestor.
    pub fn is_stub(&self) -> bool {
        matches!(self.data, AttachmentData::Stub)
    }

    /// Whether the bytes are still in flight.
    pub fn follows(&self) -> bool {
        matches!(self.data, AttachmentData::Follows)
    }

    /// The digest string, if known.
    pub fn digest_string(&self) -> Option<String> {
        self.digest.map(|d| d.to_digest())
    }

    /// Parse one `_attachments` entry.
    pub fn from_json(name: &str, value: &Value) -> Result<Self, CoreError> {
        let bad = |reason: String| CoreError::MalformedAttachment {
            name: name.to_string(),
            reason,
        };
        let wire: AttachmentJson =
            serde_json::from_value(value.clone()).map_err(|e| bad(e.to_string()))?;

        let digest = wire
            .digest
            .as_deref()
            .map(BlobKey::from_digest)
            .transpose()
            .map_err(|e| bad(e.to_string()))?;

        let (data, length, digest) = if let Some(encoded) = wire.data {
            let bytes = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| bad(format!("bad base64: {e}")))?;
            let computed = BlobKey::for_bytes(&bytes);
            if digest.is_some_and(|d| d != computed) {
                return Err(bad("digest does not match inline data".into()));
            }
            let length = bytes.len() as u64;
            (AttachmentData::Inline(Bytes::from(bytes)), length, Some(computed))
        } else if wire.follows {
            if digest.is_none() {
                return Err(bad("follows requires a digest".into()));
            }
            (AttachmentData::Follows, wire.length, digest)
        } else if wire.stub {
            (AttachmentData::Stub, wire.length, digest)
        } else {
            return Err(bad("needs one of data, follows or stub".into()));
        };

        Ok(Self {
            name: name.to_string(),
            content_type: wire.content_type,
            length,
            digest,
            revpos: wire.revpos,
            data,
        })
    }

    /// Encode as an `_attachments` entry.
    ///
    /// `Stored` attachments are written as stubs; callers that want the bytes
    /// inline must load them and switch the data to `Inline` first.
    pub fn to_json(&self) -> Value {
        let mut wire = AttachmentJson {
            content_type: self.content_type.clone(),
            length: self.length,
            digest: self.digest_string(),
            revpos: self.revpos,
            ..Default::default()
        };
        match &self.data {
            AttachmentData::Inline(bytes) => wire.data = Some(BASE64.encode(bytes)),
            AttachmentData::Stored | AttachmentData::Stub => wire.stub = true,
            AttachmentData::Follows => wire.follows = true,
        }
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inline_attachment_json() {
        let att = Attachment::inline("photo", "image/png", b"pixels".to_vec());
        let value = att.to_json();
        assert_eq!(value["content_type"], "image/png");
        assert_eq!(value["length"], 6);
        assert_eq!(value["data"], BASE64.encode(b"pixels"));

        let parsed = Attachment::from_json("photo", &value).unwrap();
        assert_eq!(parsed.digest, att.digest);
        assert_eq!(parsed.data, AttachmentData::Inline(Bytes::from_static(b"pixels")));
    }

    #[test]
    fn test_follows_requires_digest() {
        let value = json!({"content_type": "text/plain", "length": 3, "follows": true});
        assert!(Attachment::from_json("a", &value).is_err());

        let digest = BlobKey::for_bytes(b"abc").to_digest();
        let value = json!({"content_type": "text/plain", "length": 3, "follows": true, "digest": digest});
        let att = Attachment::from_json("a", &value).unwrap();
        assert!(att.follows());
        assert_eq!(att.length, 3);
    }

    #[test]
    fn test_inline_digest_mismatch_rejected() {
        let wrong = BlobKey::for_bytes(b"other").to_digest();
        let value = json!({"content_type": "text/plain", "data": BASE64.encode(b"abc"), "digest": wrong});
        assert!(Attachment::from_json("a", &value).is_err());
    }

    #[test]
    fn test_stored_serializes_as_stub() {
        let mut att = Attachment::inline("a", "text/plain", b"abc".to_vec());
        att.data = AttachmentData::Stored;
        att.revpos = 2;
        let value = att.to_json();
        assert_eq!(value["stub"], true);
        assert!(value.get("data").is_none());
        assert_eq!(value["revpos"], 2);
    }
}
