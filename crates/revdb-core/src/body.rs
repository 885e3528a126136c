//! Document bodies and their stored JSON encoding.
//!
//! A body is a JSON object of user properties. Keys starting with `_` are
//! reserved: a handful carry revision metadata on the wire and are stripped
//! before storage, every other `_` key is rejected.

use serde_json::{Map, Value};

use crate::error::ValidationError;

/// A document's JSON properties.
pub type Properties = Map<String, Value>;

/// Reserved keys that carry metadata and are never stored in the body.
pub const SPECIAL_KEYS: &[&str] = &[
    "_id",
    "_rev",
    "_deleted",
    "_attachments",
    "_revisions",
    "_conflicts",
    "_local_seq",
    "_revs_info",
];

/// Whether `key` is one of the metadata keys in [`SPECIAL_KEYS`].
pub fn is_special_key(key: &str) -> bool {
    SPECIAL_KEYS.contains(&key)
}

/// Check that a body only uses allowed reserved keys.
pub fn check_reserved_keys(body: &Properties) -> Result<(), ValidationError> {
    match body
        .keys()
        .find(|k| k.starts_with('_') && !is_special_key(k))
    {
        Some(key) => Err(ValidationError::ReservedProperty(key.clone())),
        None => Ok(()),
    }
}

/// Remove the metadata keys, leaving only user properties.
pub fn strip_special_keys(body: &Properties) -> Properties {
    body.iter()
        .filter(|(k, _)| !is_special_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Serialize a body for storage.
///
/// Returns `Ok(None)` when there is no body (a pure tombstone or a history
/// placeholder). Object keys come out sorted, so the encoding is canonical
/// and can feed revision ID derivation.
pub fn encode_body(body: Option<&Properties>) -> Result<Option<Vec<u8>>, ValidationError> {
    let Some(body) = body else {
        return Ok(None);
    };
    check_reserved_keys(body)?;
    let stripped = strip_special_keys(body);
    serde_json::to_vec(&stripped)
        .map(Some)
        .map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Parse a stored body.
pub fn decode_body(json: &[u8]) -> Result<Properties, serde_json::Error> {
    if json.is_empty() {
        return Ok(Properties::new());
    }
    serde_json::from_slice(json)
}
