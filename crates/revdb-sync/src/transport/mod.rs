//! Transport abstraction for replication.
//!
//! The replicator speaks a small request/response protocol modelled on the
//! CouchDB replication endpoints. Implementations may map it onto HTTP or
//! anything else; [`memory::MemoryPeer`] serves it from a local database.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request relative to the remote database's root.
///
/// The path is kept as decoded segments, so document IDs containing `/`
/// (design documents) need no escaping until a transport puts them on a wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    pub fn new<I, S>(method: Method, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            path: path.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::Get, path)
    }

    pub fn put<I, S>(path: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn post<I, S>(path: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// First value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `"/seg/seg"` for logs and errors.
    pub fn path_string(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

/// Response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(Value),
    Bytes(Bytes),
}

/// A response from the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl RemoteResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ResponseBody::Json(body),
        }
    }

    pub fn bytes(status: u16, body: Bytes) -> Self {
        Self {
            status,
            body: ResponseBody::Bytes(body),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: ResponseBody::Empty,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into [`SyncError::Http`].
    pub fn error_for_status(self, method: Method, path: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SyncError::Http {
                status: self.status,
                method: method.to_string(),
                path: path.to_string(),
            })
        }
    }

    pub fn into_json(self) -> Result<Value> {
        match self.body {
            ResponseBody::Json(value) => Ok(value),
            ResponseBody::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
            ResponseBody::Empty => Err(SyncError::InvalidResponse("expected JSON body".into())),
        }
    }

    pub fn into_bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            ResponseBody::Empty => Ok(Bytes::new()),
        }
    }
}

/// Transport to one remote database.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Base URL of the remote database.
    fn url(&self) -> &str;

    /// Send one request and wait for its response.
    ///
    /// Connectivity failures are errors; any answer from the peer, including
    /// error statuses, is a response.
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders() {
        let req = RemoteRequest::get(["_design/app", "logo.png"]).with_query("rev", "2-b");
        assert_eq!(req.path_string(), "/_design/app/logo.png");
        assert_eq!(req.query_value("rev"), Some("2-b"));
        assert_eq!(req.query_value("missing"), None);
    }

    #[test]
    fn test_error_for_status() {
        let req = RemoteRequest::post(["_bulk_docs"], json!({}));
        let path = req.path_string();
        let err = RemoteResponse::empty(503)
            .error_for_status(req.method, &path)
            .unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 503, .. }));
        assert!(err.is_transient());
        assert!(RemoteResponse::empty(201).error_for_status(req.method, &path).is_ok());
    }

    #[test]
    fn test_json_from_bytes_body() {
        let resp = RemoteResponse::bytes(200, Bytes::from_static(br#"{"ok":true}"#));
        assert_eq!(resp.into_json().unwrap(), json!({"ok": true}));
        assert!(RemoteResponse::empty(200).into_json().is_err());
    }
}
