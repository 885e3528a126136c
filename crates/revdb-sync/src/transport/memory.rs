//! In-process peer: serves a local [`Database`] through [`RemoteTransport`].
//!
//! Used by tests and for replicating between two databases in one process.
//! Failures can be injected per request (error statuses, dropped
//! connections) and the peer can be switched offline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use revdb_core::{
    AttachmentData, Properties, RevId, Revision, Sequence, ValidationError, LOCAL_DOC_PREFIX,
};
use revdb_store::{ContentOptions, Database, RevisionFilter, StoreError};

use super::{Method, RemoteRequest, RemoteResponse, RemoteTransport};
use crate::error::{Result, SyncError};

/// Attachments up to this size are sent inline by default.
pub const DEFAULT_FOLLOWS_THRESHOLD: u64 = 4096;

/// What an injected failure does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Answer with this HTTP status.
    Status(u16),
    /// Fail as if the connection dropped.
    Disconnect,
}

/// A failure applied to matching requests.
#[derive(Debug, Clone)]
pub struct FailureRule {
    failure: InjectedFailure,
    method: Option<Method>,
    path_prefix: Vec<String>,
    remaining: Option<usize>,
}

impl FailureRule {
    /// Matches every request, forever.
    pub fn new(failure: InjectedFailure) -> Self {
        Self {
            failure,
            method: None,
            path_prefix: Vec::new(),
            remaining: None,
        }
    }

    pub fn on(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Only requests whose path starts with these segments.
    pub fn at<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_prefix = prefix.into_iter().map(Into::into).collect();
        self
    }

    /// Fire at most `n` times.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, request: &RemoteRequest) -> bool {
        self.method.map_or(true, |m| m == request.method)
            && request.path.starts_with(&self.path_prefix)
            && self.remaining != Some(0)
    }
}

/// A remote database backed by a local [`Database`].
pub struct MemoryPeer {
    url: String,
    db: Arc<Database>,
    exists: AtomicBool,
    reachable: AtomicBool,
    follows_threshold: u64,
    latency: Option<Duration>,
    failures: Mutex<Vec<FailureRule>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryPeer {
    pub fn new(url: impl Into<String>, db: Arc<Database>) -> Self {
        Self {
            url: url.into(),
            db,
            exists: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            follows_threshold: DEFAULT_FOLLOWS_THRESHOLD,
            latency: None,
            failures: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Start without a database: everything answers 404 until a
    /// `PUT /` creates it.
    pub fn missing(mut self) -> Self {
        self.exists = AtomicBool::new(false);
        self
    }

    /// Attachments longer than `threshold` are sent as `follows` and must
    /// be fetched separately.
    pub fn with_follows_threshold(mut self, threshold: u64) -> Self {
        self.follows_threshold = threshold;
        self
    }

    /// Delay every request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    /// While unreachable every request fails with a transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn inject(&self, rule: FailureRule) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Every request received so far, as `"METHOD /path"`.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of received requests matching `method` and the first path segment.
    pub fn request_count(&self, method: Method, first_segment: &str) -> usize {
        let prefix = format!("{method} /{first_segment}");
        self.requests()
            .iter()
            .filter(|r| r.starts_with(&prefix))
            .count()
    }

    fn take_failure(&self, request: &RemoteRequest) -> Option<InjectedFailure> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let rule = failures.iter_mut().find(|r| r.matches(request))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.failure)
    }

    async fn route(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let path: Vec<&str> = request.path.iter().map(String::as_str).collect();
        if path.is_empty() && request.method == Method::Put {
            return Ok(self.create_database());
        }
        if !self.exists() {
            return Ok(error_response(404, "not_found", "no_db_file"));
        }

        match (request.method, path.as_slice()) {
            (Method::Get, []) => self.database_info().await,
            (Method::Get, ["_local", id]) => self.get_local(id).await,
            (Method::Put, ["_local", id]) => self.put_local(id, request.body).await,
            (Method::Post, ["_revs_diff"]) => self.revs_diff(request.body).await,
            (Method::Post, ["_bulk_docs"]) => self.bulk_docs(request.body).await,
            (Method::Get, ["_changes"]) => self.changes(&request).await,
            (Method::Get, [doc_id]) => self.get_document(doc_id, &request).await,
            (Method::Get, [doc_id, attachment]) => {
                self.get_attachment(doc_id, attachment, &request).await
            }
            _ => Ok(error_response(405, "method_not_allowed", &request.path_string())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Database
    // ─────────────────────────────────────────────────────────────────────────

    fn create_database(&self) -> RemoteResponse {
        if self.exists.swap(true, Ordering::SeqCst) {
            error_response(412, "file_exists", "database already exists")
        } else {
            tracing::debug!(url = %self.url, "created remote database");
            RemoteResponse::json(201, json!({"ok": true}))
        }
    }

    async fn database_info(&self) -> Result<RemoteResponse> {
        let seq = self.db.transact(|txn| txn.last_sequence()).await?;
        Ok(RemoteResponse::json(
            200,
            json!({"db_name": self.db.name(), "update_seq": seq}),
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local documents
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_local(&self, id: &str) -> Result<RemoteResponse> {
        let doc_id = format!("{LOCAL_DOC_PREFIX}{id}");
        let lookup = doc_id.clone();
        let doc = self
            .db
            .transact(move |txn| txn.get_local_document(&lookup))
            .await?;
        Ok(match doc {
            Some(doc) => {
                let mut body = doc.body;
                body.insert("_id".into(), Value::String(doc_id));
                body.insert("_rev".into(), Value::String(doc.rev_id.to_string()));
                RemoteResponse::json(200, Value::Object(body))
            }
            None => error_response(404, "not_found", "missing"),
        })
    }

    async fn put_local(&self, id: &str, body: Option<Value>) -> Result<RemoteResponse> {
        let Some(Value::Object(mut body)) = body else {
            return Ok(error_response(400, "bad_request", "body must be an object"));
        };
        let prev = match body.remove("_rev") {
            Some(Value::String(rev)) => match RevId::parse(&rev) {
                Ok(rev) => Some(rev),
                Err(e) => return Ok(error_response(400, "bad_request", &e.to_string())),
            },
            _ => None,
        };
        body.remove("_id");

        let doc_id = format!("{LOCAL_DOC_PREFIX}{id}");
        let put_id = doc_id.clone();
        let result = self
            .db
            .transact(move |txn| txn.put_local_document(&put_id, &body, prev.as_ref()))
            .await;
        Ok(match result {
            Ok(rev) => RemoteResponse::json(201, json!({"ok": true, "id": doc_id, "rev": rev})),
            Err(StoreError::Conflict { .. }) => {
                error_response(409, "conflict", "Document update conflict.")
            }
            Err(e) => return Err(e.into()),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replication endpoints
    // ─────────────────────────────────────────────────────────────────────────

    async fn revs_diff(&self, body: Option<Value>) -> Result<RemoteResponse> {
        let Some(body) = body else {
            return Ok(error_response(400, "bad_request", "missing body"));
        };
        let revs: BTreeMap<String, Vec<RevId>> = match serde_json::from_value(body) {
            Ok(revs) => revs,
            Err(e) => return Ok(error_response(400, "bad_request", &e.to_string())),
        };
        let diff = self.db.transact(move |txn| txn.revs_diff(&revs)).await?;
        Ok(RemoteResponse::json(200, serde_json::to_value(diff)?))
    }

    /// Only `new_edits: false` is supported: revisions are inserted with
    /// their history, one transaction per document.
    async fn bulk_docs(&self, body: Option<Value>) -> Result<RemoteResponse> {
        let Some(body) = body else {
            return Ok(error_response(400, "bad_request", "missing body"));
        };
        if body.get("new_edits").and_then(Value::as_bool) != Some(false) {
            return Ok(error_response(400, "bad_request", "new_edits must be false"));
        }
        let Some(docs) = body.get("docs").and_then(Value::as_array) else {
            return Ok(error_response(400, "bad_request", "missing docs"));
        };

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(props) = doc.as_object() else {
                results.push(json!({"error": "bad_request", "reason": "document is not an object"}));
                continue;
            };
            let (rev, mut history) = match Revision::from_properties(props) {
                Ok(parsed) => parsed,
                Err(e) => {
                    results.push(json!({
                        "id": props.get("_id"),
                        "error": "bad_request",
                        "reason": e.to_string(),
                    }));
                    continue;
                }
            };
            if history.is_empty() {
                history.push(rev.rev_id.clone());
            }
            let doc_id = rev.doc_id.clone();
            let rev_id = rev.rev_id.clone();
            let inserted = self
                .db
                .transact(move |txn| txn.force_insert(&rev, &history))
                .await;
            match inserted {
                Ok(_) => results.push(json!({"id": doc_id, "rev": rev_id})),
                Err(e) => {
                    let (error, reason) = match &e {
                        StoreError::Validation(ValidationError::Rejected { reason, .. }) => {
                            ("forbidden", reason.clone())
                        }
                        other => ("bad_request", other.to_string()),
                    };
                    tracing::debug!(doc_id = %doc_id, rev_id = %rev_id, error, reason = %reason, "rejected replicated revision");
                    results.push(json!({
                        "id": doc_id,
                        "rev": rev_id,
                        "error": error,
                        "reason": reason,
                    }));
                }
            }
        }
        Ok(RemoteResponse::json(201, Value::Array(results)))
    }

    async fn changes(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        let since: Sequence = match request.query_value("since") {
            Some(s) => match s.parse() {
                Ok(seq) => seq,
                Err(_) => return Ok(error_response(400, "bad_request", "invalid since")),
            },
            None => 0,
        };
        let limit: Option<usize> = request.query_value("limit").and_then(|l| l.parse().ok());

        let filter = match request.query_value("filter") {
            None => ChangesFilter::All,
            Some("_doc_ids") => {
                let ids: Vec<String> = request
                    .query_value("doc_ids")
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or_default();
                ChangesFilter::DocIds(ids)
            }
            Some(name) => {
                let Some(filter) = self.db.filter(name) else {
                    return Ok(error_response(404, "not_found", "missing filter"));
                };
                let params: Properties = request
                    .query
                    .iter()
                    .filter(|(k, _)| !CHANGES_PARAMS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                ChangesFilter::Named(filter, params)
            }
        };

        let (results, last_seq) = self
            .db
            .transact(move |txn| {
                let changes = txn.changes_since(since, limit)?;
                let last_seq = changes.max_sequence().unwrap_or(since);
                let mut results = Vec::new();
                for change in changes {
                    let keep = match &filter {
                        ChangesFilter::All => true,
                        ChangesFilter::DocIds(ids) => ids.contains(&change.doc_id),
                        ChangesFilter::Named(filter, params) => {
                            match txn.get_document(
                                &change.doc_id,
                                Some(&change.rev_id),
                                ContentOptions::default(),
                            )? {
                                Some(rev) => filter.matches(&rev, params),
                                None => false,
                            }
                        }
                    };
                    if !keep {
                        continue;
                    }
                    let mut entry = json!({
                        "seq": change.sequence,
                        "id": change.doc_id,
                        "changes": [{"rev": change.rev_id}],
                    });
                    if change.deleted {
                        entry["deleted"] = Value::Bool(true);
                    }
                    results.push(entry);
                }
                Ok((results, last_seq))
            })
            .await?;

        Ok(RemoteResponse::json(
            200,
            json!({"results": results, "last_seq": last_seq}),
        ))
    }

    async fn get_document(&self, doc_id: &str, request: &RemoteRequest) -> Result<RemoteResponse> {
        let rev_id = match request.query_value("rev").map(RevId::parse).transpose() {
            Ok(rev) => rev,
            Err(e) => return Ok(error_response(400, "bad_request", &e.to_string())),
        };
        let with_revs = request.query_value("revs") == Some("true");
        let with_attachments = request.query_value("attachments") == Some("true");
        let threshold = self.follows_threshold;

        let doc_id = doc_id.to_string();
        let props = self
            .db
            .transact(move |txn| {
                let Some(mut rev) = txn.get_document(&doc_id, rev_id.as_ref(), ContentOptions::default())?
                else {
                    return Ok(None);
                };
                if with_attachments {
                    for att in rev.attachments.values_mut() {
                        let Some(key) = att.digest else { continue };
                        if att.length > threshold {
                            att.data = AttachmentData::Follows;
                        } else if let Some(bytes) = txn.blobs().read_blob(&key)? {
                            att.data = AttachmentData::Inline(bytes);
                        }
                    }
                }
                let history = if with_revs {
                    Some(txn.get_revision_history(&doc_id, &rev.rev_id)?)
                } else {
                    None
                };
                Ok(Some(rev.to_properties(history.as_deref())))
            })
            .await?;

        Ok(match props {
            Some(props) => RemoteResponse::json(200, Value::Object(props)),
            None => error_response(404, "not_found", "missing"),
        })
    }

    async fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse> {
        let rev_id = match request.query_value("rev").map(RevId::parse).transpose() {
            Ok(rev) => rev,
            Err(e) => return Ok(error_response(400, "bad_request", &e.to_string())),
        };
        let doc_id = doc_id.to_string();
        let name = name.to_string();
        let found = self
            .db
            .transact(move |txn| {
                let rev_id = match rev_id {
                    Some(rev_id) => rev_id,
                    None => match txn.get_document(&doc_id, None, ContentOptions::metadata())? {
                        Some(rev) => rev.rev_id,
                        None => return Ok(None),
                    },
                };
                txn.get_attachment(&doc_id, &rev_id, &name)
            })
            .await?;
        Ok(match found {
            Some((_, bytes)) => RemoteResponse::bytes(200, bytes),
            None => error_response(404, "not_found", "missing attachment"),
        })
    }
}

/// Query keys of `_changes` that are not filter parameters.
const CHANGES_PARAMS: &[&str] = &["since", "limit", "style", "filter", "doc_ids", "feed"];

enum ChangesFilter {
    All,
    DocIds(Vec<String>),
    Named(Arc<dyn RevisionFilter>, Properties),
}

fn error_response(status: u16, error: &str, reason: &str) -> RemoteResponse {
    RemoteResponse::json(status, json!({"error": error, "reason": reason}))
}

#[async_trait]
impl RemoteTransport for MemoryPeer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let line = format!("{} {}", request.method, request.path_string());
        tracing::trace!(url = %self.url, request = %line, "memory peer request");
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!("{}: connection refused", self.url)));
        }
        match self.take_failure(&request) {
            Some(InjectedFailure::Status(status)) => {
                return Ok(error_response(status, "injected", "injected failure"));
            }
            Some(InjectedFailure::Disconnect) => {
                return Err(SyncError::Transport(format!("{}: connection reset", self.url)));
            }
            None => {}
        }
        self.route(request).await
    }
}
