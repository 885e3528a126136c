//! Remote request dispatch: admission, concurrency limit, timeout, and a
//! registry of requests in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};

use crate::error::{Result, SyncError};
use crate::transport::{Method, RemoteRequest, RemoteResponse, RemoteTransport};

/// A request currently in flight.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: u64,
    pub method: Method,
    pub path: String,
    pub started: Instant,
}

/// Tracks every outstanding remote request of one replicator.
#[derive(Debug)]
pub struct RequestRegistry {
    requests: Mutex<HashMap<u64, RequestInfo>>,
    next_id: AtomicU64,
    count: watch::Sender<usize>,
}

impl RequestRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            count: watch::Sender::new(0),
        })
    }

    /// Register a request. It stays registered until the guard drops,
    /// whether the request completed, failed or was aborted.
    pub fn add_remote_request(self: &Arc<Self>, request: &RemoteRequest) -> RequestGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = RequestInfo {
            id,
            method: request.method,
            path: request.path_string(),
            started: Instant::now(),
        };
        let len = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.insert(id, info);
            requests.len()
        };
        self.count.send_replace(len);
        RequestGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    fn remove_remote_request(&self, id: u64) {
        let len = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.remove(&id);
            requests.len()
        };
        self.count.send_replace(len);
    }

    /// Snapshot of the requests in flight, oldest first.
    pub fn outstanding(&self) -> Vec<RequestInfo> {
        let mut list: Vec<RequestInfo> = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|r| r.id);
        list
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no request is in flight.
    pub async fn wait_empty(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Deregisters its request on drop.
#[derive(Debug)]
pub struct RequestGuard {
    registry: Arc<RequestRegistry>,
    id: u64,
}

impl RequestGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.remove_remote_request(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateState {
    session: u64,
    open: bool,
}

/// Admission control for new requests.
///
/// While closed, new requests wait; requests already past the gate are
/// unaffected. Requests tagged with a session other than the current one
/// are refused with [`SyncError::Cancelled`].
#[derive(Debug)]
pub struct RequestGate {
    state: watch::Sender<GateState>,
}

impl RequestGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: watch::Sender::new(GateState { session: 0, open: true }),
        })
    }

    /// Admit requests of `session`; every other session is superseded.
    pub fn open(&self, session: u64) {
        self.state.send_replace(GateState { session, open: true });
    }

    /// Hold new requests until the next [`open`](Self::open).
    pub fn close(&self) {
        self.state.send_modify(|s| s.open = false);
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    pub fn session(&self) -> u64 {
        self.state.borrow().session
    }

    /// Wait until a request of `session` (or of no session) may be sent.
    pub async fn admit(&self, session: Option<u64>) -> Result<()> {
        let superseded = |s: &GateState| session.is_some_and(|id| id != s.session);
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| s.open || superseded(s))
            .await
            .map_err(|_| SyncError::Cancelled)?;
        if superseded(&state) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

/// Client for one remote database, shared by all tasks of a replicator.
#[derive(Clone)]
pub struct RemoteClient {
    transport: Arc<dyn RemoteTransport>,
    registry: Arc<RequestRegistry>,
    gate: Arc<RequestGate>,
    /// Session the requests of this clone belong to.
    session: Option<u64>,
    limiter: Arc<Semaphore>,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(transport: Arc<dyn RemoteTransport>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            transport,
            registry: RequestRegistry::new(),
            gate: RequestGate::new(),
            session: None,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    /// A clone whose requests belong to `session`.
    pub fn for_session(&self, session: u64) -> Self {
        Self {
            session: Some(session),
            ..self.clone()
        }
    }

    /// Send a request and return the response, whatever its status.
    ///
    /// Waits for a concurrency slot and for the gate; the request is
    /// registered while it is in flight.
    pub async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        self.gate.admit(self.session).await?;
        let _guard = self.registry.add_remote_request(&request);
        let method = request.method;
        let path = request.path_string();
        tracing::trace!(url = %self.url(), %method, path = %path, "sending request");

        match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!("{method} {path}"))),
        }
    }

    /// Send a request; non-2xx statuses become [`SyncError::Http`].
    pub async fn send_async_request(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let method = request.method;
        let path = request.path_string();
        self.send(request).await?.error_for_status(method, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Answers 200 after a delay, recording peak concurrency.
    struct SlowTransport {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTransport for SlowTransport {
        fn url(&self) -> &str {
            "memory://slow"
        }

        async fn send(&self, _request: RemoteRequest) -> Result<RemoteResponse> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RemoteResponse::empty(200))
        }
    }

    fn slow(delay: Duration) -> Arc<SlowTransport> {
        Arc::new(SlowTransport {
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_guard_deregisters() {
        let registry = RequestRegistry::new();
        let a = registry.add_remote_request(&RemoteRequest::get(["_changes"]));
        let b = registry.add_remote_request(&RemoteRequest::get(["doc"]));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.outstanding()[0].path, "/_changes");

        drop(a);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.outstanding()[0].id, b.id());
        drop(b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let transport = slow(Duration::from_millis(20));
        let client = RemoteClient::new(transport.clone(), 2, Duration::from_secs(5));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let client = client.clone();
            tasks.spawn(async move { client.send_async_request(RemoteRequest::get(["doc"])).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
        client.registry().wait_empty().await;
    }

    #[tokio::test]
    async fn test_timeout_releases_registration() {
        let client = RemoteClient::new(slow(Duration::from_secs(5)), 1, Duration::from_millis(20));
        let err = client
            .send_async_request(RemoteRequest::get(["_changes"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_closed_gate_holds_new_requests_only() {
        let transport = slow(Duration::from_millis(50));
        let client = RemoteClient::new(transport.clone(), 4, Duration::from_secs(5)).for_session(1);
        client.gate().open(1);

        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RemoteRequest::get(["a"])).await })
        };
        while client.registry().is_empty() {
            tokio::task::yield_now().await;
        }
        client.gate().close();

        // Already sent: finishes normally.
        assert!(in_flight.await.unwrap().is_ok());

        let held = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RemoteRequest::get(["b"])).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!held.is_finished());
        assert!(client.registry().is_empty());

        client.gate().open(1);
        assert!(held.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_superseded_session_is_refused() {
        let client = RemoteClient::new(slow(Duration::from_millis(1)), 1, Duration::from_secs(5));
        let old = client.for_session(1);
        client.gate().open(1);
        client.gate().close();

        let held = {
            let old = old.clone();
            tokio::spawn(async move { old.send(RemoteRequest::get(["doc"])).await })
        };
        tokio::task::yield_now().await;
        client.gate().open(2);
        assert!(matches!(held.await.unwrap(), Err(SyncError::Cancelled)));

        // Unscoped requests and the current session still go through.
        assert!(client.send(RemoteRequest::get(["doc"])).await.is_ok());
        assert!(client.for_session(2).send(RemoteRequest::get(["doc"])).await.is_ok());
    }

    #[tokio::test]
    async fn test_aborted_request_deregisters() {
        let client = RemoteClient::new(slow(Duration::from_secs(5)), 1, Duration::from_secs(10));
        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RemoteRequest::get(["doc"])).await })
        };
        while client.registry().is_empty() {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        client.registry().wait_empty().await;
    }
}
