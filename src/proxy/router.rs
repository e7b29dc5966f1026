//! Request router and correlator for one backend.
//!
//! Client request ids are only unique per connection, so every forwarded
//! request gets a backend-facing id from a per-backend counter. The call
//! record remembers which connection asked and under which id; the response
//! is rewritten back to that id on delivery. A record is removed exactly once:
//! by its response, its timeout, its connection closing, or the backend
//! failing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::errors::ProxyError;
use super::lock;
use super::types::{error_codes, BackendId, ConnectionId, Request, RequestId, Response};

/// An outstanding forwarded request.
#[derive(Debug)]
pub struct CallRecord {
    pub connection: ConnectionId,
    pub original_id: RequestId,
    pub backend: BackendId,
    pub tool: Option<String>,
    pub deadline: Instant,
    reply: oneshot::Sender<Response>,
}

/// Caller's half of a registered call.
#[derive(Debug)]
pub struct PendingCall {
    upstream_id: u64,
    original_id: RequestId,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Response>,
}

impl PendingCall {
    pub fn upstream_id(&self) -> u64 {
        self.upstream_id
    }
}

pub struct Router {
    backend: String,
    backend_id: BackendId,
    next_id: AtomicU64,
    records: Mutex<BTreeMap<u64, CallRecord>>,
    orphaned: AtomicU64,
}

impl Router {
    pub fn new(backend_id: BackendId, backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            backend_id,
            next_id: AtomicU64::new(1),
            records: Mutex::new(BTreeMap::new()),
            orphaned: AtomicU64::new(0),
        }
    }

    /// Register a call and return it together with the request to send
    /// upstream (same request, backend-facing id).
    ///
    /// Rejects an id the same connection already has in flight.
    pub fn begin(
        &self,
        connection: ConnectionId,
        request: Request,
        tool: Option<String>,
        timeout: Duration,
    ) -> Result<(PendingCall, Request), ProxyError> {
        let deadline = Instant::now() + timeout;
        let (reply, rx) = oneshot::channel();

        let mut records = lock(&self.records);
        if records
            .values()
            .any(|r| r.connection == connection && r.original_id == request.id)
        {
            return Err(ProxyError::DuplicateRequest {
                id: request.id.to_string(),
            });
        }

        let upstream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let original_id = request.id.clone();
        records.insert(
            upstream_id,
            CallRecord {
                connection,
                original_id: original_id.clone(),
                backend: self.backend_id,
                tool,
                deadline,
                reply,
            },
        );
        drop(records);

        let upstream = Request {
            // Counter values stay far below i64::MAX.
            id: RequestId::Number(upstream_id as i64),
            ..request
        };
        Ok((
            PendingCall {
                upstream_id,
                original_id,
                deadline,
                timeout,
                rx,
            },
            upstream,
        ))
    }

    /// Await the response for `pending`, or synthesize a timeout error once
    /// its deadline passes (removing the record).
    pub async fn wait(&self, pending: PendingCall) -> Response {
        let PendingCall {
            upstream_id,
            original_id,
            deadline,
            timeout,
            rx,
        } = pending;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::error(
                original_id,
                error_codes::BACKEND_UNAVAILABLE,
                format!("backend '{}' dropped the request", self.backend),
            ),
            Err(_) => {
                let removed = lock(&self.records).remove(&upstream_id);
                let tool = removed.and_then(|r| r.tool);
                tracing::warn!(
                    backend = %self.backend,
                    upstream_id,
                    tool = tool.as_deref().unwrap_or("-"),
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                let err = ProxyError::TimeoutError {
                    backend: self.backend.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                Response::error(original_id, err.error_code(), err.to_string())
            }
        }
    }

    /// Deliver a backend response to whoever is waiting for it.
    ///
    /// Returns false for responses nobody is waiting for (already timed out,
    /// connection gone, or an id the proxy never issued).
    pub fn complete(&self, response: Response) -> bool {
        let record = match &response.id {
            RequestId::Number(n) => u64::try_from(*n)
                .ok()
                .and_then(|id| lock(&self.records).remove(&id)),
            RequestId::String(_) => None,
        };

        let Some(record) = record else {
            let total = self.orphaned.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                backend = %self.backend,
                id = %response.id,
                orphaned_total = total,
                "discarding response with no matching request"
            );
            return false;
        };

        let response = Response {
            id: record.original_id,
            ..response
        };
        if record.reply.send(response).is_err() {
            tracing::debug!(backend = %self.backend, "caller went away before its response arrived");
        }
        true
    }

    /// Drop a record whose request never made it to the backend.
    pub fn abandon(&self, upstream_id: u64) {
        lock(&self.records).remove(&upstream_id);
    }

    /// Drop every record belonging to a closed connection.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, r| r.connection != connection);
        let dropped = before - records.len();
        if dropped > 0 {
            tracing::debug!(
                backend = %self.backend,
                connection = %connection,
                dropped,
                "discarded in-flight calls of closed connection"
            );
        }
        dropped
    }

    /// Fail every outstanding call with a backend-unavailable error.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained = std::mem::take(&mut *lock(&self.records));
        let count = drained.len();
        for (_, record) in drained {
            let err = ProxyError::BackendUnavailable {
                backend: self.backend.clone(),
                reason: reason.to_string(),
            };
            let _ = record.reply.send(Response::error(
                record.original_id,
                err.error_code(),
                err.to_string(),
            ));
        }
        if count > 0 {
            tracing::warn!(backend = %self.backend, failed = count, reason, "failed in-flight calls");
        }
        count
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.records).len()
    }

    /// Responses received that matched no record.
    pub fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(BackendId(1), "demo"))
    }

    fn ping(id: impl Into<RequestId>) -> Request {
        Request::new(id, "ping", None)
    }

    #[tokio::test]
    async fn test_response_restored_to_client_id() {
        let router = router();
        let conn = ConnectionId::new();
        let (pending, upstream) = router
            .begin(conn, ping("client-7"), None, Duration::from_secs(5))
            .unwrap();
        assert_ne!(upstream.id, RequestId::from("client-7"));

        assert!(router.complete(Response::success(upstream.id.clone(), json!({"ok": 1}))));
        let response = router.wait(pending).await;
        assert_eq!(response.id, RequestId::from("client-7"));
        assert_eq!(response.result(), Some(&json!({"ok": 1})));
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_same_id_on_two_connections_does_not_collide() {
        let router = router();
        let (a, up_a) = router
            .begin(ConnectionId::new(), ping(1), None, Duration::from_secs(5))
            .unwrap();
        let (b, up_b) = router
            .begin(ConnectionId::new(), ping(1), None, Duration::from_secs(5))
            .unwrap();
        assert_ne!(up_a.id, up_b.id);

        // Answer out of order.
        router.complete(Response::success(up_b.id, json!("b")));
        router.complete(Response::success(up_a.id, json!("a")));
        assert_eq!(router.wait(a).await.result(), Some(&json!("a")));
        assert_eq!(router.wait(b).await.result(), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_many_concurrent_calls_each_get_their_own_response() {
        let router = router();
        let conn = ConnectionId::new();
        let mut pending = Vec::new();
        for i in 0..50 {
            let (call, upstream) = router
                .begin(conn, ping(i), None, Duration::from_secs(5))
                .unwrap();
            pending.push((i, call, upstream));
        }
        for (i, _, upstream) in pending.iter().rev() {
            router.complete(Response::success(upstream.id.clone(), json!(i)));
        }
        for (i, call, _) in pending {
            let response = router.wait(call).await;
            assert_eq!(response.id, RequestId::from(i));
            assert_eq!(response.result(), Some(&json!(i)));
        }
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_rejected() {
        let router = router();
        let conn = ConnectionId::new();
        let _first = router
            .begin(conn, ping(1), None, Duration::from_secs(5))
            .unwrap();
        let err = router
            .begin(conn, ping(1), None, Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.error_code(), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_timeout_removes_record_and_late_response_is_orphaned() {
        let router = router();
        let (pending, upstream) = router
            .begin(
                ConnectionId::new(),
                ping(3),
                Some("slow".into()),
                Duration::from_millis(20),
            )
            .unwrap();

        let response = router.wait(pending).await;
        assert_eq!(response.id, RequestId::from(3));
        assert_eq!(
            response.rpc_error().map(|e| e.code),
            Some(error_codes::REQUEST_TIMEOUT)
        );
        assert_eq!(router.in_flight(), 0);

        assert!(!router.complete(Response::success(upstream.id, json!(null))));
        assert_eq!(router.orphaned(), 1);
    }

    #[tokio::test]
    async fn test_fail_connection_only_touches_that_connection() {
        let router = router();
        let gone = ConnectionId::new();
        let alive = ConnectionId::new();
        let _a = router.begin(gone, ping(1), None, Duration::from_secs(5)).unwrap();
        let _b = router.begin(gone, ping(2), None, Duration::from_secs(5)).unwrap();
        let _c = router.begin(alive, ping(1), None, Duration::from_secs(5)).unwrap();

        assert_eq!(router.fail_connection(gone), 2);
        assert_eq!(router.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_answers_every_waiter() {
        let router = router();
        let conn = ConnectionId::new();
        let (first, _) = router.begin(conn, ping(1), None, Duration::from_secs(5)).unwrap();
        let (second, _) = router.begin(conn, ping(2), None, Duration::from_secs(5)).unwrap();

        assert_eq!(router.fail_all("backend process exited"), 2);
        for call in [first, second] {
            let response = router.wait(call).await;
            assert_eq!(
                response.rpc_error().map(|e| e.code),
                Some(error_codes::BACKEND_UNAVAILABLE)
            );
        }
        assert_eq!(router.in_flight(), 0);
    }

    #[test]
    fn test_unknown_ids_are_orphans() {
        let router = router();
        assert!(!router.complete(Response::success(RequestId::from("x"), json!(1))));
        assert!(!router.complete(Response::success(RequestId::Number(-4), json!(1))));
        assert_eq!(router.orphaned(), 2);
    }
}
