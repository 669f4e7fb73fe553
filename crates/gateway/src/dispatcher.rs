//! Request dispatch: local peer, remote replica, or not found.

use crate::auth::ApiKeyAuth;
use crate::directory::Directory;
use crate::error::{RelayError, Result};
use crate::forwarder::{
    ForwardedRequest, ForwardedResult, Forwarder, FAIL_NOT_FOUND, FAIL_UPSTREAM_UNAVAILABLE,
};
use crate::pending::{PendingRequests, ResponseSink, ShapeHints, Waiter, WaiterResult};
use crate::session::{PeerRegistry, PeerSession};
use chrono::Utc;
use common::{RequestKind, WireMessage};
use metrics::counter;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A typed request descriptor built by the HTTP edge.
pub struct RelayRequest {
    pub kind: RequestKind,
    pub api_key: String,
    pub target_client_id: String,
    pub payload: Map<String, Value>,
    pub deadline: Duration,
    pub shape_hints: ShapeHints,
}

/// Routes requests to the peer session that owns the target client id,
/// locally or through the forwarder.
pub struct Dispatcher {
    registry: Arc<PeerRegistry>,
    pending: Arc<PendingRequests>,
    directory: Option<Directory>,
    forwarder: Option<Arc<Forwarder>>,
    auth: Arc<dyn ApiKeyAuth>,
    replica_id: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PeerRegistry>,
        pending: Arc<PendingRequests>,
        directory: Option<Directory>,
        forwarder: Option<Arc<Forwarder>>,
        auth: Arc<dyn ApiKeyAuth>,
        replica_id: String,
    ) -> Self {
        Self {
            registry,
            pending,
            directory,
            forwarder,
            auth,
            replica_id,
        }
    }

    /// Relay a request end to end: authorize, route, and await the reply
    /// up to the deadline. Returns the correlation id together with the
    /// peer's reply.
    pub async fn relay(&self, req: RelayRequest) -> Result<(String, WireMessage)> {
        if !self.auth.validate_key(&req.api_key).await {
            counter!("relay_requests_total", "outcome" => "auth_denied").increment(1);
            return Err(RelayError::AuthDenied);
        }

        if let Some(session) = self.registry.get(&req.target_client_id) {
            if session.api_key != req.api_key {
                counter!("relay_requests_total", "outcome" => "auth_denied").increment(1);
                return Err(RelayError::AuthDenied);
            }
            return self.relay_local(session, req).await;
        }

        self.relay_remote(req).await
    }

    /// Local hit: register a waiter and write the frame to the session.
    async fn relay_local(
        &self,
        session: Arc<PeerSession>,
        req: RelayRequest,
    ) -> Result<(String, WireMessage)> {
        let request_id = self.pending.next_request_id(req.kind);
        let rx = self.register_local_waiter(&request_id, &req)?;

        let frame = WireMessage::request(req.kind, &request_id, req.payload.clone());
        if !session.send(&frame) {
            self.pending.take(&request_id);
            counter!("relay_requests_total", "outcome" => "upstream_unavailable").increment(1);
            return Err(RelayError::UpstreamUnavailable(
                "peer send failed".to_string(),
            ));
        }

        debug!(
            "Dispatched {} to local client {}",
            request_id, req.target_client_id
        );
        let reply = self.await_reply(&request_id, req.deadline, rx).await?;
        Ok((request_id, reply))
    }

    /// Local miss: consult the directory and hand off to the forwarder.
    async fn relay_remote(&self, req: RelayRequest) -> Result<(String, WireMessage)> {
        let (Some(directory), Some(forwarder)) = (&self.directory, &self.forwarder) else {
            counter!("relay_requests_total", "outcome" => "not_found").increment(1);
            return Err(RelayError::NotFound);
        };

        let owner = match directory.get(&req.target_client_id).await {
            Some(owner) if owner != self.replica_id => owner,
            // A record pointing at this replica with no local session
            // means the peer just vanished; absent means unknown.
            _ => {
                counter!("relay_requests_total", "outcome" => "not_found").increment(1);
                return Err(RelayError::NotFound);
            }
        };

        if !directory
            .api_key_owns(&req.api_key, &req.target_client_id)
            .await
        {
            counter!("relay_requests_total", "outcome" => "auth_denied").increment(1);
            return Err(RelayError::AuthDenied);
        }

        let request_id = self.pending.next_request_id(req.kind);
        let rx = self.register_local_waiter(&request_id, &req)?;

        let fwd = ForwardedRequest {
            request_id: request_id.clone(),
            origin_replica: self.replica_id.clone(),
            kind: req.kind,
            target_client_id: req.target_client_id.clone(),
            api_key: req.api_key.clone(),
            payload: req.payload.clone(),
            deadline_ms: req.deadline.as_millis() as u64,
        };
        if let Err(e) = forwarder.publish_request(&owner, &fwd).await {
            self.pending.take(&request_id);
            warn!("Forward to {} failed: {}", owner, e);
            counter!("relay_requests_total", "outcome" => "upstream_unavailable").increment(1);
            return Err(RelayError::UpstreamUnavailable(
                "broker publish failed".to_string(),
            ));
        }

        debug!(
            "Forwarded {} for {} to replica {}",
            request_id, req.target_client_id, owner
        );
        let reply = self.await_reply(&request_id, req.deadline, rx).await?;
        Ok((request_id, reply))
    }

    /// Target side of a forwarded request: deliver to the local session
    /// under a remapped correlation id, or report failure to the origin.
    pub async fn handle_forwarded(&self, fwd: ForwardedRequest) {
        let Some(forwarder) = &self.forwarder else {
            return;
        };

        let session = match self.registry.get(&fwd.target_client_id) {
            Some(session) if session.api_key == fwd.api_key => session,
            // Vanished (or never ours): tell the origin instead of letting
            // its waiter run out the clock.
            _ => {
                let result = ForwardedResult::failure(&fwd.request_id, FAIL_NOT_FOUND);
                if let Err(e) = forwarder.publish_result(&fwd.origin_replica, &result).await {
                    warn!("Failed to report missing client to origin: {}", e);
                }
                return;
            }
        };

        // Remapped id: origin ids from different replicas could collide
        // with ours.
        let local_id = self.pending.next_request_id(fwd.kind);
        let waiter = Waiter {
            request_id: local_id.clone(),
            kind: fwd.kind,
            origin_replica: fwd.origin_replica.clone(),
            target_client_id: fwd.target_client_id.clone(),
            sink: ResponseSink::Remote {
                origin_replica: fwd.origin_replica.clone(),
                request_id: fwd.request_id.clone(),
            },
            created_at: Utc::now().timestamp_millis(),
            deadline: Instant::now() + Duration::from_millis(fwd.deadline_ms),
            shape_hints: ShapeHints::default(),
        };
        if self.pending.register(waiter).is_err() {
            warn!("Correlation id collision on forwarded request {}", local_id);
            return;
        }

        let frame = WireMessage::request(fwd.kind, &local_id, fwd.payload);
        if !session.send(&frame) {
            self.pending.take(&local_id);
            let result = ForwardedResult::failure(&fwd.request_id, FAIL_UPSTREAM_UNAVAILABLE);
            if let Err(e) = forwarder.publish_result(&fwd.origin_replica, &result).await {
                warn!("Failed to report undeliverable forward to origin: {}", e);
            }
        }
    }

    fn register_local_waiter(
        &self,
        request_id: &str,
        req: &RelayRequest,
    ) -> Result<oneshot::Receiver<WaiterResult>> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            request_id: request_id.to_string(),
            kind: req.kind,
            origin_replica: self.replica_id.clone(),
            target_client_id: req.target_client_id.clone(),
            sink: ResponseSink::Local(tx),
            created_at: Utc::now().timestamp_millis(),
            deadline: Instant::now() + req.deadline,
            shape_hints: req.shape_hints.clone(),
        };
        self.pending
            .register(waiter)
            .map_err(|_| RelayError::Internal("correlation id collision".to_string()))?;
        Ok(rx)
    }

    /// Await the waiter up to the deadline. The atomic `take` arbitrates
    /// the race between a timely reply and the timeout. Dropping this
    /// future (the HTTP caller disconnected) cancels the waiter.
    async fn await_reply(
        &self,
        request_id: &str,
        deadline: Duration,
        mut rx: oneshot::Receiver<WaiterResult>,
    ) -> Result<WireMessage> {
        let mut guard = CancelGuard {
            pending: &*self.pending,
            request_id,
            armed: true,
        };
        let outcome = self.await_reply_inner(request_id, deadline, &mut rx).await;
        guard.armed = false;
        drop(guard);
        outcome
    }

    async fn await_reply_inner(
        &self,
        request_id: &str,
        deadline: Duration,
        rx: &mut oneshot::Receiver<WaiterResult>,
    ) -> Result<WireMessage> {
        match tokio::time::timeout(deadline, &mut *rx).await {
            Ok(Ok(outcome)) => {
                counter!("relay_requests_total", "outcome" => "completed").increment(1);
                outcome
            }
            Ok(Err(_)) => {
                self.pending.take(request_id);
                counter!("relay_requests_total", "outcome" => "upstream_unavailable").increment(1);
                Err(RelayError::UpstreamUnavailable(
                    "waiter dropped".to_string(),
                ))
            }
            Err(_) => {
                if self.pending.take(request_id).is_some() {
                    counter!("relay_requests_total", "outcome" => "timeout").increment(1);
                    return Err(RelayError::Timeout);
                }
                // The router won the race; the reply is already in the
                // channel or arrives never (dropped sender maps to timeout).
                match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RelayError::Timeout),
                }
            }
        }
    }

}

/// Removes the waiter when the awaiting future is dropped before it
/// resolved, so a vanished HTTP caller does not leak table entries. A
/// reply racing the cancellation loses at the atomic `take` and is
/// dropped.
struct CancelGuard<'a> {
    pending: &'a PendingRequests,
    request_id: &'a str,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.cancel(self.request_id, "caller went away");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKeyAuth;
    use crate::session::PeerMetadata;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    fn make_dispatcher(registry: Arc<PeerRegistry>, pending: Arc<PendingRequests>) -> Dispatcher {
        Dispatcher::new(
            registry,
            pending,
            None,
            None,
            Arc::new(StaticKeyAuth::new([])),
            "replica-a".to_string(),
        )
    }

    fn connect(
        registry: &PeerRegistry,
        client_id: &str,
        api_key: &str,
        capacity: usize,
    ) -> (Arc<PeerSession>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(PeerSession::new(
            client_id.to_string(),
            api_key.to_string(),
            PeerMetadata::default(),
            tx,
        ));
        registry.insert(session.clone());
        (session, rx)
    }

    fn roll_request(deadline: Duration) -> RelayRequest {
        let mut payload = Map::new();
        payload.insert("formula".to_string(), Value::String("1d20".to_string()));
        RelayRequest {
            kind: RequestKind::Roll,
            api_key: "k1".to_string(),
            target_client_id: "c1".to_string(),
            payload,
            deadline,
            shape_hints: ShapeHints::default(),
        }
    }

    /// The echo law: a peer that answers with the same request id
    /// completes the HTTP caller's waiter with its payload.
    #[tokio::test]
    async fn test_local_echo() {
        let registry = Arc::new(PeerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (_session, mut peer_rx) = connect(&registry, "c1", "k1", 8);
        let dispatcher = Arc::new(make_dispatcher(registry.clone(), pending.clone()));

        let pending_clone = pending.clone();
        let answer = tokio::spawn(async move {
            // The peer side: read the frame, answer with the request id.
            let frame = peer_rx.recv().await.unwrap();
            let text = match frame {
                Message::Text(t) => t.to_string(),
                other => panic!("expected text frame, got {:?}", other),
            };
            let msg: WireMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(msg.kind, "roll");
            let rid = msg.request_id.unwrap();
            let mut reply_payload = Map::new();
            reply_payload.insert("result".to_string(), Value::from(17));
            let reply = WireMessage::response(RequestKind::Roll, &rid, reply_payload);

            let waiter = pending_clone.take(&rid).expect("waiter registered");
            crate::response::complete(waiter, Ok(reply), None).await;
        });

        let (rid, reply) = dispatcher
            .relay(roll_request(Duration::from_secs(2)))
            .await
            .unwrap();
        answer.await.unwrap();

        assert!(rid.starts_with("roll_"));
        assert_eq!(reply.kind, "roll-result");
        assert_eq!(reply.rest.get("result"), Some(&Value::from(17)));
        assert!(pending.is_empty());
    }

    /// Unknown client with no directory configured resolves NotFound and
    /// leaves the pending table untouched.
    #[tokio::test]
    async fn test_unknown_client() {
        let registry = Arc::new(PeerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let dispatcher = make_dispatcher(registry, pending.clone());

        let mut req = roll_request(Duration::from_secs(1));
        req.target_client_id = "cZ".to_string();
        let err = dispatcher.relay(req).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound));
        assert!(pending.is_empty());
    }

    /// A silent peer runs the waiter out to its deadline; the table is
    /// clean afterwards.
    #[tokio::test]
    async fn test_timeout() {
        let registry = Arc::new(PeerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (_session, _peer_rx) = connect(&registry, "c1", "k1", 8);
        let dispatcher = make_dispatcher(registry, pending.clone());

        let started = Instant::now();
        let err = dispatcher
            .relay(roll_request(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(pending.is_empty());
    }

    /// A saturated session queue fails fast instead of buffering.
    #[tokio::test]
    async fn test_backpressure_fails_fast() {
        let registry = Arc::new(PeerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (session, _peer_rx) = connect(&registry, "c1", "k1", 1);
        // Saturate the queue.
        assert!(session.send(&WireMessage::control("ping")));
        let dispatcher = make_dispatcher(registry, pending.clone());

        let err = dispatcher
            .relay(roll_request(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnavailable(_)));
        assert!(pending.is_empty());
    }

    /// Wrong API key for a connected client is denied, not found.
    #[tokio::test]
    async fn test_api_key_mismatch_denied() {
        let registry = Arc::new(PeerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (_session, _peer_rx) = connect(&registry, "c1", "k-owner", 8);
        let dispatcher = make_dispatcher(registry, pending.clone());

        let err = dispatcher
            .relay(roll_request(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AuthDenied));
    }
}
