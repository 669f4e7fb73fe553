//! Peer sessions and the local client table.
//!
//! One `PeerSession` per accepted WebSocket. The registry maps client id
//! to session and keeps a secondary API-key index; both live in DashMaps
//! so no I/O ever happens under a lock.

use axum::extract::ws::Message;
use chrono::Utc;
use common::{CloseReason, WireMessage};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Metadata snapshot taken at handshake, refreshed by pings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerMetadata {
    #[serde(rename = "worldId", skip_serializing_if = "Option::is_none")]
    pub world_id: Option<String>,
    #[serde(rename = "worldTitle", skip_serializing_if = "Option::is_none")]
    pub world_title: Option<String>,
    #[serde(rename = "foundryVersion", skip_serializing_if = "Option::is_none")]
    pub foundry_version: Option<String>,
    #[serde(rename = "systemId", skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(rename = "systemTitle", skip_serializing_if = "Option::is_none")]
    pub system_title: Option<String>,
    #[serde(rename = "systemVersion", skip_serializing_if = "Option::is_none")]
    pub system_version: Option<String>,
    #[serde(rename = "customName", skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// State for a single connected peer.
pub struct PeerSession {
    /// Caller-chosen client id, unique per replica.
    pub client_id: String,
    /// API key the session authenticated with.
    pub api_key: String,
    /// Metadata snapshot from the handshake query parameters.
    pub metadata: PeerMetadata,
    /// Bounded channel into the session's writer task.
    tx: mpsc::Sender<Message>,
    /// Millisecond timestamp when the session connected.
    pub connected_at: i64,
    /// Millisecond timestamp of the last inbound traffic.
    last_seen: AtomicI64,
}

impl PeerSession {
    pub fn new(
        client_id: String,
        api_key: String,
        metadata: PeerMetadata,
        tx: mpsc::Sender<Message>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            client_id,
            api_key,
            metadata,
            tx,
            connected_at: now,
            last_seen: AtomicI64::new(now),
        }
    }

    /// Serialize and queue one text frame. Returns `false` when the
    /// peer's outbound queue is saturated or the socket is gone; the
    /// relay never buffers beyond the queue.
    pub fn send(&self, msg: &WireMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize frame for {}: {}", self.client_id, e);
                return false;
            }
        };
        match self.tx.try_send(Message::Text(json.into())) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send to {} failed: {}", self.client_id, e);
                false
            }
        }
    }

    /// Queue a raw frame (protocol control traffic) on the writer.
    pub fn raw_send(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Queue a close frame with the given reason.
    pub fn close(&self, reason: CloseReason) {
        let frame = axum::extract::ws::CloseFrame {
            code: reason.code(),
            reason: reason.as_str().into(),
        };
        let _ = self.tx.try_send(Message::Close(Some(frame)));
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last inbound traffic.
    pub fn idle_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_seen()
    }
}

/// The local client table: client id → session, plus an API-key index.
pub struct PeerRegistry {
    sessions: DashMap<String, Arc<PeerSession>>,
    by_api_key: DashMap<String, DashSet<String>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_api_key: DashMap::new(),
        }
    }

    /// Insert a session, evicting any existing session with the same
    /// client id. The evicted session has already been removed from both
    /// maps when this returns, so the caller can close it with
    /// `4004 DuplicateConnection` before the new session serves traffic.
    pub fn insert(&self, session: Arc<PeerSession>) -> Option<Arc<PeerSession>> {
        let evicted = self.remove(&session.client_id);
        self.by_api_key
            .entry(session.api_key.clone())
            .or_default()
            .insert(session.client_id.clone());
        self.sessions
            .insert(session.client_id.clone(), session.clone());
        info!("Client {} registered", session.client_id);
        evicted
    }

    /// Remove a client id unconditionally.
    pub fn remove(&self, client_id: &str) -> Option<Arc<PeerSession>> {
        let (_, session) = self.sessions.remove(client_id)?;
        if let Some(ids) = self.by_api_key.get(&session.api_key) {
            ids.remove(client_id);
        }
        info!("Client {} unregistered", client_id);
        Some(session)
    }

    /// Remove a client id only if the registry still maps it to this
    /// exact session. A session evicted by a duplicate handshake must not
    /// tear down its replacement during its own cleanup.
    pub fn remove_if_same(&self, client_id: &str, session: &Arc<PeerSession>) -> bool {
        let matches = self
            .sessions
            .get(client_id)
            .map(|s| Arc::ptr_eq(s.value(), session))
            .unwrap_or(false);
        if matches {
            self.remove(client_id);
        }
        matches
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// Client ids visible to an API key, locally.
    pub fn ids_by_api_key(&self, api_key: &str) -> Vec<String> {
        self.by_api_key
            .get(api_key)
            .map(|ids| ids.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Sessions visible to an API key, locally.
    pub fn sessions_by_api_key(&self, api_key: &str) -> Vec<Arc<PeerSession>> {
        self.ids_by_api_key(api_key)
            .into_iter()
            .filter_map(|id| self.get(&id))
            .collect()
    }

    /// All sessions, for shutdown broadcast and sweeps.
    pub fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue a close frame on sessions idle past `max_idle_ms` and return
    /// them. The socket task finishes the cleanup when the frame drains.
    pub fn sweep_idle(&self, max_idle_ms: i64) -> Vec<Arc<PeerSession>> {
        let stale: Vec<Arc<PeerSession>> = self
            .sessions
            .iter()
            .filter(|s| s.value().idle_ms() > max_idle_ms)
            .map(|s| s.value().clone())
            .collect();
        for session in &stale {
            warn!(
                "Closing stale client {} (idle {} ms)",
                session.client_id,
                session.idle_ms()
            );
            session.close(CloseReason::Normal);
        }
        stale
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn make_session(client_id: &str, api_key: &str) -> (Arc<PeerSession>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        let session = Arc::new(PeerSession::new(
            client_id.to_string(),
            api_key.to_string(),
            PeerMetadata::default(),
            tx,
        ));
        (session, rx)
    }

    #[test]
    fn test_insert_and_api_key_index() {
        let registry = PeerRegistry::new();
        let (s1, _rx1) = make_session("c1", "k1");
        let (s2, _rx2) = make_session("c2", "k1");
        assert!(registry.insert(s1).is_none());
        assert!(registry.insert(s2).is_none());

        let mut ids = registry.ids_by_api_key("k1");
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
        assert!(registry.ids_by_api_key("k2").is_empty());
    }

    #[test]
    fn test_duplicate_eviction_order() {
        let registry = PeerRegistry::new();
        let (old, mut old_rx) = make_session("c1", "k1");
        let (new, _new_rx) = make_session("c1", "k1");
        registry.insert(old.clone());

        let evicted = registry.insert(new.clone()).expect("old session evicted");
        assert!(Arc::ptr_eq(&evicted, &old));
        evicted.close(CloseReason::DuplicateConnection);

        // The close frame is queued on the old socket and the registry
        // now resolves c1 to the new session.
        match old_rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, 4004),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert!(Arc::ptr_eq(&registry.get("c1").unwrap(), &new));
    }

    #[test]
    fn test_remove_if_same_spares_replacement() {
        let registry = PeerRegistry::new();
        let (old, _rx1) = make_session("c1", "k1");
        let (new, _rx2) = make_session("c1", "k1");
        registry.insert(old.clone());
        registry.insert(new.clone());

        // Old session's cleanup runs after it was evicted.
        assert!(!registry.remove_if_same("c1", &old));
        assert!(registry.get("c1").is_some());

        assert!(registry.remove_if_same("c1", &new));
        assert!(registry.get("c1").is_none());
        assert!(registry.ids_by_api_key("k1").is_empty());
    }

    #[test]
    fn test_send_backpressure() {
        let (tx, mut rx) = mpsc::channel(1);
        let session = PeerSession::new(
            "c1".to_string(),
            "k1".to_string(),
            PeerMetadata::default(),
            tx,
        );
        let msg = WireMessage::request(common::RequestKind::Roll, "roll_1", Map::new());
        assert!(session.send(&msg));
        // Queue full: fail fast instead of buffering.
        assert!(!session.send(&msg));
        rx.close();
        assert!(!session.send(&msg));
    }
}
