//! Pending request table: correlation ids and waiters.
//!
//! A waiter is registered before the request frame is written and removed
//! exactly once, by whichever of {response, error, timeout, cancellation}
//! gets to `take` first. The atomic remove is what makes duplicate and
//! late results safe to drop.

use common::{RequestKind, WireMessage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// What a waiter eventually resolves with: the peer's reply, or a relay
/// error (timeout, peer loss, forwarded-in failure).
pub type WaiterResult = crate::error::Result<WireMessage>;

/// Where a completed reply goes.
pub enum ResponseSink {
    /// A locally issued request: the suspended HTTP handler.
    Local(oneshot::Sender<WaiterResult>),
    /// A request forwarded in from another replica: the reply is
    /// published back to the origin under its original request id.
    Remote {
        origin_replica: String,
        request_id: String,
    },
}

/// Per-type formatting hints carried opaquely from the HTTP edge to the
/// response shapers.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ShapeHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "activeTab", skip_serializing_if = "Option::is_none")]
    pub active_tab: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// One suspended request.
pub struct Waiter {
    pub request_id: String,
    pub kind: RequestKind,
    pub origin_replica: String,
    pub target_client_id: String,
    pub sink: ResponseSink,
    pub created_at: i64,
    pub deadline: Instant,
    pub shape_hints: ShapeHints,
}

/// The pending request table.
pub struct PendingRequests {
    waiters: DashMap<String, Waiter>,
    /// Last allocated nanosecond tick; bumped past the clock when it
    /// stalls so ids never repeat within the replica.
    last_nanos: AtomicI64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
            last_nanos: AtomicI64::new(0),
        }
    }

    /// Allocate a correlation id: `{type}_{monotonic-nanos}`.
    pub fn next_request_id(&self, kind: RequestKind) -> String {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let prev = self
            .last_nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(if now > last { now } else { last + 1 })
            })
            .unwrap_or(0);
        let tick = if now > prev { now } else { prev + 1 };
        format!("{}_{}", kind.as_str(), tick)
    }

    /// Register a waiter. A duplicate request id is refused; correlation
    /// ids must stay unique for the table's lifetime.
    pub fn register(&self, waiter: Waiter) -> Result<(), Waiter> {
        match self.waiters.entry(waiter.request_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(waiter),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(waiter);
                Ok(())
            }
        }
    }

    /// Atomically remove a waiter. The second `take` for an id yields
    /// `None`, which is how duplicate and late results are dropped.
    pub fn take(&self, request_id: &str) -> Option<Waiter> {
        self.waiters.remove(request_id).map(|(_, w)| w)
    }

    /// Cancel a waiter (HTTP client gone, peer lost). The removed waiter
    /// is returned so the caller can resolve its sink if needed.
    pub fn cancel(&self, request_id: &str, reason: &str) -> Option<Waiter> {
        let waiter = self.take(request_id)?;
        debug!("Cancelled waiter {}: {}", request_id, reason);
        Some(waiter)
    }

    /// Drain every waiter past its deadline.
    pub fn take_expired(&self, now: Instant) -> Vec<Waiter> {
        let expired: Vec<String> = self
            .waiters
            .iter()
            .filter(|w| w.deadline <= now)
            .map(|w| w.request_id.clone())
            .collect();
        expired.iter().filter_map(|id| self.take(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_waiter(
        table: &PendingRequests,
        kind: RequestKind,
    ) -> (String, oneshot::Receiver<WaiterResult>) {
        let request_id = table.next_request_id(kind);
        let (tx, rx) = oneshot::channel();
        table
            .register(Waiter {
                request_id: request_id.clone(),
                kind,
                origin_replica: "replica-a".to_string(),
                target_client_id: "c1".to_string(),
                sink: ResponseSink::Local(tx),
                created_at: chrono::Utc::now().timestamp_millis(),
                deadline: Instant::now() + Duration::from_secs(10),
                shape_hints: ShapeHints::default(),
            })
            .map_err(|_| ())
            .unwrap();
        (request_id, rx)
    }

    #[test]
    fn test_request_ids_unique_and_tagged() {
        let table = PendingRequests::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let id = table.next_request_id(RequestKind::Roll);
            assert!(id.starts_with("roll_"));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_take_is_exactly_once() {
        let table = PendingRequests::new();
        let (rid, _rx) = make_waiter(&table, RequestKind::Roll);
        assert_eq!(table.len(), 1);
        assert!(table.take(&rid).is_some());
        assert!(table.take(&rid).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_register_refuses_duplicate_id() {
        let table = PendingRequests::new();
        let (rid, _rx) = make_waiter(&table, RequestKind::Roll);
        let (tx, _rx2) = oneshot::channel();
        let dup = Waiter {
            request_id: rid,
            kind: RequestKind::Roll,
            origin_replica: "replica-a".to_string(),
            target_client_id: "c1".to_string(),
            sink: ResponseSink::Local(tx),
            created_at: 0,
            deadline: Instant::now(),
            shape_hints: ShapeHints::default(),
        };
        assert!(table.register(dup).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_expired() {
        let table = PendingRequests::new();
        let (rid_live, _rx1) = make_waiter(&table, RequestKind::Roll);

        let request_id = table.next_request_id(RequestKind::Search);
        let (tx, _rx2) = oneshot::channel();
        table
            .register(Waiter {
                request_id: request_id.clone(),
                kind: RequestKind::Search,
                origin_replica: "replica-a".to_string(),
                target_client_id: "c1".to_string(),
                sink: ResponseSink::Local(tx),
                created_at: 0,
                deadline: Instant::now() - Duration::from_millis(1),
                shape_hints: ShapeHints::default(),
            })
            .map_err(|_| ())
            .unwrap();

        let expired = table.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, request_id);
        assert!(table.take(&rid_live).is_some());
    }

    #[test]
    fn test_cancel_removes() {
        let table = PendingRequests::new();
        let (rid, _rx) = make_waiter(&table, RequestKind::Chat);
        assert!(table.cancel(&rid, "client disconnected").is_some());
        assert!(table.cancel(&rid, "again").is_none());
    }
}
