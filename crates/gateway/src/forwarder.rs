//! Inter-replica forwarder: ships requests to the replica that owns the
//! target peer and carries results back, over NATS core pub/sub.
//!
//! Two subjects per replica: `relay.replica.{R}.requests` and
//! `relay.replica.{R}.results`. Results are idempotent on the receiving
//! side because the pending table's `take` is atomic; a duplicate or late
//! result finds no waiter and is dropped.

use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, Result};
use crate::pending::PendingRequests;
use crate::response;
use common::{RequestKind, WireMessage};
use futures::StreamExt;
use metrics::counter;
use nats_client::NatsClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Failure markers carried on a forwarded result instead of a reply.
pub const FAIL_NOT_FOUND: &str = "not_found";
pub const FAIL_UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";

/// A request shipped from the origin replica to the owner of the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "originReplica")]
    pub origin_replica: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(rename = "clientId")]
    pub target_client_id: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub payload: Map<String, Value>,
    /// Remaining budget for the target-side waiter, in milliseconds.
    #[serde(rename = "deadlineMs")]
    pub deadline_ms: u64,
}

/// A result shipped back to the origin replica under the original
/// request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedResult {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<WireMessage>,
}

impl ForwardedResult {
    pub fn reply(request_id: &str, reply: WireMessage) -> Self {
        Self {
            request_id: request_id.to_string(),
            error: None,
            reply: Some(reply),
        }
    }

    pub fn failure(request_id: &str, marker: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            error: Some(marker.to_string()),
            reply: None,
        }
    }

    /// The origin-side view of this result.
    pub fn into_outcome(self) -> crate::pending::WaiterResult {
        match (self.error.as_deref(), self.reply) {
            (Some(FAIL_NOT_FOUND), _) => Err(RelayError::NotFound),
            (Some(marker), _) => Err(RelayError::UpstreamUnavailable(marker.to_string())),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(RelayError::Internal("empty forwarded result".to_string())),
        }
    }
}

/// Publisher + subscriber pair for this replica's forwarder channels.
pub struct Forwarder {
    nats: NatsClient,
    replica_id: String,
}

impl Forwarder {
    pub fn new(nats: NatsClient, replica_id: String) -> Self {
        Self { nats, replica_id }
    }

    fn requests_subject(replica_id: &str) -> String {
        format!("relay.replica.{}.requests", replica_id)
    }

    fn results_subject(replica_id: &str) -> String {
        format!("relay.replica.{}.results", replica_id)
    }

    /// Publish a forwarded request to the owning replica.
    pub async fn publish_request(&self, target_replica: &str, req: &ForwardedRequest) -> Result<()> {
        let payload = serde_json::to_vec(req)?;
        self.nats
            .publish(&Self::requests_subject(target_replica), payload.into())
            .await
            .map_err(|e| RelayError::Broker(e.to_string()))?;
        counter!("relay_forwarded_requests_total").increment(1);
        Ok(())
    }

    /// Publish a result back to the origin replica.
    pub async fn publish_result(&self, origin_replica: &str, result: &ForwardedResult) -> Result<()> {
        let payload = serde_json::to_vec(result)?;
        self.nats
            .publish(&Self::results_subject(origin_replica), payload.into())
            .await
            .map_err(|e| RelayError::Broker(e.to_string()))?;
        counter!("relay_forwarded_results_total").increment(1);
        Ok(())
    }

    /// Run the subscriber loops for this replica until shutdown.
    pub async fn run(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        pending: Arc<PendingRequests>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut requests = self
            .nats
            .subscribe(&Self::requests_subject(&self.replica_id))
            .await
            .map_err(|e| RelayError::Broker(e.to_string()))?;
        let mut results = self
            .nats
            .subscribe(&Self::results_subject(&self.replica_id))
            .await
            .map_err(|e| RelayError::Broker(e.to_string()))?;

        info!("Forwarder subscribed for replica {}", self.replica_id);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Forwarder received shutdown signal");
                    break;
                }

                msg = requests.next() => {
                    match msg {
                        Some(msg) => match serde_json::from_slice::<ForwardedRequest>(&msg.payload) {
                            Ok(fwd) => {
                                debug!(
                                    "Forwarded request {} for {} from {}",
                                    fwd.request_id, fwd.target_client_id, fwd.origin_replica
                                );
                                dispatcher.handle_forwarded(fwd).await;
                            }
                            Err(e) => warn!("Dropping malformed forwarded request: {}", e),
                        },
                        None => {
                            warn!("Forwarder request subscription ended unexpectedly");
                            break;
                        }
                    }
                }

                msg = results.next() => {
                    match msg {
                        Some(msg) => match serde_json::from_slice::<ForwardedResult>(&msg.payload) {
                            Ok(result) => self.handle_result(&pending, result).await,
                            Err(e) => warn!("Dropping malformed forwarded result: {}", e),
                        },
                        None => {
                            warn!("Forwarder result subscription ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        info!("Forwarder stopped");
        Ok(())
    }

    /// Resolve the origin-side waiter for an inbound result. A result
    /// whose waiter already timed out or resolved finds nothing to take
    /// and is dropped.
    async fn handle_result(&self, pending: &PendingRequests, result: ForwardedResult) {
        let request_id = result.request_id.clone();
        match pending.take(&request_id) {
            Some(waiter) => {
                response::complete(waiter, result.into_outcome(), None).await;
            }
            None => {
                debug!("Dropping result for unknown request {}", request_id);
            }
        }
    }
}
