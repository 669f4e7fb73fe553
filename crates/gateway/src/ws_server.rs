//! Peer WebSocket endpoint: handshake, keep-alive, disconnect cleanup.

use crate::response;
use crate::session::{PeerMetadata, PeerSession};
use crate::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use common::{CloseReason, WireMessage};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Handshake query parameters on `/relay`.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeParams {
    pub id: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "worldId")]
    pub world_id: Option<String>,
    #[serde(rename = "worldTitle")]
    pub world_title: Option<String>,
    #[serde(rename = "foundryVersion")]
    pub foundry_version: Option<String>,
    #[serde(rename = "systemId")]
    pub system_id: Option<String>,
    #[serde(rename = "systemTitle")]
    pub system_title: Option<String>,
    #[serde(rename = "systemVersion")]
    pub system_version: Option<String>,
    #[serde(rename = "customName")]
    pub custom_name: Option<String>,
}

/// WebSocket upgrade handler for `/relay`.
pub async fn relay_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, params, origin, state))
}

/// Accept the socket, then close it with a handshake rejection code.
async fn reject(mut socket: WebSocket, reason: CloseReason) {
    warn!("Rejecting peer connection: {}", reason.as_str());
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.as_str().into(),
        })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    params: HandshakeParams,
    origin: Option<String>,
    state: Arc<AppState>,
) {
    let Some(client_id) = params.id.clone().filter(|id| !id.is_empty()) else {
        return reject(socket, CloseReason::NoClientId).await;
    };
    let Some(token) = params.token.clone().filter(|t| !t.is_empty()) else {
        return reject(socket, CloseReason::NoAuth).await;
    };
    if !state.auth.validate_key(&token).await {
        return reject(socket, CloseReason::NoAuth).await;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded queue: a saturated peer makes `send` fail fast instead of
    // buffering inside the relay.
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.send_queue);

    let metadata = PeerMetadata {
        world_id: params.world_id,
        world_title: params.world_title,
        foundry_version: params.foundry_version,
        system_id: params.system_id,
        system_title: params.system_title,
        system_version: params.system_version,
        custom_name: params.custom_name,
        origin,
    };
    let session = Arc::new(PeerSession::new(
        client_id.clone(),
        token.clone(),
        metadata,
        tx,
    ));

    // Serialized writer task: per-session writes stay FIFO.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // An older session with the same client id is evicted first, so its
    // 4004 close is observable before this session serves traffic.
    if let Some(old) = state.registry.insert(session.clone()) {
        warn!(
            "Client {} reconnected, closing previous session",
            client_id
        );
        old.close(CloseReason::DuplicateConnection);
        counter!("relay_duplicate_connections_total").increment(1);
    }
    if let Some(directory) = &state.directory {
        directory
            .put(&client_id, &session.api_key, &session.metadata)
            .await;
    }

    counter!("relay_connections_total").increment(1);
    gauge!("relay_active_connections").set(state.registry.len() as f64);
    info!("Client {} connected", client_id);

    // Keep-alive: the peer pings at `ping_interval`; three missed
    // intervals mean the socket is dead.
    let silence_budget_ms = (state.config.ping_interval.as_millis() as i64) * 3;
    let mut keepalive = interval(state.config.ping_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&state, &session, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        session.touch();
                        session.raw_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.touch();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Client {} sent close: {:?}", client_id, frame);
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // The wire contract is text JSON; binary frames are
                        // logged and dropped.
                        warn!("Dropping binary frame from {}", client_id);
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = keepalive.tick() => {
                // Writer gone: a close frame went out (eviction, shutdown)
                // or a write failed. Either way the session is over.
                if send_task.is_finished() {
                    break;
                }
                if session.idle_ms() > silence_budget_ms {
                    warn!(
                        "Client {} silent for {} ms, closing dead socket",
                        client_id,
                        session.idle_ms()
                    );
                    break;
                }
            }
        }
    }

    // Cleanup. A session evicted by a duplicate handshake must leave the
    // replacement's registry entry and directory record alone.
    let was_current = state.registry.remove_if_same(&client_id, &session);
    if was_current {
        if let Some(directory) = &state.directory {
            directory.delete_if_owner(&client_id, &session.api_key).await;
        }
    }
    // Pending waiters for this client keep running to their deadline: the
    // peer may reconnect on another replica within the directory TTL.
    send_task.abort();

    counter!("relay_disconnections_total").increment(1);
    gauge!("relay_active_connections").set(state.registry.len() as f64);
    info!("Client {} disconnected", client_id);
}

/// Parse and route one text frame.
async fn handle_text_frame(state: &Arc<AppState>, session: &Arc<PeerSession>, text: &str) {
    let msg: WireMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Malformed JSON is dropped without closing the session.
            warn!("Malformed frame from {}: {}", session.client_id, e);
            counter!("relay_malformed_frames_total").increment(1);
            return;
        }
    };

    session.touch();
    match msg.kind.as_str() {
        "ping" => {
            session.send(&WireMessage::control("pong"));
            if let Some(directory) = &state.directory {
                directory.refresh(&session.client_id, &session.api_key).await;
            }
        }
        "pong" => {}
        _ => {
            response::route_response(
                &state.pending,
                state.forwarder.as_ref(),
                &session.client_id,
                msg,
            )
            .await;
        }
    }
}
