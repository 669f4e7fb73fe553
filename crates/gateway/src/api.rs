//! HTTP edge: one route per request type, plus discovery and status.

use crate::dispatcher::RelayRequest;
use crate::error::RelayError;
use crate::pending::ShapeHints;
use crate::response::{shape_reply, ShapedReply};
use crate::ws_server::relay_ws_handler;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use common::RequestKind;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

/// Build the public router: the peer WebSocket endpoint, one HTTP route
/// per request type, and the discovery/status routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/relay", get(relay_ws_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/clients", get(clients_handler));

    for kind in RequestKind::ALL {
        router = router.route(&format!("/{}", kind.as_str()), any(relay_handler));
    }

    router.with_state(state).layer(CorsLayer::permissive())
}

/// Liveness probe.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","clients":{},"pending":{}}}"#,
        state.registry.len(),
        state.pending.len()
    )
}

/// `GET /api/status`: service identity and connection counts.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "websocket": {
            "connectedClients": state.registry.len(),
            "pendingRequests": state.pending.len(),
            "instance": state.config.instance_id,
        },
    }))
}

/// `GET /clients`: peers visible to the API key, local and directory.
async fn clients_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(api_key) = api_key_from(&headers) else {
        return error_response(RelayError::AuthDenied, None);
    };
    if !state.auth.validate_key(&api_key).await {
        return error_response(RelayError::AuthDenied, None);
    }

    let mut clients: Vec<Value> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for session in state.registry.sessions_by_api_key(&api_key) {
        seen.push(session.client_id.clone());
        let mut entry = json!({
            "id": session.client_id,
            "instance": state.config.instance_id,
            "lastSeen": session.last_seen(),
            "connectedSince": session.connected_at,
        });
        if let Value::Object(map) = serde_json::to_value(&session.metadata).unwrap_or_default() {
            entry.as_object_mut().unwrap().extend(map);
        }
        clients.push(entry);
    }

    // Peers on other replicas, via the directory.
    if let Some(directory) = &state.directory {
        for client in directory.list_by_api_key(&api_key).await {
            if !seen.contains(&client.id) {
                clients.push(serde_json::to_value(&client).unwrap_or_default());
            }
        }
    }

    Json(json!({ "total": clients.len(), "clients": clients })).into_response()
}

/// Generic relay handler behind every request-type route.
async fn relay_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    // The route table only maps known types, so this lookup cannot miss.
    let Some(kind) = RequestKind::from_str(uri.path().trim_start_matches('/')) else {
        return error_response(
            RelayError::BadRequest("Unknown request type".to_string()),
            None,
        );
    };

    let Some(api_key) = api_key_from(&headers) else {
        return error_response(RelayError::AuthDenied, None);
    };

    let body_map = match parse_body(&body) {
        Ok(map) => map,
        Err(e) => return error_response(e, None),
    };

    let client_id = body_map
        .get("clientId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| query.get("clientId").cloned());
    let Some(client_id) = client_id.filter(|id| !id.is_empty()) else {
        return error_response(
            RelayError::BadRequest("clientId is required".to_string()),
            None,
        );
    };

    let deadline = query
        .get("timeout")
        .and_then(|t| t.parse::<u64>().ok())
        .map(|ms| state.config.clamp_timeout(ms))
        .unwrap_or_else(|| state.config.timeout_for(kind));

    let shape_hints = ShapeHints {
        format: query
            .get("format")
            .cloned()
            .or_else(|| value_str(&body_map, "format")),
        active_tab: query
            .get("activeTab")
            .and_then(|t| t.parse().ok())
            .or_else(|| {
                body_map
                    .get("activeTab")
                    .and_then(Value::as_u64)
                    .map(|t| t as usize)
            }),
        filename: query
            .get("filename")
            .cloned()
            .or_else(|| value_str(&body_map, "filename")),
    };

    // Everything except the routing fields passes through opaquely.
    let mut payload = body_map;
    payload.remove("clientId");
    for (key, value) in &query {
        if key == "clientId" || key == "timeout" {
            continue;
        }
        payload
            .entry(key.clone())
            .or_insert_with(|| Value::String(value.clone()));
    }

    let request = RelayRequest {
        kind,
        api_key,
        target_client_id: client_id.clone(),
        payload,
        deadline,
        shape_hints: shape_hints.clone(),
    };

    match state.dispatcher.relay(request).await {
        Ok((request_id, reply)) => {
            shaped_response(shape_reply(kind, &shape_hints, &client_id, &request_id, reply))
        }
        Err(e) => error_response(e, Some(&client_id)),
    }
}

fn api_key_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|k| !k.is_empty())
}

/// Parse an optional JSON object body. Empty bodies are fine; anything
/// else must be a JSON object.
fn parse_body(body: &Bytes) -> crate::error::Result<Map<String, Value>> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RelayError::BadRequest(
            "request body must be a JSON object".to_string(),
        )),
        Err(e) => Err(RelayError::BadRequest(format!("invalid JSON body: {e}"))),
    }
}

fn value_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn shaped_response(reply: ShapedReply) -> Response {
    match reply {
        ShapedReply::Json { status, body } => (status, Json(body)).into_response(),
        ShapedReply::Html(doc) => Html(doc).into_response(),
        ShapedReply::Binary {
            content_type,
            filename,
            bytes,
        } => {
            let disposition = format!("attachment; filename=\"{}\"", filename);
            match Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_DISPOSITION, disposition)
                .header(header::CONTENT_LENGTH, bytes.len())
                .body(axum::body::Body::from(bytes))
            {
                Ok(response) => response,
                Err(e) => {
                    error!("Failed to build binary response: {}", e);
                    error_response(RelayError::Internal(e.to_string()), None)
                }
            }
        }
    }
}

/// Error body: `{requestId?, clientId?, error}` with the status from the
/// error kind.
fn error_response(error: RelayError, client_id: Option<&str>) -> Response {
    let mut body = Map::new();
    if let Some(client_id) = client_id {
        body.insert("clientId".to_string(), Value::String(client_id.to_string()));
    }
    body.insert("error".to_string(), Value::String(error.to_string()));
    (error.status(), Json(Value::Object(body))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body() {
        assert!(parse_body(&Bytes::new()).unwrap().is_empty());
        let map = parse_body(&Bytes::from(r#"{"formula":"1d20"}"#)).unwrap();
        assert_eq!(map.get("formula"), Some(&Value::String("1d20".into())));
        assert!(parse_body(&Bytes::from("[1,2]")).is_err());
        assert!(parse_body(&Bytes::from("{nope")).is_err());
    }

    #[test]
    fn test_api_key_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(api_key_from(&headers).is_none());
        headers.insert("x-api-key", "k1".parse().unwrap());
        assert_eq!(api_key_from(&headers).as_deref(), Some("k1"));
        headers.insert("x-api-key", "".parse().unwrap());
        assert!(api_key_from(&headers).is_none());
    }
}
