//! Response routing and the closed set of special response shapers.
//!
//! Correlated replies resolve their waiter through the pending table's
//! atomic `take`. Shaping (sheet HTML, binary downloads) happens at the
//! origin replica's HTTP edge, so forwarded replies cross the broker
//! unmodified.

use crate::error::RelayError;
use crate::forwarder::{ForwardedResult, Forwarder};
use crate::pending::{PendingRequests, ResponseSink, ShapeHints, Waiter, WaiterResult};
use axum::http::StatusCode;
use base64::Engine;
use common::{strip_sensitive, RequestKind, WireMessage};
use metrics::counter;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Route one correlated message from a peer session.
pub async fn route_response(
    pending: &PendingRequests,
    forwarder: Option<&Arc<Forwarder>>,
    client_id: &str,
    msg: WireMessage,
) {
    let Some(request_id) = msg.request_id.clone() else {
        // Unsolicited event messages are not part of the request fabric.
        debug!("Dropping unsolicited {} message from {}", msg.kind, client_id);
        return;
    };

    let Some(waiter) = pending.take(&request_id) else {
        debug!(
            "No waiter for {} from {} (late or duplicate)",
            request_id, client_id
        );
        counter!("relay_responses_dropped_total").increment(1);
        return;
    };

    counter!("relay_responses_total").increment(1);
    complete(waiter, Ok(msg), forwarder).await;
}

/// Resolve a waiter with an outcome, wherever its sink lives.
pub async fn complete(waiter: Waiter, outcome: WaiterResult, forwarder: Option<&Arc<Forwarder>>) {
    match waiter.sink {
        ResponseSink::Local(tx) => {
            // A dropped receiver means the HTTP caller went away; the
            // cancellation already happened through `take`.
            let _ = tx.send(outcome);
        }
        ResponseSink::Remote {
            origin_replica,
            request_id,
        } => {
            let Some(forwarder) = forwarder else {
                warn!("Remote waiter {} with no forwarder configured", request_id);
                return;
            };
            let result = match outcome {
                Ok(reply) => ForwardedResult::reply(&request_id, reply),
                Err(RelayError::NotFound) => {
                    ForwardedResult::failure(&request_id, crate::forwarder::FAIL_NOT_FOUND)
                }
                Err(_) => ForwardedResult::failure(
                    &request_id,
                    crate::forwarder::FAIL_UPSTREAM_UNAVAILABLE,
                ),
            };
            if let Err(e) = forwarder.publish_result(&origin_replica, &result).await {
                warn!("Failed to publish result to {}: {}", origin_replica, e);
            }
        }
    }
}

/// A reply shaped for the HTTP caller.
pub enum ShapedReply {
    Json { status: StatusCode, body: Value },
    Html(String),
    Binary {
        content_type: String,
        filename: String,
        bytes: Vec<u8>,
    },
}

/// Shape a peer reply for the HTTP caller: the generic envelope
/// `{requestId, clientId, ...reply}` with sensitive keys stripped, or one
/// of the two special handlers.
pub fn shape_reply(
    kind: RequestKind,
    hints: &ShapeHints,
    client_id: &str,
    request_id: &str,
    reply: WireMessage,
) -> ShapedReply {
    match kind {
        RequestKind::GetSheet if reply.error.is_none() => {
            shape_sheet(hints, client_id, request_id, reply)
        }
        RequestKind::DownloadFile if reply.error.is_none() && wants_binary(hints) => {
            shape_download(hints, client_id, request_id, reply)
        }
        _ => ShapedReply::Json {
            status: reply_status(&reply),
            body: envelope(client_id, request_id, reply),
        },
    }
}

fn wants_binary(hints: &ShapeHints) -> bool {
    matches!(hints.format.as_deref(), Some("binary") | Some("raw"))
}

/// HTTP status for a generic reply: 200, or the error mapping. Replies
/// whose error names a missing entity map to 404, everything else the
/// peer flags is a 400.
fn reply_status(reply: &WireMessage) -> StatusCode {
    match &reply.error {
        None => StatusCode::OK,
        Some(error) if error.to_ascii_lowercase().contains("not found") => StatusCode::NOT_FOUND,
        Some(_) => StatusCode::BAD_REQUEST,
    }
}

/// The generic response body: `{requestId, clientId, ...reply}` minus the
/// wire `requestId`, with sensitive keys stripped.
fn envelope(client_id: &str, request_id: &str, reply: WireMessage) -> Value {
    let mut body = Map::new();
    body.insert("requestId".to_string(), Value::String(request_id.to_string()));
    body.insert("clientId".to_string(), Value::String(client_id.to_string()));
    if let Some(error) = reply.error {
        body.insert("error".to_string(), Value::String(error));
    }
    for (key, value) in reply.rest {
        if key != "type" && key != "requestId" {
            body.insert(key, value);
        }
    }
    let mut value = Value::Object(body);
    strip_sensitive(&mut value);
    value
}

/// `get-sheet-response`: optional tab activation, then raw JSON or an
/// HTML envelope.
fn shape_sheet(
    hints: &ShapeHints,
    client_id: &str,
    request_id: &str,
    mut reply: WireMessage,
) -> ShapedReply {
    let html = reply
        .rest
        .get("html")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let css = reply
        .rest
        .get("css")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Best-effort transform; the unmodified sheet is always a valid
    // fallback.
    let html = match hints.active_tab {
        Some(index) => activate_tab(&html, index).unwrap_or(html),
        None => html,
    };

    if hints.format.as_deref() == Some("json") {
        reply
            .rest
            .insert("html".to_string(), Value::String(html));
        return ShapedReply::Json {
            status: StatusCode::OK,
            body: envelope(client_id, request_id, reply),
        };
    }

    ShapedReply::Html(html_envelope(&html, &css))
}

/// `download-file-result` with `format=binary|raw`: decode the data URL
/// and hand the bytes back with download headers.
fn shape_download(
    hints: &ShapeHints,
    client_id: &str,
    request_id: &str,
    reply: WireMessage,
) -> ShapedReply {
    let data = reply
        .rest
        .get("fileData")
        .and_then(Value::as_str)
        .unwrap_or_default();

    match decode_data_url(data) {
        Ok((header_mime, bytes)) => {
            let content_type = reply
                .rest
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(header_mime);
            let filename = hints
                .filename
                .clone()
                .or_else(|| {
                    reply
                        .rest
                        .get("filename")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "download.bin".to_string());
            ShapedReply::Binary {
                content_type,
                filename,
                bytes,
            }
        }
        Err(e) => ShapedReply::Json {
            status: StatusCode::BAD_REQUEST,
            body: serde_json::json!({
                "requestId": request_id,
                "clientId": client_id,
                "error": e.to_string(),
            }),
        },
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into its media type and
/// decoded bytes.
pub fn decode_data_url(data: &str) -> crate::error::Result<(String, Vec<u8>)> {
    let rest = data
        .strip_prefix("data:")
        .ok_or_else(|| RelayError::BadRequest("not a data URL".to_string()))?;
    let (header, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| RelayError::BadRequest("data URL is not base64".to_string()))?;
    let mime = if header.is_empty() {
        "application/octet-stream".to_string()
    } else {
        header.to_string()
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| RelayError::BadRequest(format!("invalid base64 payload: {e}")))?;
    Ok((mime, bytes))
}

/// Wrap sheet HTML and CSS into a standalone document.
pub fn html_envelope(html: &str, css: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>\n{css}\n</style>\n</head>\n<body>\n{html}\n</body>\n</html>\n"
    )
}

/// Mark the N-th tab of a sheet document active: every element carrying
/// the selected `data-tab` value gets `active` added to its class list.
/// Returns `None` when the document has no such tab.
pub fn activate_tab(html: &str, index: usize) -> Option<String> {
    // Distinct data-tab values, in document order.
    let mut tabs: Vec<&str> = Vec::new();
    let mut scan = html;
    while let Some(pos) = scan.find("data-tab=\"") {
        let after = &scan[pos + 10..];
        let end = after.find('"')?;
        let value = &after[..end];
        if !tabs.contains(&value) {
            tabs.push(value);
        }
        scan = &after[end..];
    }
    let target = *tabs.get(index)?;
    let needle = format!("data-tab=\"{}\"", target);

    let mut out = String::with_capacity(html.len() + 32);
    let mut remaining = html;
    while let Some(pos) = remaining.find(&needle) {
        let tag_start = remaining[..pos].rfind('<')?;
        let tag_end = pos + remaining[pos..].find('>')?;
        out.push_str(&remaining[..tag_start]);
        let tag = &remaining[tag_start..tag_end];
        out.push_str(&mark_tag_active(tag));
        remaining = &remaining[tag_end..];
    }
    out.push_str(remaining);
    Some(out)
}

/// Add `active` to a tag's class attribute, creating one if missing.
fn mark_tag_active(tag: &str) -> String {
    if let Some(pos) = tag.find("class=\"") {
        let classes_start = pos + 7;
        let classes_end = match tag[classes_start..].find('"') {
            Some(end) => classes_start + end,
            None => return tag.to_string(),
        };
        let classes = &tag[classes_start..classes_end];
        if classes.split_whitespace().any(|c| c == "active") {
            return tag.to_string();
        }
        format!(
            "{}active {}{}",
            &tag[..classes_start],
            classes,
            &tag[classes_end..]
        )
    } else {
        format!("{} class=\"active\"", tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sheet_html() -> &'static str {
        r#"<nav class="sheet-tabs"><a class="item" data-tab="stats">Stats</a><a class="item" data-tab="gear">Gear</a></nav><div class="tab" data-tab="stats">S</div><div class="tab" data-tab="gear">G</div>"#
    }

    #[test]
    fn test_activate_tab_marks_nav_and_pane() {
        let out = activate_tab(sheet_html(), 1).unwrap();
        assert!(out.contains(r#"<a class="active item" data-tab="gear">"#));
        assert!(out.contains(r#"<div class="active tab" data-tab="gear">"#));
        // The other tab is untouched.
        assert!(out.contains(r#"<a class="item" data-tab="stats">"#));
    }

    #[test]
    fn test_activate_tab_out_of_range_is_none() {
        assert!(activate_tab(sheet_html(), 9).is_none());
        assert!(activate_tab("<div>no tabs</div>", 0).is_none());
    }

    #[test]
    fn test_mark_tag_active_without_class() {
        assert_eq!(
            mark_tag_active(r#"<div data-tab="x""#),
            r#"<div data-tab="x" class="active""#
        );
    }

    #[test]
    fn test_mark_tag_active_idempotent() {
        let tag = r#"<div class="active tab" data-tab="x""#;
        assert_eq!(mark_tag_active(tag), tag);
    }

    #[test]
    fn test_decode_data_url() {
        let (mime, bytes) = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_decode_data_url_rejects_malformed() {
        assert!(decode_data_url("nonsense").is_err());
        assert!(decode_data_url("data:image/png;base64,@@@").is_err());
        assert!(decode_data_url("data:image/png,plain").is_err());
    }

    #[test]
    fn test_envelope_strips_wire_fields_and_secrets() {
        let reply: WireMessage = serde_json::from_value(json!({
            "type": "roll-result",
            "requestId": "roll_9",
            "result": 17,
            "apiKey": "leak-me-not",
        }))
        .unwrap();
        let body = envelope("c1", "roll_9", reply);
        assert_eq!(body["requestId"], "roll_9");
        assert_eq!(body["clientId"], "c1");
        assert_eq!(body["result"], 17);
        assert!(body.get("type").is_none());
        assert!(body.get("apiKey").is_none());
    }

    #[test]
    fn test_reply_status_mapping() {
        let ok = WireMessage::control("roll-result");
        assert_eq!(reply_status(&ok), StatusCode::OK);

        let mut bad = WireMessage::control("roll-result");
        bad.error = Some("Invalid formula".to_string());
        assert_eq!(reply_status(&bad), StatusCode::BAD_REQUEST);

        let mut missing = WireMessage::control("entity-result");
        missing.error = Some("Entity not found".to_string());
        assert_eq!(reply_status(&missing), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_shape_download_binary() {
        let hints = ShapeHints {
            format: Some("binary".to_string()),
            ..Default::default()
        };
        let reply: WireMessage = serde_json::from_value(json!({
            "type": "download-file-result",
            "requestId": "download-file_1",
            "fileData": "data:image/png;base64,aGVsbG8=",
            "filename": "x.png",
            "mimeType": "image/png",
        }))
        .unwrap();
        match shape_reply(RequestKind::DownloadFile, &hints, "c1", "download-file_1", reply) {
            ShapedReply::Binary {
                content_type,
                filename,
                bytes,
            } => {
                assert_eq!(content_type, "image/png");
                assert_eq!(filename, "x.png");
                assert_eq!(bytes, b"hello");
            }
            _ => panic!("expected binary reply"),
        }
    }

    #[test]
    fn test_shape_download_json_passthrough() {
        let hints = ShapeHints::default();
        let reply: WireMessage = serde_json::from_value(json!({
            "type": "download-file-result",
            "requestId": "download-file_1",
            "fileData": "data:image/png;base64,aGVsbG8=",
        }))
        .unwrap();
        match shape_reply(RequestKind::DownloadFile, &hints, "c1", "download-file_1", reply) {
            ShapedReply::Json { status, body } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(body["fileData"], "data:image/png;base64,aGVsbG8=");
            }
            _ => panic!("expected json passthrough"),
        }
    }

    #[test]
    fn test_shape_sheet_json_format() {
        let hints = ShapeHints {
            format: Some("json".to_string()),
            active_tab: Some(0),
            ..Default::default()
        };
        let reply: WireMessage = serde_json::from_value(json!({
            "type": "get-sheet-response",
            "requestId": "get-sheet_1",
            "html": sheet_html(),
            "css": ".sheet{}",
            "uuid": "Actor.abc",
        }))
        .unwrap();
        match shape_reply(RequestKind::GetSheet, &hints, "c1", "get-sheet_1", reply) {
            ShapedReply::Json { status, body } => {
                assert_eq!(status, StatusCode::OK);
                assert!(body["html"].as_str().unwrap().contains("active"));
                assert_eq!(body["uuid"], "Actor.abc");
            }
            _ => panic!("expected json sheet"),
        }
    }

    #[test]
    fn test_shape_sheet_html_envelope() {
        let hints = ShapeHints::default();
        let reply: WireMessage = serde_json::from_value(json!({
            "type": "get-sheet-response",
            "requestId": "get-sheet_1",
            "html": "<div>sheet</div>",
            "css": ".sheet{color:red}",
        }))
        .unwrap();
        match shape_reply(RequestKind::GetSheet, &hints, "c1", "get-sheet_1", reply) {
            ShapedReply::Html(doc) => {
                assert!(doc.starts_with("<!DOCTYPE html>"));
                assert!(doc.contains("<div>sheet</div>"));
                assert!(doc.contains(".sheet{color:red}"));
            }
            _ => panic!("expected html document"),
        }
    }

    #[tokio::test]
    async fn test_route_response_without_request_id_is_dropped() {
        let pending = PendingRequests::new();
        let msg = WireMessage::control("chat-message");
        route_response(&pending, None, "c1", msg).await;
        assert!(pending.is_empty());
    }
}
