//! Wire contract shared by the relay and its peers.
//!
//! Every frame in either direction is a JSON object with at least a `type`
//! field. Request frames from relay to peer carry a `requestId`; response
//! frames carry the same `requestId` back and optionally an `error` string.
//! Everything else is payload and passes through the relay untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys removed from every response body before it leaves the relay.
pub const SENSITIVE_KEYS: &[&str] = &["privateKey", "apiKey", "password"];

/// The closed set of request types the relay routes.
///
/// For each base type `t` the peer answers with `t-result`, except
/// `get-sheet` which answers with `get-sheet-response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Search,
    Entity,
    Structure,
    Contents,
    Create,
    Update,
    Delete,
    Rolls,
    LastRoll,
    Roll,
    GetSheet,
    MacroExecute,
    Macros,
    Encounters,
    StartEncounter,
    NextTurn,
    NextRound,
    LastTurn,
    LastRound,
    EndEncounter,
    AddToEncounter,
    RemoveFromEncounter,
    Kill,
    Decrease,
    Increase,
    Give,
    Remove,
    ExecuteJs,
    Select,
    Selected,
    FileSystem,
    UploadFile,
    DownloadFile,
    GetActorDetails,
    ModifyItemCharges,
    UseAbility,
    UseFeature,
    UseSpell,
    UseItem,
    ModifyExperience,
    AddItem,
    RemoveItem,
    GetFolder,
    CreateFolder,
    DeleteFolder,
    ChatMessages,
    Chat,
}

impl RequestKind {
    /// Every routable request type, in wire order.
    pub const ALL: &'static [RequestKind] = &[
        RequestKind::Search,
        RequestKind::Entity,
        RequestKind::Structure,
        RequestKind::Contents,
        RequestKind::Create,
        RequestKind::Update,
        RequestKind::Delete,
        RequestKind::Rolls,
        RequestKind::LastRoll,
        RequestKind::Roll,
        RequestKind::GetSheet,
        RequestKind::MacroExecute,
        RequestKind::Macros,
        RequestKind::Encounters,
        RequestKind::StartEncounter,
        RequestKind::NextTurn,
        RequestKind::NextRound,
        RequestKind::LastTurn,
        RequestKind::LastRound,
        RequestKind::EndEncounter,
        RequestKind::AddToEncounter,
        RequestKind::RemoveFromEncounter,
        RequestKind::Kill,
        RequestKind::Decrease,
        RequestKind::Increase,
        RequestKind::Give,
        RequestKind::Remove,
        RequestKind::ExecuteJs,
        RequestKind::Select,
        RequestKind::Selected,
        RequestKind::FileSystem,
        RequestKind::UploadFile,
        RequestKind::DownloadFile,
        RequestKind::GetActorDetails,
        RequestKind::ModifyItemCharges,
        RequestKind::UseAbility,
        RequestKind::UseFeature,
        RequestKind::UseSpell,
        RequestKind::UseItem,
        RequestKind::ModifyExperience,
        RequestKind::AddItem,
        RequestKind::RemoveItem,
        RequestKind::GetFolder,
        RequestKind::CreateFolder,
        RequestKind::DeleteFolder,
        RequestKind::ChatMessages,
        RequestKind::Chat,
    ];

    /// The wire tag of the request message.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Search => "search",
            RequestKind::Entity => "entity",
            RequestKind::Structure => "structure",
            RequestKind::Contents => "contents",
            RequestKind::Create => "create",
            RequestKind::Update => "update",
            RequestKind::Delete => "delete",
            RequestKind::Rolls => "rolls",
            RequestKind::LastRoll => "last-roll",
            RequestKind::Roll => "roll",
            RequestKind::GetSheet => "get-sheet",
            RequestKind::MacroExecute => "macro-execute",
            RequestKind::Macros => "macros",
            RequestKind::Encounters => "encounters",
            RequestKind::StartEncounter => "start-encounter",
            RequestKind::NextTurn => "next-turn",
            RequestKind::NextRound => "next-round",
            RequestKind::LastTurn => "last-turn",
            RequestKind::LastRound => "last-round",
            RequestKind::EndEncounter => "end-encounter",
            RequestKind::AddToEncounter => "add-to-encounter",
            RequestKind::RemoveFromEncounter => "remove-from-encounter",
            RequestKind::Kill => "kill",
            RequestKind::Decrease => "decrease",
            RequestKind::Increase => "increase",
            RequestKind::Give => "give",
            RequestKind::Remove => "remove",
            RequestKind::ExecuteJs => "execute-js",
            RequestKind::Select => "select",
            RequestKind::Selected => "selected",
            RequestKind::FileSystem => "file-system",
            RequestKind::UploadFile => "upload-file",
            RequestKind::DownloadFile => "download-file",
            RequestKind::GetActorDetails => "get-actor-details",
            RequestKind::ModifyItemCharges => "modify-item-charges",
            RequestKind::UseAbility => "use-ability",
            RequestKind::UseFeature => "use-feature",
            RequestKind::UseSpell => "use-spell",
            RequestKind::UseItem => "use-item",
            RequestKind::ModifyExperience => "modify-experience",
            RequestKind::AddItem => "add-item",
            RequestKind::RemoveItem => "remove-item",
            RequestKind::GetFolder => "get-folder",
            RequestKind::CreateFolder => "create-folder",
            RequestKind::DeleteFolder => "delete-folder",
            RequestKind::ChatMessages => "chat-messages",
            RequestKind::Chat => "chat",
        }
    }

    /// Look up a request kind by its wire tag.
    pub fn from_str(tag: &str) -> Option<RequestKind> {
        RequestKind::ALL.iter().copied().find(|k| k.as_str() == tag)
    }

    /// The wire tag of the matching response message.
    pub fn response_type(&self) -> String {
        match self {
            RequestKind::GetSheet => "get-sheet-response".to_string(),
            other => format!("{}-result", other.as_str()),
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket close codes used by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    InternalError,
    NoClientId,
    NoAuth,
    NoConnectedGuild,
    DuplicateConnection,
    ServerShutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::InternalError => 4000,
            CloseReason::NoClientId => 4001,
            CloseReason::NoAuth => 4002,
            CloseReason::NoConnectedGuild => 4003,
            CloseReason::DuplicateConnection => 4004,
            CloseReason::ServerShutdown => 4005,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "Normal",
            CloseReason::InternalError => "InternalError",
            CloseReason::NoClientId => "NoClientId",
            CloseReason::NoAuth => "NoAuth",
            CloseReason::NoConnectedGuild => "NoConnectedGuild",
            CloseReason::DuplicateConnection => "DuplicateConnection",
            CloseReason::ServerShutdown => "ServerShutdown",
        }
    }
}

/// A single frame on the peer WebSocket, either direction.
///
/// Only the three routed fields are typed; the rest of the object is
/// carried opaquely so payload shapes never constrain the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl WireMessage {
    /// A bare control frame such as `{"type":"pong"}`.
    pub fn control(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            request_id: None,
            error: None,
            rest: Map::new(),
        }
    }

    /// A relay-to-peer request frame with the payload flattened in.
    pub fn request(kind: RequestKind, request_id: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            request_id: Some(request_id.to_string()),
            error: None,
            rest: payload,
        }
    }

    /// A peer-to-relay response frame.
    pub fn response(kind: RequestKind, request_id: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.response_type(),
            request_id: Some(request_id.to_string()),
            error: None,
            rest: payload,
        }
    }

    /// An error response frame.
    pub fn error_response(kind: RequestKind, request_id: &str, error: &str) -> Self {
        Self {
            kind: kind.response_type(),
            request_id: Some(request_id.to_string()),
            error: Some(error.to_string()),
            rest: Map::new(),
        }
    }
}

/// Remove sensitive keys from a payload, recursing into nested objects
/// and arrays.
pub fn strip_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in SENSITIVE_KEYS {
                map.remove(*key);
            }
            for (_, v) in map.iter_mut() {
                strip_sensitive(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_sensitive(v);
            }
        }
        _ => {}
    }
}

/// Commands a supervisor can send into a running peer connection.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Replace the set of active administrator ids (re-runs the election).
    SetRoster(Vec<String>),
    /// Graceful shutdown.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip() {
        for kind in RequestKind::ALL {
            assert_eq!(RequestKind::from_str(kind.as_str()), Some(*kind));
        }
        assert_eq!(RequestKind::from_str("roll"), Some(RequestKind::Roll));
        assert_eq!(RequestKind::from_str("no-such-type"), None);
    }

    #[test]
    fn test_response_type() {
        assert_eq!(RequestKind::Roll.response_type(), "roll-result");
        assert_eq!(RequestKind::LastRoll.response_type(), "last-roll-result");
        assert_eq!(RequestKind::GetSheet.response_type(), "get-sheet-response");
        assert_eq!(
            RequestKind::DownloadFile.response_type(),
            "download-file-result"
        );
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::InternalError.code(), 4000);
        assert_eq!(CloseReason::NoClientId.code(), 4001);
        assert_eq!(CloseReason::NoAuth.code(), 4002);
        assert_eq!(CloseReason::NoConnectedGuild.code(), 4003);
        assert_eq!(CloseReason::DuplicateConnection.code(), 4004);
        assert_eq!(CloseReason::ServerShutdown.code(), 4005);
    }

    #[test]
    fn test_wire_message_flatten() {
        let raw = r#"{"type":"roll-result","requestId":"roll_17","result":17,"formula":"1d20"}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "roll-result");
        assert_eq!(msg.request_id.as_deref(), Some("roll_17"));
        assert!(msg.error.is_none());
        assert_eq!(msg.rest.get("result"), Some(&json!(17)));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back.get("requestId"), Some(&json!("roll_17")));
        assert_eq!(back.get("formula"), Some(&json!("1d20")));
        // Absent optional fields stay absent on the wire.
        assert!(back.get("error").is_none());
    }

    #[test]
    fn test_strip_sensitive_nested() {
        let mut value = json!({
            "apiKey": "k1",
            "result": {
                "password": "hunter2",
                "items": [{"privateKey": "p", "name": "sword"}]
            }
        });
        strip_sensitive(&mut value);
        assert!(value.get("apiKey").is_none());
        assert!(value["result"].get("password").is_none());
        assert!(value["result"]["items"][0].get("privateKey").is_none());
        assert_eq!(value["result"]["items"][0]["name"], json!("sword"));
    }
}
