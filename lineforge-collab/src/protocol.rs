//! JSON message catalog for the room collaboration protocol.
//!
//! Every envelope is a JSON object with a `type` discriminator:
//! ```text
//! client → server   cursor | state | lock-request | lock-release | ar-presence
//! server → client   welcome | peer-joined | peer-left | cursor | state
//!                   state-ack | state-rejected | lock-granted | lock-denied
//!                   lock-updated | ar-presence
//! ```
//!
//! Parsing first reads the envelope generically so that an unknown `type` can
//! be told apart from a known type with a bad body; both are dropped by the
//! caller without closing the connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// Numeric fields accepted in an `ar-presence` payload.
pub const PRESENCE_FIELDS: &[&str] = &[
    "x",
    "y",
    "lat",
    "lon",
    "altitude",
    "accuracy",
    "headingRad",
    "pitchRad",
    "rollRad",
];

/// Kind of entity that can be locked for editing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Point,
    Line,
}

/// Messages a room member may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Cursor {
        cursor: Value,
    },
    State {
        #[serde(default)]
        request_id: Option<Value>,
        base_revision: u64,
        state: Value,
    },
    LockRequest {
        #[serde(default)]
        request_id: Option<Value>,
        entity_type: EntityType,
        entity_id: String,
    },
    LockRelease {
        entity_type: EntityType,
        entity_id: String,
    },
    ArPresence {
        presence: Map<String, Value>,
    },
}

/// Why an inbound payload was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not a JSON object
    MalformedJson(String),
    /// `type` is missing or not part of the catalog
    UnknownType(String),
    /// Known `type` but the body does not fit it
    InvalidMessage { kind: String, reason: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedJson(e) => write!(f, "Malformed JSON: {e}"),
            Self::UnknownType(t) => write!(f, "Unknown message type: {t:?}"),
            Self::InvalidMessage { kind, reason } => write!(f, "Invalid {kind} message: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse an envelope into a typed message, checking `type` against `known`.
pub fn parse_envelope<T: serde::de::DeserializeOwned>(
    text: &str,
    known: &[&str],
) -> Result<T, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::MalformedJson("envelope is not an object".into()));
    }
    let kind = match value.get("type") {
        Some(Value::String(kind)) if known.contains(&kind.as_str()) => kind.clone(),
        Some(Value::String(kind)) => return Err(ProtocolError::UnknownType(kind.clone())),
        _ => return Err(ProtocolError::UnknownType(String::new())),
    };
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage {
        kind,
        reason: e.to_string(),
    })
}

impl ClientMessage {
    pub const TYPES: &'static [&'static str] =
        &["cursor", "state", "lock-request", "lock-release", "ar-presence"];

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = parse_envelope(text, Self::TYPES)?;
        match &msg {
            ClientMessage::LockRequest { entity_id, .. }
            | ClientMessage::LockRelease { entity_id, .. }
                if entity_id.is_empty() =>
            {
                Err(ProtocolError::InvalidMessage {
                    kind: "lock".into(),
                    reason: "empty entityId".into(),
                })
            }
            ClientMessage::State { state: Value::Null, .. } => Err(ProtocolError::InvalidMessage {
                kind: "state".into(),
                reason: "missing state payload".into(),
            }),
            _ => Ok(msg),
        }
    }
}

/// Pointer coordinates in document space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    /// Read `{x, y}` leniently; anything non-numeric or non-finite becomes 0.
    pub fn from_value(value: &Value) -> Self {
        let coord = |name: &str| value.get(name).and_then(finite_number).unwrap_or(0.0);
        Self {
            x: coord("x"),
            y: coord("y"),
        }
    }
}

fn finite_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Keep only known presence fields whose values are finite numbers.
pub fn sanitize_presence(presence: &Map<String, Value>) -> Map<String, Value> {
    let mut clean = Map::new();
    for field in PRESENCE_FIELDS {
        let Some(raw) = presence.get(*field) else { continue };
        let number = match raw {
            Value::Number(n) if n.as_f64().is_some_and(f64::is_finite) => Some(n.clone()),
            other => finite_number(other).and_then(Number::from_f64),
        };
        if let Some(number) = number {
            clean.insert((*field).to_string(), Value::Number(number));
        }
    }
    clean
}

/// Public view of a room member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub client_id: Uuid,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crew_member_id: Option<String>,
}

/// Public view of an active lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub owner_id: Uuid,
    pub owner_color: String,
    /// Milliseconds since the Unix epoch
    pub acquired_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockAction {
    Locked,
    Released,
}

/// Reason attached to a denied lock request.
pub const LOCK_DENIED_ALREADY_LOCKED: &str = "already-locked";

/// Messages the server sends to room members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        client_id: Uuid,
        color: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crew_member_id: Option<String>,
        peers: Vec<PeerInfo>,
        state: Value,
        revision: u64,
        locks: Vec<LockInfo>,
    },
    PeerJoined {
        client_id: Uuid,
        color: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crew_member_id: Option<String>,
    },
    PeerLeft {
        client_id: Uuid,
    },
    Cursor {
        client_id: Uuid,
        color: String,
        cursor: CursorPosition,
        at: i64,
    },
    State {
        client_id: Uuid,
        state: Value,
        revision: u64,
        at: i64,
    },
    StateAck {
        request_id: Option<Value>,
        revision: u64,
    },
    StateRejected {
        request_id: Option<Value>,
        expected_revision: u64,
        state: Value,
    },
    LockGranted {
        request_id: Option<Value>,
        lock: LockInfo,
    },
    LockDenied {
        request_id: Option<Value>,
        entity_type: EntityType,
        entity_id: String,
        reason: String,
        owner_id: Uuid,
        owner_color: String,
    },
    LockUpdated {
        action: LockAction,
        lock: LockInfo,
    },
    ArPresence {
        client_id: Uuid,
        color: String,
        presence: Map<String, Value>,
        at: i64,
    },
}

impl ServerMessage {
    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Cursor { .. } => "cursor",
            Self::State { .. } => "state",
            Self::StateAck { .. } => "state-ack",
            Self::StateRejected { .. } => "state-rejected",
            Self::LockGranted { .. } => "lock-granted",
            Self::LockDenied { .. } => "lock-denied",
            Self::LockUpdated { .. } => "lock-updated",
            Self::ArPresence { .. } => "ar-presence",
        }
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_state_message() {
        let msg = ClientMessage::parse(
            r#"{"type":"state","requestId":"req-1","baseRevision":3,"state":{"points":[1]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::State { request_id, base_revision, state } => {
                assert_eq!(request_id, Some(json!("req-1")));
                assert_eq!(base_revision, 3);
                assert_eq!(state, json!({"points": [1]}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_lock_request() {
        let msg = ClientMessage::parse(
            r#"{"type":"lock-request","entityType":"line","entityId":"l-9"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::LockRequest { entity_type: EntityType::Line, ref entity_id, request_id: None }
                if entity_id == "l-9"
        ));
    }

    #[test]
    fn test_unknown_and_malformed_are_distinguished() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "teleport"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"no":"type"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::MalformedJson(_))
        ));
        assert!(matches!(
            ClientMessage::parse("[1,2]"),
            Err(ProtocolError::MalformedJson(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"lock-request","entityType":"polygon","entityId":"x"}"#),
            Err(ProtocolError::InvalidMessage { .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"lock-release","entityType":"point","entityId":""}"#),
            Err(ProtocolError::InvalidMessage { .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"state","baseRevision":0,"state":null}"#),
            Err(ProtocolError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_cursor_coercion() {
        let cursor = CursorPosition::from_value(&json!({"x": 7, "y": "9.5"}));
        assert_eq!(cursor, CursorPosition { x: 7.0, y: 9.5 });

        let cursor = CursorPosition::from_value(&json!({"x": "abc"}));
        assert_eq!(cursor, CursorPosition { x: 0.0, y: 0.0 });
    }

    #[test]
    fn test_sanitize_presence_drops_invalid_fields() {
        let raw = json!({
            "x": 10,
            "y": 20.5,
            "lat": 43.61,
            "lon": "-116.2",
            "headingRad": "north",
            "altitude": null,
            "secret": 1
        });
        let clean = sanitize_presence(raw.as_object().unwrap());
        assert_eq!(clean.get("x"), Some(&json!(10)));
        assert_eq!(clean.get("y"), Some(&json!(20.5)));
        assert_eq!(clean.get("lat"), Some(&json!(43.61)));
        assert_eq!(clean.get("lon").and_then(Value::as_f64), Some(-116.2));
        assert!(!clean.contains_key("headingRad"));
        assert!(!clean.contains_key("altitude"));
        assert!(!clean.contains_key("secret"));
    }

    #[test]
    fn test_server_message_shape() {
        let msg = ServerMessage::StateRejected {
            request_id: Some(json!("s2")),
            expected_revision: 1,
            state: json!({"points": [1]}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "state-rejected",
                "requestId": "s2",
                "expectedRevision": 1,
                "state": {"points": [1]}
            })
        );
        assert_eq!(msg.kind(), "state-rejected");
    }

    #[test]
    fn test_peer_joined_omits_missing_identity() {
        let msg = ServerMessage::PeerJoined {
            client_id: Uuid::nil(),
            color: "#ff4d4f".into(),
            crew_member_id: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "peer-joined");
        assert_eq!(value["color"], "#ff4d4f");
        assert!(value.get("crewMemberId").is_none());
    }
}
