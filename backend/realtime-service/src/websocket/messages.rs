/// Wire envelopes exchanged with WebSocket clients
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Client → server envelope: `{"type": string, "payload": object}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundEnvelope {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Server → client envelope
///
/// `{"type": string, "success": bool, "message"?: string, "data"?: object, "timestamp": RFC3339}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl OutboundEnvelope {
    pub fn success(message_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            message_type: message_type.into(),
            success: true,
            message: None,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Welcome frame sent once the session is registered
    pub fn connected(session_id: &str, user_id: &str) -> Self {
        Self::success(
            "connected",
            Some(json!({ "session_id": session_id, "user_id": user_id })),
        )
        .with_message("connection established")
    }

    pub fn pong() -> Self {
        Self::success("pong", None)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            message_type: "error".to_string(),
            success: false,
            message: Some(message.into()),
            data: Some(json!({ "code": code })),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_payload_defaults_to_null() {
        let envelope = InboundEnvelope::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.message_type, "ping");
        assert!(envelope.payload.is_null());
    }

    #[test]
    fn inbound_requires_type() {
        assert!(InboundEnvelope::from_json(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn outbound_omits_absent_fields() {
        let json = OutboundEnvelope::pong().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "pong");
        assert_eq!(value["success"], true);
        assert!(value.get("message").is_none());
        assert!(value.get("data").is_none());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn error_envelope_carries_code() {
        let envelope = OutboundEnvelope::error("unknown_message_type", "unsupported: dance");
        assert!(!envelope.success);
        assert_eq!(envelope.data.unwrap()["code"], "unknown_message_type");
        assert_eq!(envelope.message.as_deref(), Some("unsupported: dance"));
    }

    #[test]
    fn connected_envelope() {
        let envelope = OutboundEnvelope::connected("s-1", "u-1");
        assert_eq!(envelope.message_type, "connected");
        let data = envelope.data.unwrap();
        assert_eq!(data["session_id"], "s-1");
        assert_eq!(data["user_id"], "u-1");
    }
}
