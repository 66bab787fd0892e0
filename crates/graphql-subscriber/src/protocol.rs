//! Wire protocol types and JSON encode/decode for the Apollo
//! `subscriptions-transport-ws` protocol.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// WebSocket subprotocol offered during the connection upgrade.
pub const SUBPROTOCOL: &str = "graphql-ws";

/// Variables attached to an operation, keyed by name.
pub type Variables = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Discriminant of a [`ProtocolMessage`].
///
/// Kinds the server may send that this client does not recognize decode to
/// [`MessageKind::Unknown`] instead of failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Client opens the logical connection, optionally carrying auth params.
    ConnectionInit,
    /// Server accepted the connection.
    ConnectionAck,
    /// Server rejected the connection.
    #[serde(rename = "conn_err")]
    ConnectionError,
    /// Client starts an operation under a fresh id.
    Start,
    /// Client stops a running operation.
    Stop,
    /// Server delivers an execution result for an operation id.
    Data,
    /// Server reports a pre-execution failure for an operation id.
    Error,
    /// Server signals that no more data will arrive for an operation id.
    Complete,
    /// Server keep-alive, informational only.
    #[serde(rename = "ka")]
    KeepAlive,
    /// Client tears the logical connection down.
    ConnectionTerminate,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The `{id, type, payload}` unit exchanged over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unencodable frame>"),
        }
    }
}

/// Payload of a `start` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,
}

// ---------------------------------------------------------------------------
// Client→server frame builders
// ---------------------------------------------------------------------------

pub fn build_init_msg(
    params: Option<&HashMap<String, serde_json::Value>>,
) -> Result<ProtocolMessage, serde_json::Error> {
    let payload = params.map(serde_json::to_value).transpose()?;
    Ok(ProtocolMessage {
        id: None,
        kind: MessageKind::ConnectionInit,
        payload,
    })
}

pub fn build_start_msg(
    id: &str,
    query: &str,
    variables: &Variables,
) -> Result<ProtocolMessage, serde_json::Error> {
    let payload = serde_json::to_value(StartPayload {
        query: query.to_string(),
        variables: variables.clone(),
    })?;
    Ok(ProtocolMessage {
        id: Some(id.to_string()),
        kind: MessageKind::Start,
        payload: Some(payload),
    })
}

pub fn build_stop_msg(id: &str) -> ProtocolMessage {
    ProtocolMessage {
        id: Some(id.to_string()),
        kind: MessageKind::Stop,
        payload: None,
    }
}

pub fn build_terminate_msg() -> ProtocolMessage {
    ProtocolMessage {
        id: None,
        kind: MessageKind::ConnectionTerminate,
        payload: None,
    }
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_msg(msg: &ProtocolMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

pub fn decode_msg(text: &str) -> Result<ProtocolMessage, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names() {
        for (kind, wire) in [
            (MessageKind::ConnectionInit, "connection_init"),
            (MessageKind::ConnectionAck, "connection_ack"),
            (MessageKind::ConnectionError, "conn_err"),
            (MessageKind::Start, "start"),
            (MessageKind::Stop, "stop"),
            (MessageKind::Data, "data"),
            (MessageKind::Error, "error"),
            (MessageKind::Complete, "complete"),
            (MessageKind::KeepAlive, "ka"),
            (MessageKind::ConnectionTerminate, "connection_terminate"),
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{wire}\""));
        }
    }

    #[test]
    fn unknown_kind_decodes_without_error() {
        let msg = decode_msg(r#"{"type":"presence_diff","payload":{}}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Unknown);
    }

    #[test]
    fn absent_fields_are_omitted_from_the_wire() {
        let text = encode_msg(&build_terminate_msg()).unwrap();
        assert_eq!(text, r#"{"type":"connection_terminate"}"#);
    }

    #[test]
    fn init_msg_carries_connection_params() {
        let mut params = HashMap::new();
        params.insert("authorization".to_string(), serde_json::json!("Bearer t"));
        let msg = build_init_msg(Some(&params)).unwrap();
        let text = encode_msg(&msg).unwrap();
        assert!(text.contains(r#""type":"connection_init""#));
        assert!(text.contains(r#""authorization":"Bearer t""#));
    }

    #[test]
    fn start_msg_skips_empty_variables() {
        let msg = build_start_msg("op-1", "subscription { tick }", &Variables::new()).unwrap();
        let text = encode_msg(&msg).unwrap();
        assert!(text.contains(r#""query":"subscription { tick }""#));
        assert!(!text.contains("variables"));

        let mut vars = Variables::new();
        vars.insert("limit".to_string(), serde_json::json!(10));
        let msg = build_start_msg("op-1", "subscription { tick }", &vars).unwrap();
        let payload: StartPayload = serde_json::from_value(msg.payload.unwrap()).unwrap();
        assert_eq!(payload.variables.get("limit"), Some(&serde_json::json!(10)));
    }

    #[test]
    fn display_renders_the_json_form() {
        let rendered = build_stop_msg("op-9").to_string();
        let parsed = decode_msg(&rendered).unwrap();
        assert_eq!(parsed.kind, MessageKind::Stop);
        assert_eq!(parsed.id.as_deref(), Some("op-9"));
    }
}
