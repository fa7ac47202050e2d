//! JSON frames exchanged over the socket.
//!
//! Replies to a connection's own requests travel as [`RpcResponse`]s;
//! everything the session pushes unprompted travels as a [`WireEvent`]
//! with envelope `{ type, sessionId, timestamp, data }`.

use boardsync_core::{Command, ConnectionId, Outbound, SessionId, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::rpc::RpcResponse;

pub const EVENT_HANDSHAKE: &str = "board.handshake";
pub const EVENT_METHOD_CALL: &str = "board.method_call";
pub const EVENT_PEER_JOINED: &str = "board.peer_joined";

/// Wire format for pushed events.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub timestamp: String,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn event(session_id: &SessionId, event_type: &str, data: Value) -> WireEvent {
    WireEvent {
        event_type: event_type.to_string(),
        session_id: session_id.to_string(),
        timestamp: now_iso8601(),
        data,
    }
}

/// Encode a session message for the socket. `ack_id` is only used for
/// handshakes, which the peer must acknowledge.
pub fn encode_outbound(
    session_id: &SessionId,
    message: &Outbound,
    ack_id: Option<u64>,
) -> Result<String, serde_json::Error> {
    match message {
        Outbound::Handshake { snapshot, data, .. } => {
            let mut body = json!({ "snapshot": snapshot });
            if let Some(ack_id) = ack_id {
                body["ackId"] = json!(ack_id);
            }
            if let Some(data) = data {
                body["data"] = data.clone();
            }
            serde_json::to_string(&event(session_id, EVENT_HANDSHAKE, body))
        }
        Outbound::MethodCall { command } => serde_json::to_string(&event(
            session_id,
            EVENT_METHOD_CALL,
            json!({ "operation": command }),
        )),
        Outbound::PeerJoined { connection_id } => serde_json::to_string(&event(
            session_id,
            EVENT_PEER_JOINED,
            json!({ "connectionId": connection_id }),
        )),
        Outbound::CallResult {
            request_id,
            accepted,
        } => serde_json::to_string(&RpcResponse::success(
            request_id.clone(),
            json!({ "accepted": accepted }),
        )),
        Outbound::ResyncResult {
            request_id,
            snapshot,
        } => serde_json::to_string(&RpcResponse::success(
            request_id.clone(),
            json!({ "snapshot": snapshot }),
        )),
    }
}

/// A frame as a client sees it.
#[derive(Debug)]
pub enum ServerFrame {
    Response(RpcResponse),
    Event(WireEvent),
}

pub fn decode_server_frame(text: &str) -> Result<ServerFrame, WireError> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("type").is_some() {
        Ok(ServerFrame::Event(serde_json::from_value(value)?))
    } else {
        Ok(ServerFrame::Response(serde_json::from_value(value)?))
    }
}

/// Turn a pushed event back into the session message it carries, plus the
/// ack id for handshakes.
pub fn decode_event(event: &WireEvent) -> Result<(Outbound, Option<u64>), WireError> {
    let data = &event.data;
    match event.event_type.as_str() {
        EVENT_HANDSHAKE => {
            let snapshot: Snapshot = serde_json::from_value(
                data.get("snapshot")
                    .cloned()
                    .ok_or(WireError::MissingField("snapshot"))?,
            )?;
            let ack_id = data.get("ackId").and_then(Value::as_u64);
            Ok((
                Outbound::Handshake {
                    session_id: SessionId::from_raw(event.session_id.clone()),
                    snapshot,
                    data: data.get("data").cloned(),
                },
                ack_id,
            ))
        }
        EVENT_METHOD_CALL => {
            let command: Command = serde_json::from_value(
                data.get("operation")
                    .cloned()
                    .ok_or(WireError::MissingField("operation"))?,
            )?;
            Ok((Outbound::MethodCall { command }, None))
        }
        EVENT_PEER_JOINED => {
            let connection_id = data
                .get("connectionId")
                .and_then(Value::as_str)
                .ok_or(WireError::MissingField("connectionId"))?;
            Ok((
                Outbound::PeerJoined {
                    connection_id: ConnectionId::from_raw(connection_id),
                },
                None,
            ))
        }
        other => Err(WireError::UnknownEvent(other.to_string())),
    }
}
