//! Messages a session pushes to attached connections, and how a
//! transport reports that a connection went away.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Command;
use crate::engine::Snapshot;
use crate::ids::{ConnectionId, SessionId};

/// Caller-chosen correlation id echoed back in replies.
pub type RequestId = Option<Value>;

/// Session → connection message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Initial state for a freshly attached connection. Must be acknowledged.
    Handshake {
        session_id: SessionId,
        snapshot: Snapshot,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// A committed mutation made by someone else.
    MethodCall { command: Command },
    /// Reply to this connection's own invocation.
    CallResult { request_id: RequestId, accepted: bool },
    /// Reply to a resync request.
    ResyncResult { request_id: RequestId, snapshot: Snapshot },
    /// Another connection finished its handshake.
    PeerJoined { connection_id: ConnectionId },
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::MethodCall { .. } => "method_call",
            Self::CallResult { .. } => "call_result",
            Self::ResyncResult { .. } => "resync_result",
            Self::PeerJoined { .. } => "peer_joined",
        }
    }
}

/// Why a transport reported a disconnect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The server closed the connection on purpose.
    ServerClose,
    /// The peer closed the connection on purpose.
    ClientClose,
    /// The stream ended without a close handshake.
    TransportClose,
    /// The stream failed.
    TransportError,
    /// The peer stopped answering heartbeats.
    PingTimeout,
    /// The peer fell so far behind that its send queue filled up. It is
    /// closed so that it reconnects and gets a fresh handshake.
    QueueOverflow,
}

impl DisconnectReason {
    /// The connection slot is released rather than kept for a resync.
    pub fn is_deliberate(&self) -> bool {
        matches!(
            self,
            Self::ServerClose | Self::ClientClose | Self::QueueOverflow
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerClose => "server_close",
            Self::ClientClose => "client_close",
            Self::TransportClose => "transport_close",
            Self::TransportError => "transport_error",
            Self::PingTimeout => "ping_timeout",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}

/// Result of handling a disconnect notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Deliberate close: the connection was removed.
    DeliberateDisconnect,
    /// Transient loss: the connection is kept so the peer can resync.
    TransportLost,
    /// The connection was not registered.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("send queue full")]
    Full,
}
