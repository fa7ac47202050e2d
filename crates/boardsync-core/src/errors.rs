use std::time::Duration;

use crate::command::Operation;
use crate::engine::OperationError;
use crate::ids::ConnectionId;
use crate::protocol::TransportError;

/// Why the permission model refused an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialReason {
    /// Neither on the allow-list nor the turn action.
    NotPermitted,
    /// Turn action, but the caller may not act for the side to move.
    NotYourTurn,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotPermitted => "not_permitted",
            Self::NotYourTurn => "not_your_turn",
        }
    }
}

/// Session-level failures. None of them are fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection {0} is not allowed to connect")]
    ConnectionRejected(ConnectionId),

    #[error("{operation} denied: {}", .reason.as_str())]
    InvocationDenied {
        operation: Operation,
        reason: DenialReason,
    },

    #[error("{operation} failed: {source}")]
    OperationFailed {
        operation: Operation,
        #[source]
        source: OperationError,
    },

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("handshake not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Both denial and engine rejection look like `accepted = false` to a
    /// remote caller.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvocationDenied { .. } | Self::OperationFailed { .. }
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionRejected(_) => "connection_rejected",
            Self::InvocationDenied { .. } => "invocation_denied",
            Self::OperationFailed { .. } => "operation_failed",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::HandshakeTimeout(_) => "handshake_timeout",
            Self::Transport(_) => "transport",
        }
    }
}
