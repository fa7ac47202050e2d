use serde::{Deserialize, Serialize};

use crate::engine::{Side, Snapshot};
use crate::ids::{ConnectionId, SessionId};
use crate::protocol::DisconnectReason;

/// Notification categories a handler can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PeerJoined,
    PeerLeft,
    BoardUpdate,
    GameOver,
    FirstTurn,
    SecondTurn,
    /// Client side only: the handshake snapshot has been applied.
    Connected,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerJoined => "peer_joined",
            Self::PeerLeft => "peer_left",
            Self::BoardUpdate => "board_update",
            Self::GameOver => "game_over",
            Self::FirstTurn => "first_turn",
            Self::SecondTurn => "second_turn",
            Self::Connected => "connected",
        }
    }

    pub fn turn_of(side: Side) -> Self {
        match side {
            Side::First => Self::FirstTurn,
            Side::Second => Self::SecondTurn,
        }
    }
}

/// A notification with its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardEvent {
    PeerJoined {
        connection_id: ConnectionId,
    },
    PeerLeft {
        connection_id: ConnectionId,
        reason: DisconnectReason,
    },
    BoardUpdate,
    GameOver,
    TurnChanged {
        side: Side,
    },
    Connected {
        session_id: SessionId,
    },
}

impl BoardEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PeerJoined { .. } => EventKind::PeerJoined,
            Self::PeerLeft { .. } => EventKind::PeerLeft,
            Self::BoardUpdate => EventKind::BoardUpdate,
            Self::GameOver => EventKind::GameOver,
            Self::TurnChanged { side } => EventKind::turn_of(*side),
            Self::Connected { .. } => EventKind::Connected,
        }
    }
}

/// Read-only picture of a session handed to event handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionView {
    pub session_id: SessionId,
    pub snapshot: Snapshot,
    pub turn: Side,
    pub game_over: bool,
}
