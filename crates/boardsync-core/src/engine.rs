//! Boundary to the rules engine. The session never looks at board
//! semantics; it calls these operations and inspects success or failure.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the two roles that alternate moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    First,
    Second,
}

impl Side {
    pub fn opponent(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Second => "second",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical serialized state. Two snapshots are equal iff the
/// underlying states are observationally identical.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(String);

impl Snapshot {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A piece as the engine names it: an engine-defined kind owned by a side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub kind: String,
    pub side: Side,
}

/// Named failure returned by the engine. State is unchanged when one of
/// these comes back.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl OperationError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// The rules engine behind a session. Every mutating method is
/// all-or-nothing: on `Err` the engine must be left untouched.
pub trait RulesEngine: Send {
    /// Attempt a turn action for the side to move.
    fn make_move(&mut self, action: &str) -> Result<Value, OperationError>;

    /// Take back the last action.
    fn undo(&mut self) -> Result<Value, OperationError>;

    /// Return to the initial position.
    fn reset(&mut self) -> Result<(), OperationError>;

    /// Empty the board.
    fn clear(&mut self) -> Result<(), OperationError>;

    /// Replace the whole state with a canonical snapshot.
    fn load(&mut self, snapshot: &Snapshot) -> Result<(), OperationError>;

    fn remove(&mut self, _square: &str) -> Result<Option<Piece>, OperationError> {
        Err(OperationError::Unsupported("remove"))
    }

    fn put(&mut self, _piece: &Piece, _square: &str) -> Result<(), OperationError> {
        Err(OperationError::Unsupported("put"))
    }

    /// Replay a textual action history from the initial position.
    fn load_history(&mut self, _history: &str) -> Result<(), OperationError> {
        Err(OperationError::Unsupported("load_history"))
    }

    /// Merge header values; returns the resulting header map.
    fn set_headers(
        &mut self,
        _headers: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, OperationError> {
        Err(OperationError::Unsupported("set_headers"))
    }

    fn snapshot(&self) -> Snapshot;

    /// Whose move it is.
    fn turn(&self) -> Side;

    fn is_game_over(&self) -> bool;
}
