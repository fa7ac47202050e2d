//! Typed mutating commands and their `{name, args}` wire form.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{OperationError, Piece, RulesEngine, Snapshot};

/// Closed set of mutating operation names. Anything else fails to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Move,
    Undo,
    Reset,
    Remove,
    Put,
    Load,
    LoadHistory,
    Clear,
    SetHeaders,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Self::Move,
        Self::Undo,
        Self::Reset,
        Self::Remove,
        Self::Put,
        Self::Load,
        Self::LoadHistory,
        Self::Clear,
        Self::SetHeaders,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Undo => "undo",
            Self::Reset => "reset",
            Self::Remove => "remove",
            Self::Put => "put",
            Self::Load => "load",
            Self::LoadHistory => "load_history",
            Self::Clear => "clear",
            Self::SetHeaders => "set_headers",
        }
    }

    /// The role-gated turn action.
    pub fn is_turn_action(self) -> bool {
        matches!(self, Self::Move)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{operation} expects {expected} argument(s), got {actual}")]
    Arity {
        operation: Operation,
        expected: usize,
        actual: usize,
    },
    #[error("{operation}: bad argument {index}: {message}")]
    Argument {
        operation: Operation,
        index: usize,
        message: String,
    },
}

/// One mutating invocation with typed arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand", into = "RawCommand")]
pub enum Command {
    Move(String),
    Undo,
    Reset,
    Remove(String),
    Put(Piece, String),
    Load(Snapshot),
    LoadHistory(String),
    Clear,
    SetHeaders(BTreeMap<String, String>),
}

/// Wire form: operation name plus positional argument list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawCommand {
    pub name: Operation,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Move(_) => Operation::Move,
            Self::Undo => Operation::Undo,
            Self::Reset => Operation::Reset,
            Self::Remove(_) => Operation::Remove,
            Self::Put(..) => Operation::Put,
            Self::Load(_) => Operation::Load,
            Self::LoadHistory(_) => Operation::LoadHistory,
            Self::Clear => Operation::Clear,
            Self::SetHeaders(_) => Operation::SetHeaders,
        }
    }

    /// Build a typed command from an operation name and positional args.
    pub fn from_parts(operation: Operation, args: Vec<Value>) -> Result<Self, CommandError> {
        let mut args = Args::new(operation, args);
        let command = match operation {
            Operation::Move => {
                args.expect(1)?;
                Self::Move(args.take(0)?)
            }
            Operation::Undo => {
                args.expect(0)?;
                Self::Undo
            }
            Operation::Reset => {
                args.expect(0)?;
                Self::Reset
            }
            Operation::Remove => {
                args.expect(1)?;
                Self::Remove(args.take(0)?)
            }
            Operation::Put => {
                args.expect(2)?;
                Self::Put(args.take(0)?, args.take(1)?)
            }
            Operation::Load => {
                args.expect(1)?;
                Self::Load(args.take(0)?)
            }
            Operation::LoadHistory => {
                args.expect(1)?;
                Self::LoadHistory(args.take(0)?)
            }
            Operation::Clear => {
                args.expect(0)?;
                Self::Clear
            }
            Operation::SetHeaders => {
                args.expect(1)?;
                Self::SetHeaders(args.take(0)?)
            }
        };
        Ok(command)
    }

    /// Positional wire arguments, the inverse of [`Command::from_parts`].
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::Move(action) => vec![Value::String(action.clone())],
            Self::Undo | Self::Reset | Self::Clear => Vec::new(),
            Self::Remove(square) => vec![Value::String(square.clone())],
            Self::Put(piece, square) => vec![
                serde_json::to_value(piece).unwrap_or(Value::Null),
                Value::String(square.clone()),
            ],
            Self::Load(snapshot) => vec![Value::String(snapshot.as_str().to_owned())],
            Self::LoadHistory(history) => vec![Value::String(history.clone())],
            Self::SetHeaders(headers) => vec![Value::Object(
                headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )],
        }
    }

    /// Dispatch table: route each variant to its typed engine method and
    /// flatten the typed result into a JSON value for the caller.
    pub fn apply(&self, engine: &mut dyn RulesEngine) -> Result<Value, OperationError> {
        match self {
            Self::Move(action) => engine.make_move(action),
            Self::Undo => engine.undo(),
            Self::Reset => engine.reset().map(|()| Value::Null),
            Self::Remove(square) => engine
                .remove(square)
                .map(|piece| piece.map_or(Value::Null, |p| to_value(&p))),
            Self::Put(piece, square) => engine.put(piece, square).map(|()| Value::Bool(true)),
            Self::Load(snapshot) => engine.load(snapshot).map(|()| Value::Bool(true)),
            Self::LoadHistory(history) => engine.load_history(history).map(|()| Value::Bool(true)),
            Self::Clear => engine.clear().map(|()| Value::Null),
            Self::SetHeaders(headers) => engine.set_headers(headers).map(|h| to_value(&h)),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl TryFrom<RawCommand> for Command {
    type Error = CommandError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        Self::from_parts(raw.name, raw.args)
    }
}

impl From<Command> for RawCommand {
    fn from(command: Command) -> Self {
        Self {
            name: command.operation(),
            args: command.args(),
        }
    }
}

struct Args {
    operation: Operation,
    values: Vec<Option<Value>>,
}

impl Args {
    fn new(operation: Operation, values: Vec<Value>) -> Self {
        Self {
            operation,
            values: values.into_iter().map(Some).collect(),
        }
    }

    fn expect(&self, expected: usize) -> Result<(), CommandError> {
        if self.values.len() == expected {
            Ok(())
        } else {
            Err(CommandError::Arity {
                operation: self.operation,
                expected,
                actual: self.values.len(),
            })
        }
    }

    fn take<T: serde::de::DeserializeOwned>(&mut self, index: usize) -> Result<T, CommandError> {
        let value = self
            .values
            .get_mut(index)
            .and_then(Option::take)
            .unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| CommandError::Argument {
            operation: self.operation,
            index,
            message: e.to_string(),
        })
    }
}
