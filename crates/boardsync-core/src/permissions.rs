//! Per-connection capability sets.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Operation;
use crate::engine::Side;
use crate::ids::ConnectionId;

/// What a connection may do in a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_connect: bool,
    pub can_act_as_first: bool,
    pub can_act_as_second: bool,
    /// Operations this holder may invoke without any role check.
    #[serde(default)]
    pub operations: BTreeSet<Operation>,
}

impl Permissions {
    pub fn not_allowed() -> Self {
        Self::default()
    }

    pub fn observer() -> Self {
        Self {
            can_connect: true,
            ..Self::default()
        }
    }

    pub fn first_player() -> Self {
        Self {
            can_act_as_first: true,
            ..Self::observer()
        }
    }

    pub fn second_player() -> Self {
        Self {
            can_act_as_second: true,
            ..Self::observer()
        }
    }

    pub fn full_control() -> Self {
        Self {
            can_connect: true,
            can_act_as_first: true,
            can_act_as_second: true,
            operations: Operation::ALL.into_iter().collect(),
        }
    }

    /// Look up a preset by its wire name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "not_allowed" => Some(Self::not_allowed()),
            "observer" => Some(Self::observer()),
            "first" | "first_player" => Some(Self::first_player()),
            "second" | "second_player" => Some(Self::second_player()),
            "full" | "full_control" => Some(Self::full_control()),
            _ => None,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.insert(operation);
        self
    }

    /// Explicit allow-list entry, bypassing role checks.
    pub fn allows(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn can_act_as(&self, side: Side) -> bool {
        match side {
            Side::First => self.can_act_as_first,
            Side::Second => self.can_act_as_second,
        }
    }
}

/// What a resolver sees when deciding a connection's permissions.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    /// Opaque connect-time payload (query string, auth claims, ...).
    pub metadata: Option<Value>,
}

pub type PermissionResolver = Arc<dyn Fn(&ConnectionContext) -> Permissions + Send + Sync>;

/// Either a value fixed at attach time or a resolver consulted on every check.
#[derive(Clone)]
pub enum PermissionSource {
    Fixed(Permissions),
    Resolver(PermissionResolver),
}

impl PermissionSource {
    pub fn resolver<F>(f: F) -> Self
    where
        F: Fn(&ConnectionContext) -> Permissions + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &ConnectionContext) -> Permissions {
        match self {
            Self::Fixed(p) => p.clone(),
            Self::Resolver(f) => f(ctx),
        }
    }
}

impl From<Permissions> for PermissionSource {
    fn from(p: Permissions) -> Self {
        Self::Fixed(p)
    }
}

impl fmt::Debug for PermissionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(p) => f.debug_tuple("Fixed").field(p).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}
