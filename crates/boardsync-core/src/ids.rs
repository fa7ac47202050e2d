//! String identities for boards and connections, plus the allocators that
//! hand out board ids.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a string newtype whose generated values read `<prefix>_<uuid v7>`.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident = $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh, time-ordered id.
            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            /// Wrap an id received from elsewhere. Not validated.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type!(
    /// Identity of one board session.
    SessionId = "board"
);
id_type!(
    /// Identity of one attached transport.
    ConnectionId = "conn"
);

/// Hands out session identities. Injected into session construction so
/// that independent hosts (and tests) never share a counter.
pub trait SessionIdAllocator: Send + Sync {
    fn next_id(&self) -> SessionId;
}

/// Monotonic counter: `board_0`, `board_1`, ...
#[derive(Debug, Default)]
pub struct SequentialAllocator {
    next: AtomicU64,
}

impl SequentialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl SessionIdAllocator for SequentialAllocator {
    fn next_id(&self) -> SessionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        SessionId::from_raw(format!("board_{n}"))
    }
}

/// Time-ordered uuid identities, unique across processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidAllocator;

impl SessionIdAllocator for UuidAllocator {
    fn next_id(&self) -> SessionId {
        SessionId::new()
    }
}
