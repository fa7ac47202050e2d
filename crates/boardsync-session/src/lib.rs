//! Authoritative board sessions: connection registry, permission-checked
//! dispatch, handshake/resync, event derivation, and the client replica.

pub mod connection;
pub mod dispatcher;
pub mod notifier;
pub mod registry;
pub mod replica;
pub mod session;
pub mod transport;

pub use connection::Connection;
pub use dispatcher::authorize;
pub use notifier::{EventHandler, EventNotifier, HandlerId};
pub use registry::{ConnectionRegistry, Fanout};
pub use replica::{Replica, ReplicaError, WaitError};
pub use session::{AttachRequest, PendingJoin, Session};
pub use transport::{AckReceiver, LocalTransport, Transport};
