pub mod command;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ids;
pub mod permissions;
pub mod protocol;

pub use command::{Command, CommandError, Operation, RawCommand};
pub use engine::{OperationError, Piece, RulesEngine, Side, Snapshot};
pub use errors::{DenialReason, SessionError};
pub use events::{BoardEvent, EventKind, SessionView};
pub use ids::{ConnectionId, SequentialAllocator, SessionId, SessionIdAllocator, UuidAllocator};
pub use permissions::{ConnectionContext, PermissionResolver, PermissionSource, Permissions};
pub use protocol::{DisconnectOutcome, DisconnectReason, Outbound, RequestId, TransportError};
