//! One attached peer: its transport, how its permissions are found, and
//! whatever the embedder attached to it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use boardsync_core::{
    ConnectionContext, ConnectionId, Outbound, PermissionSource, Permissions, TransportError,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::transport::{AckReceiver, Transport};

pub struct Connection {
    transport: Arc<dyn Transport>,
    permissions: PermissionSource,
    context: ConnectionContext,
    attached_at: Instant,
}

impl Connection {
    pub fn new(
        transport: Arc<dyn Transport>,
        permissions: PermissionSource,
        metadata: Option<Value>,
    ) -> Self {
        let context = ConnectionContext {
            connection_id: transport.id().clone(),
            metadata,
        };
        Self {
            transport,
            permissions,
            context,
            attached_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.context.connection_id
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.context.metadata.as_ref()
    }

    /// Resolve permissions now. A resolver source is re-run on every call.
    pub fn permissions(&self) -> Permissions {
        self.permissions.resolve(&self.context)
    }

    pub fn age(&self) -> Duration {
        self.attached_at.elapsed()
    }

    /// Fire-and-forget send. Failures are logged and handed back so the
    /// session can drop a connection that has fallen behind.
    pub fn send(&self, message: Outbound) -> Result<(), TransportError> {
        let kind = message.kind();
        let result = self.transport.send(message);
        match &result {
            Ok(()) => {}
            Err(e @ TransportError::Full) => {
                warn!(connection_id = %self.id(), kind, error = %e, "failed to send to connection");
            }
            Err(e @ TransportError::Closed) => {
                debug!(connection_id = %self.id(), kind, error = %e, "connection already closed");
            }
        }
        result
    }

    /// Hang up on the peer.
    pub fn close(&self) {
        self.transport.close();
    }

    pub(crate) fn send_acked(&self, message: Outbound) -> Result<AckReceiver, TransportError> {
        self.transport.send_acked(message)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", self.id())
            .field("permissions", &self.permissions)
            .field("metadata", &self.context.metadata)
            .finish()
    }
}
