//! Permission checks and the commit pipeline shared by remote and local
//! invocations.

use boardsync_core::{
    Command, ConnectionId, DenialReason, Operation, Outbound, Permissions, SessionError, Side,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::session::SessionState;

/// Decide whether `permissions` may run `operation` while `mover` is to play.
///
/// The allow-list wins; otherwise only the turn action is possible, and
/// only for a connection that may act as the side to move.
pub fn authorize(
    permissions: &Permissions,
    operation: Operation,
    mover: Side,
) -> Result<(), DenialReason> {
    if permissions.allows(operation) {
        Ok(())
    } else if operation.is_turn_action() {
        if permissions.can_act_as(mover) {
            Ok(())
        } else {
            Err(DenialReason::NotYourTurn)
        }
    } else {
        Err(DenialReason::NotPermitted)
    }
}

/// Who asked for a command.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Origin<'a> {
    /// Trusted in-process caller. Broadcast reaches every connection.
    Local,
    /// An attached connection, checked against its permissions and
    /// excluded from the broadcast.
    Remote(&'a ConnectionId, &'a Permissions),
}

impl SessionState {
    /// Check, apply, broadcast, notify. Runs entirely under the session lock.
    ///
    /// Peers that could not take the broadcast are dropped afterwards, so
    /// every connection still attached has seen every committed command.
    pub(crate) fn execute(
        &mut self,
        origin: Origin<'_>,
        command: &Command,
    ) -> Result<Value, SessionError> {
        let operation = command.operation();

        if let Origin::Remote(connection_id, permissions) = origin {
            let mover = self.engine.turn();
            if let Err(reason) = authorize(permissions, operation, mover) {
                debug!(
                    session_id = %self.session_id,
                    connection_id = %connection_id,
                    operation = %operation,
                    reason = reason.as_str(),
                    "invocation denied"
                );
                return Err(SessionError::InvocationDenied { operation, reason });
            }
        }

        let value = command.apply(self.engine.as_mut()).map_err(|source| {
            debug!(
                session_id = %self.session_id,
                operation = %operation,
                error_kind = source.error_kind(),
                error = %source,
                "operation rejected by engine"
            );
            SessionError::OperationFailed { operation, source }
        })?;

        let exclude = match origin {
            Origin::Local => None,
            Origin::Remote(id, _) => Some(id),
        };
        let fanout = self.registry.broadcast(
            &Outbound::MethodCall {
                command: command.clone(),
            },
            exclude,
        );

        let view = self.view();
        let events = self.notifier.on_state_changed(&view);

        info!(
            session_id = %self.session_id,
            operation = %operation,
            delivered = fanout.delivered,
            events = events.len(),
            "command committed"
        );
        self.drop_overflowed(fanout.overflowed);
        Ok(value)
    }
}
