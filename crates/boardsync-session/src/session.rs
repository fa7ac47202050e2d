//! The authoritative owner of one board and its attached connections.
//!
//! All engine access, registry changes and notifier state sit behind one
//! mutex per session. The lock is only held for synchronous work; waiting
//! on a handshake acknowledgement happens in [`PendingJoin::confirm`]
//! after it has been released.

use std::sync::Arc;
use std::time::Duration;

use boardsync_core::{
    BoardEvent, Command, ConnectionId, DisconnectOutcome, DisconnectReason, EventKind, Outbound,
    PermissionSource, RequestId, RulesEngine, SessionError, SessionId, SessionIdAllocator,
    SessionView, Side, Snapshot, TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::dispatcher::Origin;
use crate::notifier::{EventNotifier, HandlerId};
use crate::registry::ConnectionRegistry;
use crate::transport::{AckReceiver, Transport};

pub(crate) struct SessionState {
    pub(crate) session_id: SessionId,
    pub(crate) engine: Box<dyn RulesEngine>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) notifier: EventNotifier,
}

impl SessionState {
    pub(crate) fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id.clone(),
            snapshot: self.engine.snapshot(),
            turn: self.engine.turn(),
            game_over: self.engine.is_game_over(),
        }
    }

    /// Send one frame to one connection. A connection whose queue is full
    /// has lost a frame it can never recover in order, so it is dropped.
    pub(crate) fn deliver(
        &mut self,
        connection: &Connection,
        message: Outbound,
    ) -> Result<(), TransportError> {
        let result = connection.send(message);
        if result == Err(TransportError::Full) {
            self.drop_overflowed(vec![connection.id().clone()]);
        }
        result
    }

    pub(crate) fn drop_overflowed(&mut self, overflowed: Vec<ConnectionId>) {
        for connection_id in overflowed {
            if self.release(&connection_id, DisconnectReason::QueueOverflow) {
                warn!(
                    session_id = %self.session_id,
                    connection_id = %connection_id,
                    "send queue overflowed, connection dropped"
                );
            }
        }
    }

    /// Remove a connection, hang up its transport and emit `peer_left`.
    /// Returns false if it was not registered.
    pub(crate) fn release(
        &mut self,
        connection_id: &ConnectionId,
        reason: DisconnectReason,
    ) -> bool {
        let Some(connection) = self.registry.remove(connection_id) else {
            return false;
        };
        connection.close();
        let view = self.view();
        self.notifier.emit(
            &view,
            &BoardEvent::PeerLeft {
                connection_id: connection_id.clone(),
                reason,
            },
        );
        true
    }
}

struct SessionInner {
    id: SessionId,
    state: Mutex<SessionState>,
}

/// Cheap, cloneable handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(engine: Box<dyn RulesEngine>, ids: &dyn SessionIdAllocator) -> Self {
        Self::with_id(engine, ids.next_id())
    }

    pub fn with_id(engine: Box<dyn RulesEngine>, id: SessionId) -> Self {
        let initial = SessionView {
            session_id: id.clone(),
            snapshot: engine.snapshot(),
            turn: engine.turn(),
            game_over: engine.is_game_over(),
        };
        let state = SessionState {
            session_id: id.clone(),
            engine,
            registry: ConnectionRegistry::new(),
            notifier: EventNotifier::seeded(&initial),
        };
        info!(session_id = %id, "session created");
        Self {
            inner: Arc::new(SessionInner {
                id,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Register a connection and push it the current snapshot.
    ///
    /// A connection whose permissions deny connecting is rejected before
    /// anything is registered or sent. Otherwise the handshake is enqueued
    /// under the lock; call [`PendingJoin::confirm`] to wait for the
    /// acknowledgement and announce the peer.
    pub fn attach(&self, request: AttachRequest) -> Result<PendingJoin, SessionError> {
        let connection = Arc::new(Connection::new(
            request.transport,
            request.permissions,
            request.metadata,
        ));
        let connection_id = connection.id().clone();

        if !connection.permissions().can_connect {
            info!(session_id = %self.id(), connection_id = %connection_id, "connection rejected");
            return Err(SessionError::ConnectionRejected(connection_id));
        }

        let mut state = self.inner.state.lock();
        state.registry.add(connection.clone());
        let handshake = Outbound::Handshake {
            session_id: self.id().clone(),
            snapshot: state.engine.snapshot(),
            data: request.handshake_data,
        };
        let ack = match connection.send_acked(handshake) {
            Ok(ack) => ack,
            Err(e) => {
                let _ = state.registry.remove(&connection_id);
                warn!(
                    session_id = %self.id(),
                    connection_id = %connection_id,
                    error = %e,
                    "handshake could not be sent"
                );
                return Err(e.into());
            }
        };
        debug!(
            session_id = %self.id(),
            connection_id = %connection_id,
            connections = state.registry.len(),
            "handshake sent"
        );
        drop(state);

        Ok(PendingJoin {
            session: self.clone(),
            connection,
            ack,
        })
    }

    /// Remote invocation; the boolean is also pushed to the caller as a
    /// `call_result` frame.
    pub fn invoke(
        &self,
        connection_id: &ConnectionId,
        request_id: RequestId,
        command: &Command,
    ) -> bool {
        self.try_invoke(connection_id, request_id, command).is_ok()
    }

    /// Like [`Session::invoke`], keeping the reason for a refusal.
    pub fn try_invoke(
        &self,
        connection_id: &ConnectionId,
        request_id: RequestId,
        command: &Command,
    ) -> Result<Value, SessionError> {
        let mut state = self.inner.state.lock();
        let Some(connection) = state.registry.get(connection_id) else {
            return Err(SessionError::UnknownConnection(connection_id.clone()));
        };
        let permissions = connection.permissions();
        let result = state.execute(Origin::Remote(connection_id, &permissions), command);
        let _ = state.deliver(
            &connection,
            Outbound::CallResult {
                request_id,
                accepted: result.is_ok(),
            },
        );
        result
    }

    /// Local invocation. Skips permission checks and broadcasts to every
    /// connection.
    pub fn apply(&self, command: &Command) -> Result<Value, SessionError> {
        self.inner.state.lock().execute(Origin::Local, command)
    }

    /// Push the current snapshot to one connection. Never mutates or
    /// broadcasts.
    pub fn resync(
        &self,
        connection_id: &ConnectionId,
        request_id: RequestId,
    ) -> Result<Snapshot, SessionError> {
        let mut state = self.inner.state.lock();
        let Some(connection) = state.registry.get(connection_id) else {
            return Err(SessionError::UnknownConnection(connection_id.clone()));
        };
        let snapshot = state.engine.snapshot();
        state.deliver(
            &connection,
            Outbound::ResyncResult {
                request_id,
                snapshot: snapshot.clone(),
            },
        )?;
        debug!(session_id = %self.id(), connection_id = %connection_id, "resync served");
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.lock().engine.snapshot()
    }

    pub fn turn(&self) -> Side {
        self.inner.state.lock().engine.turn()
    }

    pub fn is_game_over(&self) -> bool {
        self.inner.state.lock().engine.is_game_over()
    }

    pub fn view(&self) -> SessionView {
        self.inner.state.lock().view()
    }

    /// Handle a disconnect notice from a connection's transport.
    ///
    /// Deliberate closes release the slot, hang up the transport and emit
    /// `peer_left`; anything else keeps the connection so the peer can
    /// resync.
    pub fn disconnect(
        &self,
        connection_id: &ConnectionId,
        reason: DisconnectReason,
    ) -> DisconnectOutcome {
        let mut state = self.inner.state.lock();
        if !state.registry.contains(connection_id) {
            return DisconnectOutcome::Unknown;
        }

        if !reason.is_deliberate() {
            info!(
                session_id = %self.id(),
                connection_id = %connection_id,
                reason = reason.as_str(),
                "transport lost, connection retained"
            );
            return DisconnectOutcome::TransportLost;
        }

        let _ = state.release(connection_id, reason.clone());
        info!(
            session_id = %self.id(),
            connection_id = %connection_id,
            reason = reason.as_str(),
            connections = state.registry.len(),
            "connection removed"
        );
        DisconnectOutcome::DeliberateDisconnect
    }

    /// Remove a connection on the server's initiative.
    pub fn evict(&self, connection_id: &ConnectionId) -> DisconnectOutcome {
        self.disconnect(connection_id, DisconnectReason::ServerClose)
    }

    /// Subscribe to an event kind. The handler runs under the session lock
    /// and must not call back into this session.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: FnMut(&SessionView, &BoardEvent) + Send + 'static,
    {
        self.inner.state.lock().notifier.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.state.lock().notifier.off(kind, id)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.state.lock().registry.all()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.state.lock().registry.get(connection_id)
    }

    fn announce_join(&self, connection: &Connection) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        let connection_id = connection.id();
        if !state.registry.contains(connection_id) {
            return Err(SessionError::UnknownConnection(connection_id.clone()));
        }
        let view = state.view();
        state.notifier.emit(
            &view,
            &BoardEvent::PeerJoined {
                connection_id: connection_id.clone(),
            },
        );
        let fanout = state.registry.broadcast(
            &Outbound::PeerJoined {
                connection_id: connection_id.clone(),
            },
            Some(connection_id),
        );
        state.drop_overflowed(fanout.overflowed);
        info!(session_id = %self.id(), connection_id = %connection_id, "peer joined");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

/// Everything needed to attach one connection.
pub struct AttachRequest {
    transport: Arc<dyn Transport>,
    permissions: PermissionSource,
    metadata: Option<Value>,
    handshake_data: Option<Value>,
}

impl AttachRequest {
    pub fn new(transport: Arc<dyn Transport>, permissions: impl Into<PermissionSource>) -> Self {
        Self {
            transport,
            permissions: permissions.into(),
            metadata: None,
            handshake_data: None,
        }
    }

    /// Opaque connect-time context, visible to permission resolvers.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Extra payload carried in the handshake frame.
    pub fn handshake_data(mut self, data: Value) -> Self {
        self.handshake_data = Some(data);
        self
    }
}

/// A registered connection whose handshake is in flight.
#[must_use = "the peer is only announced once the join is confirmed"]
pub struct PendingJoin {
    session: Session,
    connection: Arc<Connection>,
    ack: AckReceiver,
}

impl PendingJoin {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Wait for the peer to acknowledge its handshake, then announce it to
    /// local handlers and the other connections.
    ///
    /// On timeout the connection stays registered; the caller decides
    /// whether to evict it.
    pub async fn confirm(self, deadline: Duration) -> Result<Arc<Connection>, SessionError> {
        match tokio::time::timeout(deadline, self.ack).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(SessionError::Transport(TransportError::Closed)),
            Err(_) => {
                warn!(
                    session_id = %self.session.id(),
                    connection_id = %self.connection.id(),
                    ?deadline,
                    "handshake not acknowledged"
                );
                return Err(SessionError::HandshakeTimeout(deadline));
            }
        }
        self.session.announce_join(&self.connection)?;
        Ok(self.connection)
    }
}

impl std::fmt::Debug for PendingJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJoin")
            .field("session", self.session.id())
            .field("connection", self.connection.id())
            .finish()
    }
}
