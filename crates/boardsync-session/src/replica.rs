//! Client-side mirror of a remote session.
//!
//! A replica owns its own rules engine and rebuilds the board from the
//! handshake snapshot plus the stream of broadcast commands, firing the
//! same notifications a session would.

use std::sync::Arc;
use std::time::Duration;

use boardsync_core::{
    BoardEvent, Command, EventKind, Operation, OperationError, Outbound, RulesEngine, SessionId,
    SessionView, Side, Snapshot,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::notifier::{EventNotifier, HandlerId};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("local {operation} failed, replica diverged: {source}")]
    Diverged {
        operation: Operation,
        #[source]
        source: OperationError,
    },

    #[error("snapshot rejected by local engine: {0}")]
    Load(#[source] OperationError),
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("not connected within {0:?}")]
    Timeout(Duration),
}

struct ReplicaState {
    session_id: Option<SessionId>,
    engine: Box<dyn RulesEngine>,
    notifier: EventNotifier,
}

impl ReplicaState {
    fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id.clone().unwrap_or_else(|| SessionId::from_raw("")),
            snapshot: self.engine.snapshot(),
            turn: self.engine.turn(),
            game_over: self.engine.is_game_over(),
        }
    }

    fn refresh(&mut self) -> Vec<BoardEvent> {
        let view = self.view();
        self.notifier.on_state_changed(&view)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<(), ReplicaError> {
        self.engine.load(snapshot).map_err(ReplicaError::Load)?;
        let _ = self.refresh();
        Ok(())
    }
}

/// Cloneable handle to a local mirror.
#[derive(Clone)]
pub struct Replica {
    state: Arc<Mutex<ReplicaState>>,
}

impl Replica {
    pub fn new(engine: Box<dyn RulesEngine>) -> Self {
        let state = ReplicaState {
            session_id: None,
            notifier: EventNotifier::seeded(&SessionView {
                session_id: SessionId::from_raw(""),
                snapshot: engine.snapshot(),
                turn: engine.turn(),
                game_over: engine.is_game_over(),
            }),
            engine,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Apply one message pushed by the session.
    pub fn handle(&self, message: &Outbound) -> Result<(), ReplicaError> {
        let mut state = self.state.lock();
        match message {
            Outbound::Handshake {
                session_id,
                snapshot,
                ..
            } => {
                let previous = state.session_id.replace(session_id.clone());
                if let Err(e) = state.load(snapshot) {
                    state.session_id = previous;
                    return Err(e);
                }
                let view = state.view();
                state.notifier.emit(
                    &view,
                    &BoardEvent::Connected {
                        session_id: session_id.clone(),
                    },
                );
                debug!(session_id = %session_id, "replica connected");
            }
            Outbound::MethodCall { command } => {
                apply_locked(&mut state, command)?;
            }
            Outbound::ResyncResult { snapshot, .. } => {
                state.load(snapshot)?;
            }
            Outbound::PeerJoined { connection_id } => {
                let view = state.view();
                state.notifier.emit(
                    &view,
                    &BoardEvent::PeerJoined {
                        connection_id: connection_id.clone(),
                    },
                );
            }
            Outbound::CallResult { .. } => {}
        }
        Ok(())
    }

    /// Apply a command this client issued and the session accepted.
    pub fn apply_own(&self, command: &Command) -> Result<Value, ReplicaError> {
        apply_locked(&mut self.state.lock(), command)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().session_id.is_some()
    }

    /// Forget the session so that the next handshake counts as a new
    /// connection. The board itself is kept until that handshake loads.
    pub fn mark_disconnected(&self) {
        let _ = self.state.lock().session_id.take();
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().engine.snapshot()
    }

    pub fn turn(&self) -> Side {
        self.state.lock().engine.turn()
    }

    pub fn is_game_over(&self) -> bool {
        self.state.lock().engine.is_game_over()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: FnMut(&SessionView, &BoardEvent) + Send + 'static,
    {
        self.state.lock().notifier.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.state.lock().notifier.off(kind, id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.state.lock().notifier.handler_count(kind)
    }

    /// Resolve once the handshake has been applied, or fail after
    /// `deadline`. The internal listener is removed either way.
    pub async fn wait_until_connected(&self, deadline: Duration) -> Result<(), WaitError> {
        let (id, rx) = {
            let mut state = self.state.lock();
            if state.session_id.is_some() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            let id = state.notifier.on(EventKind::Connected, move |_, _| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            });
            (id, rx)
        };

        let outcome = tokio::time::timeout(deadline, rx).await;
        let _ = self.off(EventKind::Connected, id);

        match outcome {
            Ok(Ok(())) => Ok(()),
            _ => Err(WaitError::Timeout(deadline)),
        }
    }
}

fn apply_locked(state: &mut ReplicaState, command: &Command) -> Result<Value, ReplicaError> {
    let operation = command.operation();
    let value = command.apply(state.engine.as_mut()).map_err(|source| {
        warn!(operation = %operation, error = %source, "replica could not apply command");
        ReplicaError::Diverged { operation, source }
    })?;
    let _ = state.refresh();
    Ok(value)
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}
