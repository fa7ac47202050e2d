//! The set of boards one server hosts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use boardsync_core::{ConnectionId, DisconnectOutcome, RulesEngine, SessionId, SessionIdAllocator};
use boardsync_session::Session;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

/// Builds a fresh rules engine for every new board.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn RulesEngine> + Send + Sync>;

/// Listing entry for `GET /boards`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSummary {
    pub id: SessionId,
    pub connections: usize,
    pub turn: String,
    pub game_over: bool,
}

struct LostConnection {
    session_id: SessionId,
    since: Instant,
}

pub struct SessionHub {
    sessions: DashMap<SessionId, Session>,
    ids: Arc<dyn SessionIdAllocator>,
    engines: EngineFactory,
    /// Connections whose socket dropped without a close handshake. They
    /// stay attached to their board until pruned.
    lost: DashMap<ConnectionId, LostConnection>,
}

impl SessionHub {
    pub fn new(ids: Arc<dyn SessionIdAllocator>, engines: EngineFactory) -> Self {
        Self {
            sessions: DashMap::new(),
            ids,
            engines,
            lost: DashMap::new(),
        }
    }

    /// Create a board with the next allocated id and a fresh engine.
    pub fn create(&self) -> Session {
        let session = Session::new((self.engines)(), self.ids.as_ref());
        let _ = self.sessions.insert(session.id().clone(), session.clone());
        info!(session_id = %session.id(), boards = self.sessions.len(), "board created");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Summaries of every board, ordered by id.
    pub fn list(&self) -> Vec<BoardSummary> {
        let mut boards: Vec<BoardSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let view = session.view();
                BoardSummary {
                    id: view.session_id,
                    connections: session.connection_count(),
                    turn: view.turn.as_str().to_string(),
                    game_over: view.game_over,
                }
            })
            .collect();
        boards.sort_by(|a, b| a.id.cmp(&b.id));
        boards
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connections across all boards, lost ones included.
    pub fn connection_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().connection_count())
            .sum()
    }

    pub fn record_lost(&self, session_id: &SessionId, connection_id: &ConnectionId) {
        let _ = self.lost.insert(
            connection_id.clone(),
            LostConnection {
                session_id: session_id.clone(),
                since: Instant::now(),
            },
        );
    }

    pub fn lost_count(&self) -> usize {
        self.lost.len()
    }

    /// Evict lost connections older than `max_age`. Returns how many were
    /// still attached.
    pub fn prune_lost(&self, max_age: Duration) -> usize {
        let expired: Vec<(ConnectionId, SessionId)> = self
            .lost
            .iter()
            .filter(|entry| entry.value().since.elapsed() >= max_age)
            .map(|entry| (entry.key().clone(), entry.value().session_id.clone()))
            .collect();

        let mut evicted = 0;
        for (connection_id, session_id) in expired {
            let _ = self.lost.remove(&connection_id);
            let Some(session) = self.get(&session_id) else {
                continue;
            };
            if session.evict(&connection_id) == DisconnectOutcome::DeliberateDisconnect {
                evicted += 1;
                debug!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    "lost connection pruned"
                );
            }
        }
        evicted
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("boards", &self.sessions.len())
            .field("lost", &self.lost.len())
            .finish_non_exhaustive()
    }
}

/// Periodically evict connections that stayed lost past `retention`.
pub fn start_cleanup_task(
    hub: Arc<SessionHub>,
    interval: Duration,
    retention: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            let removed = hub.prune_lost(retention);
            if removed > 0 {
                info!(removed, "lost connection cleanup");
            }
        }
    })
}
