//! The set of connections attached to one session.

use std::collections::HashMap;
use std::sync::Arc;

use boardsync_core::{ConnectionId, Outbound, TransportError};
use tracing::debug;

use crate::connection::Connection;

/// Connections keyed by transport identity. Not synchronized on its own;
/// the owning session serializes access.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

/// What a broadcast reached.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    /// Connections whose send queue was full. They missed this frame.
    pub overflowed: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection, replacing any entry with the same transport id.
    pub fn add(&mut self, connection: Arc<Connection>) {
        let _ = self.connections.insert(connection.id().clone(), connection);
    }

    /// Remove by id. Idempotent: returns the removed entry, if any.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Copy of the current set, in no particular order. Later registry
    /// changes do not show up in it.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send to every connection except `exclude`.
    pub fn broadcast(&self, message: &Outbound, exclude: Option<&ConnectionId>) -> Fanout {
        let mut fanout = Fanout::default();
        let mut recipients = 0;
        for (id, conn) in &self.connections {
            if Some(id) == exclude {
                continue;
            }
            recipients += 1;
            match conn.send(message.clone()) {
                Ok(()) => fanout.delivered += 1,
                Err(TransportError::Full) => fanout.overflowed.push(id.clone()),
                Err(TransportError::Closed) => {}
            }
        }
        debug!(
            kind = message.kind(),
            recipients,
            delivered = fanout.delivered,
            overflowed = fanout.overflowed.len(),
            "broadcast"
        );
        fanout
    }
}
