//! Socket-backed [`Transport`]: frames are encoded once and queued for the
//! connection's writer task. Closing cancels the socket's token, which makes
//! the writer send a close frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use boardsync_core::{ConnectionId, Outbound, SessionId, TransportError};
use boardsync_session::{AckReceiver, Transport};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::rpc::RpcResponse;
use crate::wire::encode_outbound;

pub struct WsTransport {
    id: ConnectionId,
    session_id: SessionId,
    tx: mpsc::Sender<String>,
    socket: CancellationToken,
    next_ack: AtomicU64,
    pending_acks: DashMap<u64, oneshot::Sender<()>>,
    connected_at: Instant,
    /// Last inbound frame of any kind, pongs included.
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl WsTransport {
    /// `socket` is cancelled when the transport is closed.
    pub fn new(
        session_id: SessionId,
        tx: mpsc::Sender<String>,
        socket: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            session_id,
            tx,
            socket,
            next_ack: AtomicU64::new(1),
            pending_acks: DashMap::new(),
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue an already encoded frame.
    pub fn send_raw(&self, text: String) -> Result<(), TransportError> {
        if self.socket.is_cancelled() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    connection_id = %self.id,
                    dropped,
                    "send queue full, frame dropped"
                );
                Err(TransportError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Closed)
            }
        }
    }

    /// Queue a direct reply to one of this connection's requests. A reply
    /// that does not fit hangs up the socket; the peer would otherwise wait
    /// for it forever.
    pub fn send_response(&self, response: &RpcResponse) -> bool {
        match serde_json::to_string(response) {
            Ok(text) => match self.send_raw(text) {
                Ok(()) => true,
                Err(TransportError::Full) => {
                    self.close();
                    false
                }
                Err(TransportError::Closed) => false,
            },
            Err(e) => {
                error!(connection_id = %self.id, error = %e, "failed to encode response");
                false
            }
        }
    }

    /// Complete the handshake acknowledgement `ack_id`. Returns `false` for
    /// unknown or already acknowledged ids.
    pub fn acknowledge(&self, ack_id: u64) -> bool {
        match self.pending_acks.remove(&ack_id) {
            Some((_, ack)) => ack.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_cancelled()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    fn encode(&self, message: &Outbound, ack_id: Option<u64>) -> Result<String, TransportError> {
        encode_outbound(&self.session_id, message, ack_id).map_err(|e| {
            error!(
                connection_id = %self.id,
                kind = message.kind(),
                error = %e,
                "failed to encode frame"
            );
            TransportError::Closed
        })
    }
}

impl Transport for WsTransport {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, message: Outbound) -> Result<(), TransportError> {
        let text = self.encode(&message, None)?;
        self.send_raw(text)
    }

    fn send_acked(&self, message: Outbound) -> Result<AckReceiver, TransportError> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let text = self.encode(&message, Some(ack_id))?;
        let (tx, rx) = oneshot::channel();
        let _ = self.pending_acks.insert(ack_id, tx);
        if let Err(e) = self.send_raw(text) {
            let _ = self.pending_acks.remove(&ack_id);
            return Err(e);
        }
        Ok(rx)
    }

    fn close(&self) {
        if !self.socket.is_cancelled() {
            info!(connection_id = %self.id, "closing socket");
            self.socket.cancel();
        }
        self.pending_acks.clear();
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardsync_core::Snapshot;
    use serde_json::Value;

    fn make_transport(capacity: usize) -> (WsTransport, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session_id = SessionId::from_raw("board_0");
        (WsTransport::new(session_id, tx, CancellationToken::new()), rx)
    }

    fn handshake() -> Outbound {
        Outbound::Handshake {
            session_id: SessionId::from_raw("board_0"),
            snapshot: Snapshot::new("s"),
            data: None,
        }
    }

    #[tokio::test]
    async fn send_encodes_wire_event() {
        let (transport, mut rx) = make_transport(4);
        transport
            .send(Outbound::PeerJoined {
                connection_id: ConnectionId::from_raw("conn_x"),
            })
            .unwrap();
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "board.peer_joined");
        assert_eq!(frame["sessionId"], "board_0");
        assert_eq!(frame["data"]["connectionId"], "conn_x");
    }

    #[tokio::test]
    async fn acked_send_completes_on_acknowledge() {
        let (transport, mut rx) = make_transport(4);
        let ack = transport.send_acked(handshake()).unwrap();
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let ack_id = frame["data"]["ackId"].as_u64().unwrap();

        assert_eq!(transport.pending_ack_count(), 1);
        assert!(transport.acknowledge(ack_id));
        ack.await.unwrap();
        assert!(!transport.acknowledge(ack_id), "second ack is a no-op");
        assert_eq!(transport.pending_ack_count(), 0);
    }

    #[test]
    fn ack_ids_are_distinct() {
        let (transport, _rx) = make_transport(4);
        let _a = transport.send_acked(handshake()).unwrap();
        let _b = transport.send_acked(handshake()).unwrap();
        assert!(transport.acknowledge(1));
        assert!(transport.acknowledge(2));
        assert!(!transport.acknowledge(3));
    }

    #[test]
    fn full_queue_drops_frame() {
        let (transport, _rx) = make_transport(1);
        transport.send_raw("a".into()).unwrap();
        assert_eq!(transport.send_raw("b".into()), Err(TransportError::Full));
        assert_eq!(transport.drop_count(), 1);
    }

    #[test]
    fn failed_acked_send_leaves_no_pending_ack() {
        let (transport, rx) = make_transport(1);
        drop(rx);
        assert!(matches!(
            transport.send_acked(handshake()),
            Err(TransportError::Closed)
        ));
        assert_eq!(transport.pending_ack_count(), 0);
    }

    #[test]
    fn close_cancels_socket_and_refuses_sends() {
        let (transport, _rx) = make_transport(4);
        let _ack = transport.send_acked(handshake()).unwrap();
        transport.close();

        assert!(transport.is_closed());
        assert_eq!(transport.pending_ack_count(), 0);
        assert_eq!(transport.send_raw("late".into()), Err(TransportError::Closed));
    }

    #[test]
    fn reply_that_does_not_fit_hangs_up() {
        let (transport, _rx) = make_transport(1);
        transport.send_raw("a".into()).unwrap();
        assert!(!transport.send_response(&RpcResponse::parse_error()));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn response_is_sent_verbatim() {
        let (transport, mut rx) = make_transport(4);
        assert!(transport.send_response(&RpcResponse::parse_error()));
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["error"]["code"], "PARSE_ERROR");
    }

    #[test]
    fn mark_alive_resets_elapsed() {
        let (transport, _rx) = make_transport(1);
        transport.mark_alive();
        assert!(transport.last_seen_elapsed() < Duration::from_secs(1));
        assert!(transport.age() < Duration::from_secs(1));
    }
}
