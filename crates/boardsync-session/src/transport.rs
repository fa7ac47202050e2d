//! What a session needs from a connection's transport: an identity, a
//! non-blocking send, a send that the peer must acknowledge, and a way to
//! hang up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use boardsync_core::{ConnectionId, Outbound, TransportError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// Resolves once the peer acknowledged a message sent with
/// [`Transport::send_acked`]. Errors if the transport went away first.
pub type AckReceiver = oneshot::Receiver<()>;

pub trait Transport: Send + Sync {
    /// Stable identity of this transport. Registry uniqueness is keyed on it.
    fn id(&self) -> &ConnectionId;

    /// Enqueue a message without waiting. Never blocks.
    fn send(&self, message: Outbound) -> Result<(), TransportError>;

    /// Enqueue a message that the peer acknowledges. Never blocks; the
    /// returned receiver is awaited by the caller.
    fn send_acked(&self, message: Outbound) -> Result<AckReceiver, TransportError>;

    /// Hang up. Frames already queued may still be delivered; later sends
    /// fail with [`TransportError::Closed`].
    fn close(&self);
}

/// In-process transport backed by a bounded channel.
///
/// With auto-ack, delivery into the channel counts as acknowledgement.
/// Otherwise acks are held until [`LocalTransport::acknowledge`] is called.
/// Closing drops the sender, so the receiver ends after draining.
pub struct LocalTransport {
    id: ConnectionId,
    tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    auto_ack: bool,
    pending_acks: Mutex<Vec<oneshot::Sender<()>>>,
    dropped_messages: AtomicU64,
}

impl LocalTransport {
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        Self::build(capacity, true)
    }

    pub fn manual_ack(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        Self::build(capacity, false)
    }

    fn build(capacity: usize, auto_ack: bool) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self {
            id: ConnectionId::new(),
            tx: Mutex::new(Some(tx)),
            auto_ack,
            pending_acks: Mutex::new(Vec::new()),
            dropped_messages: AtomicU64::new(0),
        };
        (Arc::new(transport), rx)
    }

    /// Complete every outstanding acknowledgement.
    pub fn acknowledge(&self) -> usize {
        let pending: Vec<_> = self.pending_acks.lock().drain(..).collect();
        let count = pending.len();
        for ack in pending {
            let _ = ack.send(());
        }
        count
    }

    /// Total messages dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, mpsc::Sender::is_closed)
    }
}

impl Transport for LocalTransport {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, message: Outbound) -> Result<(), TransportError> {
        let tx = self.tx.lock();
        let result = match tx.as_ref() {
            Some(tx) => tx.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Full,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            }),
            None => Err(TransportError::Closed),
        };
        if result.is_err() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn send_acked(&self, message: Outbound) -> Result<AckReceiver, TransportError> {
        self.send(message)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.auto_ack {
            let _ = ack_tx.send(());
        } else {
            self.pending_acks.lock().push(ack_tx);
        }
        Ok(ack_rx)
    }

    fn close(&self) {
        let _ = self.tx.lock().take();
        // Outstanding acks can no longer arrive.
        self.pending_acks.lock().clear();
    }
}
