//! Remote board: a [`Replica`] fed over a WebSocket by a board server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boardsync_core::{Command, ConnectionId, Outbound, RulesEngine, Snapshot};
use boardsync_session::{Replica, WaitError};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::{RpcRequest, RpcResponse, METHOD_CALL, METHOD_HANDSHAKE_ACK, METHOD_RESYNC};
use crate::wire::{decode_event, decode_server_frame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the server to answer the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake not received: {0}")]
    Handshake(#[from] WaitError),
    #[error("connection closed")]
    Closed,
    #[error("server error {code}: {message}")]
    Rpc { code: String, message: String },
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// What a request was, so its reply can be applied to the replica.
enum PendingCall {
    Call(Command),
    Resync,
}

type PendingTable = DashMap<u64, (PendingCall, oneshot::Sender<RpcResponse>)>;

/// One socket. Replaced wholesale on reconnect.
struct Link {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingTable>,
    /// Cancelled once the reader has stopped; nothing will answer after.
    closed: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    async fn open(
        url: &str,
        replica: &Replica,
        connection_id: &Arc<Mutex<Option<ConnectionId>>>,
    ) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let pending: Arc<PendingTable> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            stream,
            replica.clone(),
            out_tx.clone(),
            pending.clone(),
            connection_id.clone(),
            closed.clone(),
        ));

        Ok(Self {
            out_tx,
            pending,
            closed,
            reader,
            writer,
        })
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct RemoteBoard {
    url: String,
    replica: Replica,
    link: Link,
    next_id: AtomicU64,
    connection_id: Arc<Mutex<Option<ConnectionId>>>,
}

impl RemoteBoard {
    /// Connect to a board socket and wait up to `deadline` for the handshake.
    ///
    /// `engine` must be the same kind of rules engine the server runs.
    pub async fn connect(
        url: &str,
        engine: Box<dyn RulesEngine>,
        deadline: Duration,
    ) -> Result<Self, ClientError> {
        let replica = Replica::new(engine);
        let connection_id = Arc::new(Mutex::new(None));
        let link = Link::open(url, &replica, &connection_id).await?;

        let board = Self {
            url: url.to_owned(),
            replica,
            link,
            next_id: AtomicU64::new(1),
            connection_id,
        };
        board.replica.wait_until_connected(deadline).await?;
        Ok(board)
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Identity the server assigned to the current socket.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.lock().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.replica.snapshot()
    }

    /// True once the server side of the socket is gone. Calls fail with
    /// [`ClientError::Closed`] until [`RemoteBoard::reconnect`] succeeds.
    pub fn is_closed(&self) -> bool {
        self.link.closed.is_cancelled()
    }

    /// Invoke `command` on the board. Resolves to whether the session
    /// accepted it; accepted commands are already applied locally.
    pub async fn call(&self, command: &Command) -> Result<bool, ClientError> {
        let params = json!({ "operation": command });
        let resp = self
            .request(METHOD_CALL, Some(params), PendingCall::Call(command.clone()))
            .await?;
        resp.get("accepted").and_then(Value::as_bool).ok_or_else(|| {
            ClientError::Malformed(format!("call result without accepted: {resp}"))
        })
    }

    /// Fetch the session's snapshot and load it into the replica.
    pub async fn resync(&self) -> Result<Snapshot, ClientError> {
        let resp = self.request(METHOD_RESYNC, None, PendingCall::Resync).await?;
        let snapshot = resp.get("snapshot").cloned().ok_or_else(|| {
            ClientError::Malformed(format!("resync result without snapshot: {resp}"))
        })?;
        serde_json::from_value(snapshot).map_err(|e| ClientError::Malformed(e.to_string()))
    }

    /// Open a new socket to the same board, wait for its handshake, then
    /// resync. The server treats it as a new connection with a new id.
    ///
    /// Outstanding calls on the old socket fail with [`ClientError::Closed`].
    pub async fn reconnect(&mut self, deadline: Duration) -> Result<Snapshot, ClientError> {
        self.replica.mark_disconnected();
        *self.connection_id.lock() = None;
        self.link = Link::open(&self.url, &self.replica, &self.connection_id).await?;
        self.replica.wait_until_connected(deadline).await?;
        let snapshot = self.resync().await?;
        info!(connection_id = ?self.connection_id(), "reconnected to board");
        Ok(snapshot)
    }

    /// Close deliberately, so the server releases the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.link
            .out_tx
            .send(Message::Close(None))
            .map_err(|_| ClientError::Closed)?;
        let _ = (&mut self.link.writer).await;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut self.link.reader).await.is_err() {
            debug!("server did not answer close frame");
        }
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        call: PendingCall,
    ) -> Result<Value, ClientError> {
        let link = &self.link;
        if link.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = link.pending.insert(id, (call, tx));

        let request = RpcRequest::new(method, params, Some(json!(id)));
        let text = serde_json::to_string(&request)
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        if link.out_tx.send(Message::text(text)).is_err() {
            let _ = link.pending.remove(&id);
            return Err(ClientError::Closed);
        }

        // A reply that arrived before the reader stopped still wins.
        let resp = tokio::select! {
            biased;
            resp = rx => resp.map_err(|_| ClientError::Closed)?,
            () = link.closed.cancelled() => {
                let _ = link.pending.remove(&id);
                return Err(ClientError::Closed);
            }
        };
        match (resp.success, resp.result, resp.error) {
            (true, Some(result), _) => Ok(result),
            (_, _, Some(error)) => Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            }),
            _ => Err(ClientError::Malformed(format!("empty reply to {method}"))),
        }
    }
}

impl std::fmt::Debug for RemoteBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBoard")
            .field("url", &self.url)
            .field("replica", &self.replica)
            .field("pending", &self.link.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Apply server frames to the replica in arrival order. Replies to our own
/// calls are applied here too, so they interleave correctly with broadcasts.
async fn read_loop(
    mut stream: futures::stream::SplitStream<WsStream>,
    replica: Replica,
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingTable>,
    connection_id: Arc<Mutex<Option<ConnectionId>>>,
    closed: CancellationToken,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.as_str().to_owned(),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(s) => s.to_owned(),
                Err(_) => continue,
            },
            Ok(Message::Close(frame)) => {
                debug!(?frame, "server closed board socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "board socket failed");
                break;
            }
        };

        match decode_server_frame(&text) {
            Ok(ServerFrame::Event(event)) => {
                let (message, ack_id) = match decode_event(&event) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(error = %e, event_type = %event.event_type, "undecodable event");
                        continue;
                    }
                };
                if let Outbound::Handshake { data: Some(data), .. } = &message {
                    if let Some(id) = data.get("connectionId").and_then(Value::as_str) {
                        *connection_id.lock() = Some(ConnectionId::from_raw(id));
                    }
                }
                if let Err(e) = replica.handle(&message) {
                    warn!(kind = message.kind(), error = %e, "replica rejected frame");
                    continue;
                }
                if let Some(ack_id) = ack_id {
                    let params = json!({ "ackId": ack_id });
                    let ack = RpcRequest::new(METHOD_HANDSHAKE_ACK, Some(params), None);
                    if let Ok(text) = serde_json::to_string(&ack) {
                        let _ = out_tx.send(Message::text(text));
                    }
                }
            }
            Ok(ServerFrame::Response(resp)) => {
                let Some(id) = resp.id.as_ref().and_then(Value::as_u64) else {
                    debug!(code = ?resp.error_code(), "unsolicited response");
                    continue;
                };
                let Some((_, (call, reply))) = pending.remove(&id) else {
                    continue;
                };
                if resp.success {
                    apply_reply(&replica, &call, resp.result.as_ref());
                }
                let _ = reply.send(resp);
            }
            Err(e) => warn!(error = %e, "malformed server frame"),
        }
    }
    closed.cancel();
    // Dropping the senders fails every outstanding request with Closed.
    pending.clear();
}

fn apply_reply(replica: &Replica, call: &PendingCall, result: Option<&Value>) {
    let Some(result) = result else { return };
    match call {
        PendingCall::Call(command) => {
            if result.get("accepted").and_then(Value::as_bool) == Some(true) {
                if let Err(e) = replica.apply_own(command) {
                    warn!(error = %e, "accepted command failed locally");
                }
            }
        }
        PendingCall::Resync => {
            let snapshot = result
                .get("snapshot")
                .cloned()
                .and_then(|s| serde_json::from_value::<Snapshot>(s).ok());
            if let Some(snapshot) = snapshot {
                let message = Outbound::ResyncResult {
                    request_id: None,
                    snapshot,
                };
                if let Err(e) = replica.handle(&message) {
                    warn!(error = %e, "resync snapshot rejected");
                }
            }
        }
    }
}
