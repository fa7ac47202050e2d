//! One socket attached to one board, from upgrade through disconnect.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use boardsync_core::{DisconnectOutcome, DisconnectReason};
use boardsync_session::{AttachRequest, Session, Transport};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::handler::handle_frame;
use super::transport::WsTransport;
use crate::server::AppState;

/// Run a board connection for an upgraded socket.
///
/// 1. Attaches to the board; a refused connection gets a policy close frame
/// 2. Waits for the handshake ack in the background and evicts on failure
/// 3. Forwards queued frames and sends periodic pings; a closed transport
///    ends the socket with a close frame
/// 4. Dispatches inbound frames
/// 5. Reports the disconnect reason to the board
#[instrument(skip_all, fields(session_id = %session.id()))]
pub async fn run_ws_session(ws: WebSocket, session: Session, metadata: Value, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let config = state.config.clone();

    let cancel = state.shutdown.child_token();
    let (send_tx, mut send_rx) = mpsc::channel::<String>(config.max_send_queue.max(1));
    let transport = Arc::new(WsTransport::new(
        session.id().clone(),
        send_tx,
        cancel.clone(),
    ));
    let connection_id = transport.id().clone();

    let request = AttachRequest::new(transport.clone(), state.permissions.clone())
        .metadata(metadata)
        .handshake_data(json!({ "connectionId": connection_id }));
    let pending = match session.attach(request) {
        Ok(pending) => pending,
        Err(e) => {
            info!(connection_id = %connection_id, error = %e, "connection refused");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };
    info!(connection_id = %connection_id, "client connected");

    let confirm_session = session.clone();
    let confirm_cancel = cancel.clone();
    let confirm_id = connection_id.clone();
    let deadline = config.handshake_ack_timeout();
    let _confirm = tokio::spawn(async move {
        if let Err(e) = pending.confirm(deadline).await {
            warn!(connection_id = %confirm_id, error = %e, "join not confirmed, evicting");
            let _ = confirm_session.evict(&confirm_id);
            confirm_cancel.cancel();
        }
    });

    let writer_transport = transport.clone();
    let writer_cancel = cancel.clone();
    let heartbeat_interval = config.heartbeat_interval();
    let heartbeat_timeout = config.heartbeat_timeout();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "server closing".into(),
                        })))
                        .await;
                    return DisconnectReason::ServerClose;
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else {
                        return DisconnectReason::ServerClose;
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        return DisconnectReason::TransportError;
                    }
                }
                _ = ping_interval.tick() => {
                    if writer_transport.last_seen_elapsed() > heartbeat_timeout {
                        warn!(
                            connection_id = %writer_transport.id(),
                            timeout = ?heartbeat_timeout,
                            "client unresponsive, disconnecting"
                        );
                        return DisconnectReason::PingTimeout;
                    }
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        return DisconnectReason::TransportError;
                    }
                }
            }
        }
    });

    let reader_transport = transport.clone();
    let reader_session = session.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(connection_id = %reader_transport.id(), error = %e, "read failed");
                    return DisconnectReason::TransportError;
                }
            };
            reader_transport.mark_alive();

            // Text or Binary frames; binary must be UTF-8
            let text = match msg {
                Message::Text(t) => t.to_string(),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(s) => s.to_string(),
                    Err(_) => {
                        debug!(len = data.len(), "non-UTF8 binary frame ignored");
                        continue;
                    }
                },
                Message::Close(_) => return DisconnectReason::ClientClose,
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            if let Some(response) = handle_frame(&text, &reader_session, &reader_transport) {
                let _ = reader_transport.send_response(&response);
            }
        }
        DisconnectReason::TransportClose
    });

    let finished = tokio::select! {
        r = &mut reader => {
            writer.abort();
            r
        }
        w = &mut writer => {
            reader.abort();
            w
        }
    };
    let reason = finished.unwrap_or(DisconnectReason::TransportError);

    match session.disconnect(&connection_id, reason.clone()) {
        DisconnectOutcome::TransportLost => state.hub.record_lost(session.id(), &connection_id),
        DisconnectOutcome::DeliberateDisconnect | DisconnectOutcome::Unknown => {}
    }
    info!(
        connection_id = %connection_id,
        reason = reason.as_str(),
        dropped = transport.drop_count(),
        age = ?transport.age(),
        "client disconnected"
    );
}
