//! Dispatch of inbound text frames to the session.

use boardsync_core::{Command, SessionError};
use boardsync_session::{Session, Transport};
use serde_json::json;
use tracing::debug;

use super::transport::WsTransport;
use crate::rpc::{RpcRequest, RpcResponse, METHOD_CALL, METHOD_HANDSHAKE_ACK, METHOD_RESYNC};

/// Handle one inbound frame.
///
/// Call results and resync replies are enqueued by the session itself so
/// they stay ordered with broadcasts. The returned response, if any, is a
/// direct reply the caller must send.
pub fn handle_frame(text: &str, session: &Session, transport: &WsTransport) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(connection_id = %transport.id(), error = %e, "unparseable frame");
            return Some(RpcResponse::parse_error());
        }
    };
    let id = request.id.clone();

    match request.method.as_str() {
        METHOD_CALL => {
            let raw = match request.param("operation") {
                Ok(raw) => raw.clone(),
                Err(msg) => return Some(RpcResponse::invalid_params(id, msg)),
            };
            let command: Command = match serde_json::from_value(raw) {
                Ok(command) => command,
                Err(e) => return Some(RpcResponse::invalid_params(id, e.to_string())),
            };
            match session.try_invoke(transport.id(), id.clone(), &command) {
                Ok(_) => None,
                Err(e @ SessionError::UnknownConnection(_)) => {
                    Some(RpcResponse::internal_error(id, e.to_string()))
                }
                Err(e) => {
                    debug!(
                        connection_id = %transport.id(),
                        operation = command.operation().as_str(),
                        error = %e,
                        "call refused"
                    );
                    None
                }
            }
        }
        METHOD_RESYNC => match session.resync(transport.id(), id.clone()) {
            Ok(_) => None,
            Err(e) => Some(RpcResponse::internal_error(id, e.to_string())),
        },
        METHOD_HANDSHAKE_ACK => {
            let ack_id = match request.param_u64("ackId") {
                Ok(ack_id) => ack_id,
                Err(msg) => return Some(RpcResponse::invalid_params(id, msg)),
            };
            let acknowledged = transport.acknowledge(ack_id);
            id.is_some()
                .then(|| RpcResponse::success(id, json!({ "acknowledged": acknowledged })))
        }
        other => Some(RpcResponse::method_not_found(id, other)),
    }
}
