//! Request/reply frames exchanged on a board socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run a command against the board. Params: `{ operation: {name, args} }`.
pub const METHOD_CALL: &str = "board.call";
/// Ask for the current snapshot. No params.
pub const METHOD_RESYNC: &str = "board.resync";
/// Acknowledge a handshake event. Params: `{ ackId }`.
pub const METHOD_HANDSHAKE_ACK: &str = "board.handshake_ack";

/// Inbound request. Requests without an `id` get no direct reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            method: method.to_owned(),
            params,
            id,
        }
    }

    /// Look up `key` in the params object.
    pub fn param(&self, key: &str) -> Result<&Value, String> {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .ok_or_else(|| format!("missing parameter `{key}`"))
    }

    pub fn param_u64(&self, key: &str) -> Result<u64, String> {
        self.param(key)?
            .as_u64()
            .ok_or_else(|| format!("parameter `{key}` must be a non-negative integer"))
    }
}

/// Why a request failed. Serialized as its SCREAMING_SNAKE name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    MethodNotFound,
    InvalidParams,
    /// The connection is no longer part of the session.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Reply frame: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Kept as a plain string so replies from newer servers still decode.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.as_str().to_owned(),
                message: message.into(),
            }),
        }
    }

    /// The frame could not be read, so there is no id to echo.
    pub fn parse_error() -> Self {
        Self::failure(None, ErrorCode::ParseError, "frame is not a request")
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::failure(id, ErrorCode::MethodNotFound, format!("no method `{method}`"))
    }

    pub fn invalid_params(id: Option<Value>, message: impl Into<String>) -> Self {
        Self::failure(id, ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(id: Option<Value>, message: impl Into<String>) -> Self {
        Self::failure(id, ErrorCode::InternalError, message)
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}
