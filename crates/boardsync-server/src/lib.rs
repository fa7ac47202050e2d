//! WebSocket hosting for shared boards, plus a matching remote client.

pub mod client;
pub mod config;
pub mod hub;
pub mod rpc;
pub mod server;
pub mod websocket;
pub mod wire;

pub use client::{ClientError, RemoteBoard};
pub use config::{load_config, ConfigError, ServerConfig};
pub use hub::{BoardSummary, EngineFactory, SessionHub};
pub use server::{build_router, role_query_resolver, start, AppState, ServerError, ServerHandle};
pub use websocket::transport::WsTransport;
