use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use boardsync_core::{PermissionSource, Permissions, SessionId};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::hub::{self, BoardSummary, SessionHub};
use crate::websocket::session::run_ws_session;

/// How often lost connections are checked against their retention window.
const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub config: Arc<ServerConfig>,
    /// Applied to every socket; resolvers see the query string as metadata.
    pub permissions: PermissionSource,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(hub: Arc<SessionHub>, config: ServerConfig, permissions: PermissionSource) -> Self {
        Self {
            hub,
            config: Arc::new(config),
            permissions,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }
}

/// Map the `role` query parameter to a permission preset, falling back to
/// `default` when it is absent or unknown.
pub fn role_query_resolver(default: Permissions) -> PermissionSource {
    PermissionSource::resolver(move |ctx| {
        ctx.metadata
            .as_ref()
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            .and_then(Permissions::preset)
            .unwrap_or_else(|| default.clone())
    })
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/boards", get(list_boards).post(create_board))
        .route("/boards/{id}/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is up.
pub async fn start(state: AppState) -> Result<ServerHandle, ServerError> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let cleanup = hub::start_cleanup_task(
        state.hub.clone(),
        CLEANUP_INTERVAL,
        state.config.lost_connection_retention(),
    );

    let shutdown = state.shutdown.clone();
    let router = build_router(state);
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "board server started");

    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close every socket and wait for the listener to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.cleanup.abort();
        let _ = self.server.await;
        tracing::info!("board server stopped");
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    boards: usize,
    connections: usize,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        boards: state.hub.len(),
        connections: state.hub.connection_count(),
    })
}

/// GET /boards
async fn list_boards(State(state): State<AppState>) -> Json<Vec<BoardSummary>> {
    Json(state.hub.list())
}

/// POST /boards
async fn create_board(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let session = state.hub.create();
    (
        StatusCode::CREATED,
        Json(json!({ "id": session.id(), "snapshot": session.snapshot() })),
    )
}

/// GET /boards/{id}/ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let Some(session) = state.hub.get(&SessionId::from_raw(id.clone())) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown board: {id}") })),
        )
            .into_response();
    };
    let metadata = serde_json::to_value(query).unwrap_or(Value::Null);
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, session, metadata, state))
}
