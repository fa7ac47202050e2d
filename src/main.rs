//! # boardsync
//!
//! Board server binary: loads config, installs telemetry, hosts boards over
//! WebSocket until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use boardsync_core::{Permissions, SequentialAllocator};
use boardsync_grid::GridEngine;
use boardsync_server::{load_config, role_query_resolver, AppState, ServerConfig, SessionHub};
use boardsync_telemetry::{init_telemetry, parse_level, LogFormat, TelemetryConfig};
use clap::{Parser, ValueEnum};

/// Shared board server.
#[derive(Parser, Debug)]
#[command(name = "boardsync", about = "Shared board server")]
struct Cli {
    /// JSON config file, deep-merged over the defaults.
    #[arg(long, env = "BOARDSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind (overrides the config file).
    #[arg(long, env = "BOARDSYNC_HOST")]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides the config file).
    #[arg(long, env = "BOARDSYNC_PORT")]
    port: Option<u16>,

    /// Default log level. RUST_LOG takes precedence.
    #[arg(long, env = "BOARDSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = Format::Json)]
    log_format: Format,

    /// Permissions for sockets that don't pass a known `role`.
    #[arg(long, default_value = "observer")]
    default_role: String,

    /// Boards to create at startup.
    #[arg(long, default_value_t = 1)]
    boards: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Pretty,
}

impl From<Format> for LogFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Json => Self::Json,
            Format::Pretty => Self::Pretty,
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_level: parse_level(&cli.log_level)?,
        format: cli.log_format.into(),
        ..TelemetryConfig::default()
    };
    init_telemetry(&telemetry)?;

    let config = resolve_config(&cli)?;
    let default_role = Permissions::preset(&cli.default_role)
        .with_context(|| format!("Unknown role: {}", cli.default_role))?;

    let hub = Arc::new(SessionHub::new(
        Arc::new(SequentialAllocator::new()),
        Arc::new(GridEngine::boxed),
    ));
    for _ in 0..cli.boards {
        let _ = hub.create();
    }

    let state = AppState::new(hub, config, role_query_resolver(default_role));
    let handle = boardsync_server::start(state)
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr(), "boardsync ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
