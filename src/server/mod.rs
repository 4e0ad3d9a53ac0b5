//! Coordination server: WebSocket push channel plus the HTTP API.
//!
//! Both listeners share one [`ServerState`]: the database, the connection
//! registry, the signaling relay and the request fan-out.

pub mod auth;
pub mod http;
pub mod parse;
pub mod websocket;

use crate::core::fanout::RequestFanout;
use crate::core::registry::Registry;
use crate::core::signaling::SignalingRelay;
use crate::core::store::{self, stations, Db};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use auth::TokenTable;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Everything `run` needs, resolved from CLI and config file.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ws_addr: String,
    pub http_addr: String,
    /// `None` keeps all state in memory.
    pub database: Option<PathBuf>,
    pub tokens: TokenTable,
}

pub struct ServerState {
    pub db: Db,
    pub registry: Arc<Registry>,
    pub relay: Arc<SignalingRelay>,
    pub fanout: RequestFanout,
    pub tokens: TokenTable,
    pub http: reqwest::Client,
}

impl ServerState {
    pub fn new(db: Db, tokens: TokenTable) -> Arc<Self> {
        let registry = Arc::new(Registry::new(db.clone()));
        let relay = Arc::new(SignalingRelay::new(db.clone(), registry.clone()));
        let fanout = RequestFanout::new(db.clone(), registry.clone(), relay.clone());
        Arc::new(Self {
            db,
            registry,
            relay,
            fanout,
            tokens,
            http: reqwest::Client::new(),
        })
    }
}

/// Bind both listeners and serve until `sos` fires.
pub async fn run(config: ServerConfig, sos: SignalOfStop) -> Result<()> {
    let db = match &config.database {
        Some(path) => store::open(path)?,
        None => store::open_in_memory()?,
    };
    {
        let conn = store::lock(&db);
        let reset = stations::mark_all_disconnected(&conn)?;
        if reset > 0 {
            info!(event = "stations_reset", count = reset, "Marked stale stations disconnected");
        }
    }
    if config.tokens.is_empty() {
        warn!(event = "no_tokens", "Token table is empty, every peer will be rejected");
    }

    let state = ServerState::new(db, config.tokens);

    let ws_listener = TcpListener::bind(&config.ws_addr)
        .await
        .with_context(|| format!("binding WebSocket listener on {}", config.ws_addr))?;
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http_addr))?;

    info!(
        event = "server_started",
        ws = %config.ws_addr,
        http = %config.http_addr,
        persistent = config.database.is_some(),
        tokens = state.tokens.len(),
        "Coordination server listening"
    );

    tokio::select! {
        _ = websocket::serve(ws_listener, state.clone()) => {}
        _ = http::serve(http_listener, state.clone()) => {}
        _ = sos.wait() => {
            info!(event = "server_shutdown", "Shutdown requested");
        }
    }
    Ok(())
}
