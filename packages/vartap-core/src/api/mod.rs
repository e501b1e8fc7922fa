//! HTTP/WebSocket API layer.
//!
//! Thin: the router exposes the combined control/data socket at `/ws` plus a
//! small status endpoint; everything of substance delegates to the hub, the
//! inbound registry and the transport.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::hub::WatchHub;
use crate::wire::InboundRegistry;

pub mod ws;
pub mod ws_connection;

pub use ws::{OutboundMsg, WsTransport};
pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind or serve on the TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    /// The manager's non-RT half.
    pub hub: Arc<WatchHub>,
    /// Host-to-runtime stream table.
    pub inbound: Arc<InboundRegistry>,
    /// Outbound fan-out; also the [`crate::transport::Transport`] to bind
    /// into the manager.
    pub transport: Arc<WsTransport>,
    /// Connection registry gating emission.
    pub connections: Arc<WsConnectionManager>,
}

impl AppState {
    /// Wires up the connection registry and transport around a hub.
    ///
    /// Bind the returned state's `transport` into the RT half with
    /// [`crate::watcher::Watcher::bind_transport`] before starting the
    /// audio thread.
    pub fn new(hub: Arc<WatchHub>, inbound: Arc<InboundRegistry>) -> Self {
        let connections = Arc::new(WsConnectionManager::new());
        let transport = Arc::new(WsTransport::new(Arc::clone(&connections)));
        Self {
            hub,
            inbound,
            transport,
            connections,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    variables: usize,
    connections: usize,
    timestamp: u64,
    sample_rate: f32,
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let variables = state
        .hub
        .snapshot()
        .iter()
        .filter(|shared| shared.is_alive())
        .count();
    Json(StatusBody {
        variables,
        connections: state.connections.connection_count(),
        timestamp: state.hub.clock(),
        sample_rate: state.hub.sample_rate(),
    })
}

/// Builds the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Starts the HTTP server on the given port.
pub async fn start_server(state: AppState, port: u16) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("[Server] listening on http://0.0.0.0:{port}");
    let app = create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
