use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub mod handler;

pub use handler::WebSocketHandler;

use crate::connection::ConnectionManager;
use crate::runtime::ComponentRuntime;

/// Axum state wrapper for RLC
#[derive(Clone)]
pub struct RlcState {
    runtime: Arc<ComponentRuntime>,
}

impl RlcState {
    /// Create a new RLC state
    pub fn new(runtime: Arc<ComponentRuntime>) -> Self {
        Self { runtime }
    }

    /// Get the component runtime
    pub fn runtime(&self) -> &Arc<ComponentRuntime> {
        &self.runtime
    }

    /// Get the connection manager
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.runtime.connections()
    }
}

/// Query parameters accepted on the WebSocket endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Pool to place the connection in
    pub pool: Option<String>,
}

/// Create a router with the RLC WebSocket endpoint at `/rlc`
///
/// Starts the runtime's background tasks: the lifecycle forwarder, the
/// suspended-instance sweep and the heartbeat monitor.
pub fn router_with_rlc(runtime: Arc<ComponentRuntime>) -> Router<RlcState> {
    router_with_rlc_state(RlcState::new(runtime))
}

/// Create a router with the RLC WebSocket endpoint using an existing RlcState
///
/// Useful when the same state also backs other routes of the application.
pub fn router_with_rlc_state(rlc_state: RlcState) -> Router<RlcState> {
    rlc_state.runtime.start();

    Router::new()
        .route("/rlc", get(websocket_handler))
        .with_state(rlc_state)
}

/// WebSocket handler endpoint
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<RlcState>,
) -> Response {
    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state, params.pool).handle())
}
