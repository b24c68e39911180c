use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
};
use std::net::SocketAddr;

use crate::state::AppState;
use crate::ws::{actor, MAX_FRAME_SIZE};

/// GET /ws
/// WebSocket upgrade endpoint. No authentication: every successful upgrade
/// becomes a connection tracked by the Hub.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(addr = %addr, "WebSocket upgrade requested");
    let AppState { hub, actors } = state;

    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_failed_upgrade(move |e| {
            tracing::warn!(addr = %addr, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| actor::run_connection(socket, hub, addr, actors))
}
