use axum::{routing, Router};

use crate::state::AppState;
use crate::trigger;
use crate::ws::handler as ws_handler;

/// Build the axum Router serving both endpoints on one listener.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// WebSocket handler reads the peer address.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (subscribe / unsubscribe / message / ping)
    let ws_routes = Router::new().route("/ws", routing::get(ws_handler::ws_upgrade));

    // Publish endpoint; any method other than POST gets 405
    let trigger_routes = Router::new().route("/trigger", routing::post(trigger::trigger));

    // Health check
    let health = Router::new().route("/health", routing::get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(trigger_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
