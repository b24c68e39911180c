//! Serving the router until a shutdown signal, then draining.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::hub::HubHandle;
use crate::routes;
use crate::state::AppState;
use crate::ws::{self, WRITE_WAIT};

/// How long live connections get to finish on their own after a shutdown
/// signal before their links are force-closed.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Serve `/ws`, `/trigger` and `/health` on `listener` until `signal`
/// resolves.
///
/// Shutdown stops accepting connections, waits up to `drain` for live ones to
/// finish, force-closes the rest, and returns once every connection task has
/// flushed its close frame (bounded by the write deadline).
pub async fn run<F>(
    listener: TcpListener,
    hub: HubHandle,
    signal: F,
    drain: Duration,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let (guard, actors) = ws::actor_tracker();
    let app = routes::build_router(AppState::new(hub.clone(), guard));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = stop_rx.await;
        })
        .await
    });

    signal.await;
    tracing::info!("Shutting down server...");

    // Stop accepting new connections, then let live ones drain
    let _ = stop_tx.send(());
    match hub.drain(drain).await {
        Ok(0) => {}
        Ok(closed) => tracing::info!(closed = closed, "Force-closed lingering connections"),
        Err(e) => tracing::warn!(error = %e, "Hub stopped before drain completed"),
    }

    let served = match tokio::time::timeout(drain, &mut server).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Server task failed");
            Ok(())
        }
        Err(_) => {
            tracing::warn!("Timed out waiting for in-flight requests");
            server.abort();
            Ok(())
        }
    };

    // Outbound loops still have close frames to write
    if tokio::time::timeout(WRITE_WAIT, actors.wait()).await.is_err() {
        tracing::warn!("Connection tasks still running after write deadline");
    } else {
        tracing::info!("Server gracefully stopped");
    }

    served
}
