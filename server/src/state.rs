use crate::hub::HubHandle;
use crate::ws::ActorGuard;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Entry point into the Hub's event queues
    pub hub: HubHandle,
    /// Cloned into every upgraded connection so shutdown can wait for them
    pub actors: ActorGuard,
}

impl AppState {
    pub fn new(hub: HubHandle, actors: ActorGuard) -> Self {
        Self { hub, actors }
    }
}
