pub mod diagnostics;
pub mod error;
pub mod health;
pub mod routes;
pub mod stops;
pub mod vehicles;
pub mod ws;

pub use error::ErrorResponse;

use std::sync::Arc;

use utoipa::OpenApi;

use crate::sync::{AtlasHandle, Broadcaster, StateStore, TickStatsStore};

/// Shared read-side handles for all HTTP handlers. Reads never trigger
/// upstream fetches; they only look at what the background loops produced.
#[derive(Clone)]
pub struct AppState {
    pub atlas: AtlasHandle,
    pub states: StateStore,
    pub stats: TickStatsStore,
    pub broadcaster: Arc<Broadcaster>,
}

impl AppState {
    /// Serving requires either an installed atlas generation or at least
    /// one tracked vehicle; before that, read endpoints answer 503.
    pub async fn is_ready(&self) -> bool {
        if self.atlas.read().await.is_initialized() {
            return true;
        }
        !self.states.read().await.vehicles.is_empty()
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Yekaterinburg Tram Monitor",
        description = "Live tram positions enriched with route matching, stop detection, and arrival estimates"
    ),
    tags(
        (name = "routes", description = "Route atlas"),
        (name = "stops", description = "Stop catalog and arrivals"),
        (name = "vehicles", description = "Live vehicle states"),
        (name = "diagnostics", description = "Pipeline internals"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;
