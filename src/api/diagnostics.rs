use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use super::{error, AppState, ErrorResponse};
use crate::models::{DiagnosticsReport, RouteDiagnostics};

/// Full pipeline diagnostics: route resolution, geometry sources, match
/// counters, and broadcast health. Served even before initialization so the
/// pipeline can be inspected while it is still warming up.
#[utoipa::path(
    get,
    path = "/api/diagnostics",
    responses((status = 200, description = "Pipeline diagnostics", body = DiagnosticsReport)),
    tag = "diagnostics"
)]
pub async fn get_diagnostics(State(state): State<AppState>) -> Json<DiagnosticsReport> {
    let atlas = state.atlas.read().await.clone();
    let stats = state.stats.read().await.clone();
    let total_vehicles = state.states.read().await.vehicles.len();

    Json(DiagnosticsReport {
        atlas_generation: atlas.generation,
        atlas_built_at: atlas.built_at,
        total_stops_in_catalog: atlas.stops.len(),
        total_routes: atlas.routes.len(),
        total_vehicles,
        vehicles_matched: stats.vehicles_matched,
        vehicles_unmatched: stats.vehicles_unmatched,
        vehicles_by_route: stats.vehicles_by_route,
        subscribers: state.broadcaster.subscriber_count(),
        lossy_subscribers: state.broadcaster.lossy_count(),
        routes: atlas.route_diagnostics(),
    })
}

/// Diagnostics for a single route
#[utoipa::path(
    get,
    path = "/api/diagnostics/routes/{route_id}",
    params(("route_id" = i64, Path, description = "Route ID")),
    responses(
        (status = 200, description = "Route diagnostics", body = RouteDiagnostics),
        (status = 404, description = "Route not found", body = ErrorResponse)
    ),
    tag = "diagnostics"
)]
pub async fn get_route_diagnostics(
    State(state): State<AppState>,
    Path(route_id): Path<i64>,
) -> Result<Json<RouteDiagnostics>, (StatusCode, Json<ErrorResponse>)> {
    let atlas = state.atlas.read().await.clone();
    atlas
        .routes
        .get(&route_id)
        .map(|route| Json(route.diagnostics.clone()))
        .ok_or_else(|| error::not_found("route"))
}
