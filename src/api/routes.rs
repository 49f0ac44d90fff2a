use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use super::{error, AppState, ErrorResponse};
use crate::models::{RouteDetail, RouteStopDetail, RouteSummary};
use crate::services::atlas::ROUTE_COLOR;

/// List all routes with their stop IDs and forward geometry
#[utoipa::path(
    get,
    path = "/api/routes",
    responses(
        (status = 200, description = "All known routes", body = Vec<RouteSummary>),
        (status = 503, description = "Neither atlas nor state initialized", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn list_routes(
    State(state): State<AppState>,
) -> Result<Json<Vec<RouteSummary>>, (StatusCode, Json<ErrorResponse>)> {
    if !state.is_ready().await {
        return Err(error::service_unavailable());
    }
    let atlas = state.atlas.read().await.clone();

    let mut routes: Vec<RouteSummary> = atlas
        .routes
        .values()
        .map(|route| RouteSummary {
            id: route.id,
            number: route.number.clone(),
            name: route.name.clone(),
            color: ROUTE_COLOR.to_string(),
            stop_ids: route.stop_ids.clone(),
            geometry: route.directions[0].polyline.clone(),
        })
        .collect();
    routes.sort_by(|a, b| a.number.cmp(&b.number).then(a.id.cmp(&b.id)));

    Ok(Json(routes))
}

/// One route with full stop details for both directions
#[utoipa::path(
    get,
    path = "/api/routes/{route_id}",
    params(("route_id" = i64, Path, description = "Route ID")),
    responses(
        (status = 200, description = "Route detail", body = RouteDetail),
        (status = 404, description = "Route not found", body = ErrorResponse),
        (status = 503, description = "Neither atlas nor state initialized", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn get_route(
    State(state): State<AppState>,
    Path(route_id): Path<i64>,
) -> Result<Json<RouteDetail>, (StatusCode, Json<ErrorResponse>)> {
    if !state.is_ready().await {
        return Err(error::service_unavailable());
    }
    let atlas = state.atlas.read().await.clone();

    let Some(route) = atlas.routes.get(&route_id) else {
        return Err(error::not_found("route"));
    };

    let mut stops = Vec::new();
    for (direction, path) in route.directions.iter().enumerate() {
        for stop in &path.stops {
            stops.push(RouteStopDetail {
                id: stop.id,
                name: stop.name.clone(),
                lat: stop.lat,
                lon: stop.lon,
                direction,
                distance_along_m: stop.distance_along_m,
            });
        }
    }

    Ok(Json(RouteDetail {
        id: route.id,
        number: route.number.clone(),
        name: route.name.clone(),
        color: ROUTE_COLOR.to_string(),
        stops,
        geometry: route.directions[0].polyline.clone(),
    }))
}
