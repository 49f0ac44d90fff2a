use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::IntoParams;

use super::{error, AppState, ErrorResponse};
use crate::models::{Stop, StopArrivals};
use crate::services::arrivals;

/// List all named, active stops
#[utoipa::path(
    get,
    path = "/api/stops",
    responses(
        (status = 200, description = "Stop catalog", body = Vec<Stop>),
        (status = 503, description = "Neither atlas nor state initialized", body = ErrorResponse)
    ),
    tag = "stops"
)]
pub async fn list_stops(
    State(state): State<AppState>,
) -> Result<Json<Vec<Stop>>, (StatusCode, Json<ErrorResponse>)> {
    if !state.is_ready().await {
        return Err(error::service_unavailable());
    }
    let atlas = state.atlas.read().await.clone();

    let mut stops: Vec<Stop> = atlas
        .stops
        .values()
        .filter(|s| !s.name.is_empty() && s.active)
        .cloned()
        .collect();
    stops.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    Ok(Json(stops))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ArrivalsQuery {
    /// Restrict arrivals to a single route ID
    pub route: Option<i64>,
}

/// Upcoming tram arrivals at a stop
#[utoipa::path(
    get,
    path = "/api/stops/{stop_id}/arrivals",
    params(("stop_id" = i64, Path, description = "Stop ID"), ArrivalsQuery),
    responses(
        (status = 200, description = "Vehicles approaching the stop", body = StopArrivals),
        (status = 404, description = "Stop not found", body = ErrorResponse),
        (status = 503, description = "Neither atlas nor state initialized", body = ErrorResponse)
    ),
    tag = "stops"
)]
pub async fn get_arrivals(
    State(state): State<AppState>,
    Path(stop_id): Path<i64>,
    Query(query): Query<ArrivalsQuery>,
) -> Result<Json<StopArrivals>, (StatusCode, Json<ErrorResponse>)> {
    if !state.is_ready().await {
        return Err(error::service_unavailable());
    }
    let atlas = state.atlas.read().await.clone();

    let Some(stop) = atlas.stops.get(&stop_id) else {
        return Err(error::not_found("stop"));
    };

    let table = state.states.read().await;
    let arrivals = arrivals::arrivals_for_stop(&atlas, &table.vehicles, stop_id, query.route);

    Ok(Json(StopArrivals {
        stop_id,
        stop_name: stop.name.clone(),
        arrivals,
    }))
}
