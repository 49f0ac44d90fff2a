use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::IntoParams;

use super::{error, AppState, ErrorResponse};
use crate::models::VehicleState;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VehiclesQuery {
    /// Filter by route number string, e.g. "1" or "15К"
    pub route: Option<String>,
}

/// All currently tracked vehicles
#[utoipa::path(
    get,
    path = "/api/vehicles",
    params(VehiclesQuery),
    responses(
        (status = 200, description = "Current vehicle states", body = Vec<VehicleState>),
        (status = 503, description = "Neither atlas nor state initialized", body = ErrorResponse)
    ),
    tag = "vehicles"
)]
pub async fn list_vehicles(
    State(state): State<AppState>,
    Query(query): Query<VehiclesQuery>,
) -> Result<Json<Vec<VehicleState>>, (StatusCode, Json<ErrorResponse>)> {
    if !state.is_ready().await {
        return Err(error::service_unavailable());
    }

    let table = state.states.read().await;
    let mut vehicles: Vec<VehicleState> = table
        .vehicles
        .values()
        .filter(|v| query.route.as_deref().map_or(true, |r| v.route == r))
        .cloned()
        .collect();
    vehicles.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(Json(vehicles))
}

/// One vehicle by device ID
#[utoipa::path(
    get,
    path = "/api/vehicles/{vehicle_id}",
    params(("vehicle_id" = String, Path, description = "Device ID")),
    responses(
        (status = 200, description = "Vehicle state", body = VehicleState),
        (status = 404, description = "Vehicle not found", body = ErrorResponse),
        (status = 503, description = "Neither atlas nor state initialized", body = ErrorResponse)
    ),
    tag = "vehicles"
)]
pub async fn get_vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<VehicleState>, (StatusCode, Json<ErrorResponse>)> {
    if !state.is_ready().await {
        return Err(error::service_unavailable());
    }

    let table = state.states.read().await;
    table
        .vehicles
        .get(&vehicle_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| error::not_found("vehicle"))
}
