pub mod vehicle;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use vehicle::{NextStop, StopArrival, StopArrivals, StopRef, VehicleFrame, VehicleState};

/// A stop from the points catalog.
///
/// Two catalog entries frequently share a display name but carry different
/// IDs and opposite direction labels (one per travel direction).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Stop {
    pub id: i64,
    /// Display name; may be empty for service-only points
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Free-text direction label, e.g. "на Пионерскую"
    pub direction: String,
    /// Liveness flag from the upstream STATUS field
    #[serde(skip)]
    pub active: bool,
}

/// Route summary returned by `GET /api/routes`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteSummary {
    pub id: i64,
    /// Human route number, e.g. "1" or "15К"
    pub number: String,
    pub name: String,
    pub color: String,
    /// Named stops served by this route, both directions
    pub stop_ids: Vec<i64>,
    /// Forward-direction polyline as [lat, lon] pairs
    pub geometry: Vec<[f64; 2]>,
}

/// One stop on a route with its position along the direction geometry
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteStopDetail {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// 0 = forward, 1 = reverse
    pub direction: usize,
    /// Meters from the start of the direction geometry
    pub distance_along_m: f64,
}

/// Route detail returned by `GET /api/routes/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteDetail {
    pub id: i64,
    pub number: String,
    pub name: String,
    pub color: String,
    pub stops: Vec<RouteStopDetail>,
    pub geometry: Vec<[f64; 2]>,
}

/// Per-route resolution and geometry diagnostics, fixed at atlas build time
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteDiagnostics {
    pub route_id: i64,
    pub route_number: String,
    /// Total path entries across both directions before resolution
    pub path_stop_count: usize,
    pub resolved_count: usize,
    /// Resolved stops with an empty name or inactive status; kept in the
    /// geometry sequence but excluded from stop detection
    pub unnamed_count: usize,
    /// Path stop IDs absent from the points catalog
    pub unresolved_ids: Vec<i64>,
    /// Stops whose projected distance_along breaks path order
    pub out_of_order_stops: usize,
    pub has_osrm_geometry: bool,
    /// How the reverse direction geometry was obtained
    pub reverse_geometry: String,
    pub geometry_points: usize,
    pub route_length_m: f64,
}

/// Full pipeline diagnostics returned by `GET /api/diagnostics`
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DiagnosticsReport {
    pub atlas_generation: u64,
    pub atlas_built_at: Option<DateTime<Utc>>,
    pub total_stops_in_catalog: usize,
    pub total_routes: usize,
    pub total_vehicles: usize,
    pub vehicles_matched: usize,
    pub vehicles_unmatched: usize,
    pub vehicles_by_route: BTreeMap<String, usize>,
    pub subscribers: usize,
    pub lossy_subscribers: usize,
    pub routes: Vec<RouteDiagnostics>,
}
