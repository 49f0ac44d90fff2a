use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Stop reference embedded in a vehicle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StopRef {
    pub id: i64,
    pub name: String,
}

/// An upcoming stop with its linear time estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NextStop {
    pub id: i64,
    pub name: String,
    /// None when the estimate exceeds the one-hour horizon
    pub eta_seconds: Option<i64>,
}

/// Enriched state of a single tram, as published over REST and WebSocket.
///
/// The serialized shape is part of the wire contract; fields marked
/// `serde(skip)` are pipeline-internal and never leave the process.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VehicleState {
    /// Device ID from the on-board unit
    pub id: String,
    pub board_num: String,
    /// Route number string as reported by the vehicle
    pub route: String,
    /// Resolved route ID; None when no route matched within threshold
    pub route_id: Option<i64>,
    /// Snapped onto the route polyline when matched, raw otherwise
    pub lat: f64,
    pub lon: f64,
    /// km/h
    pub speed: f64,
    /// Degrees, 0 = north, clockwise
    pub course: f64,
    pub prev_stop: Option<StopRef>,
    /// Up to 5 upcoming stops in travel order
    pub next_stops: Vec<NextStop>,
    /// Fractional position along the matched direction geometry
    pub progress: Option<f64>,
    /// Source timestamp (UTC); None when the source value was unparseable
    pub timestamp: Option<DateTime<Utc>>,
    /// True when the source timestamp is older than the staleness threshold
    pub signal_lost: bool,

    /// 0 = forward, 1 = reverse
    #[serde(skip)]
    pub direction: Option<usize>,
    /// Meters along the matched direction geometry
    #[serde(skip)]
    pub distance_along_m: Option<f64>,
    /// Raw GPS fix, retained for great-circle fallback estimates
    #[serde(skip)]
    pub raw_lat: f64,
    #[serde(skip)]
    pub raw_lon: f64,
}

/// Server frame sent to `/ws/vehicles` subscribers
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum VehicleFrame {
    /// Full state table, sent once right after subscription
    Snapshot { vehicles: Vec<VehicleState> },
    /// Vehicles observed in the most recent tick
    Update { vehicles: Vec<VehicleState> },
}

/// One vehicle approaching a stop
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopArrival {
    pub vehicle_id: String,
    pub board_num: String,
    pub route: String,
    pub route_id: Option<i64>,
    pub eta_seconds: Option<i64>,
}

/// Response of `GET /api/stops/{id}/arrivals`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopArrivals {
    pub stop_id: i64,
    pub stop_name: String,
    pub arrivals: Vec<StopArrival>,
}
