//! Client for the ETTU (Gortrans) API at map.ettu.ru.
//!
//! The upstream payloads are loosely typed: field names come in upper- and
//! lower-case spellings, scalars arrive as numbers or strings, and list
//! payloads are sometimes wrapped in a keyed object. Parsing accepts all
//! observed shapes and skips individual malformed records instead of
//! failing the whole fetch.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Yekaterinburg;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::Stop;

const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF_SECS: [u64; 3] = [2, 4, 8];

#[derive(Debug, Error)]
pub enum EttuError {
    #[error("network error: {0}")]
    Network(String),
    #[error("source API returned HTTP {0}")]
    Status(u16),
    #[error("parse error: {0}")]
    Parse(String),
}

impl EttuError {
    /// Transient failures are retried; 4xx and parse errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            EttuError::Network(_) => true,
            EttuError::Status(code) => *code >= 500,
            EttuError::Parse(_) => false,
        }
    }
}

/// A vehicle position as reported by the source, after ingest filtering
#[derive(Debug, Clone)]
pub struct RawVehicle {
    pub dev_id: String,
    pub board_num: String,
    pub route_num: String,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub course_deg: f64,
    /// Parsed source timestamp; None when absent or unparseable
    pub timestamp: Option<DateTime<Utc>>,
}

/// A route with its per-direction ordered stop ID paths
#[derive(Debug, Clone)]
pub struct RawRoute {
    pub id: i64,
    pub number: String,
    pub name: String,
    /// All stops per direction (forward = 0, reverse = 1), for tracking
    /// and stop detection
    pub directions: [Vec<i64>; 2],
    /// Major stops per direction, for clean router waypoints
    pub geometry_directions: [Vec<i64>; 2],
}

/// Polls the ETTU API for tram positions, routes, and stop points
pub struct EttuClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl EttuClient {
    pub fn new(config: &Config) -> Result<Self, EttuError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EttuError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.ettu_base_url.trim_end_matches('/').to_string(),
            api_key: config.ettu_api_key.clone(),
        })
    }

    /// Fetch all current tram positions.
    pub async fn fetch_vehicles(&self) -> Result<Vec<RawVehicle>, EttuError> {
        let payload = self.get_json("/api/v2/tram/boards/", "vehicles").await?;
        let vehicles = parse_vehicles(&payload);
        info!(count = vehicles.len(), "fetched active trams");
        Ok(vehicles)
    }

    /// Fetch tram routes with their per-direction stop paths.
    pub async fn fetch_routes(&self) -> Result<Vec<RawRoute>, EttuError> {
        let payload = self.get_json("/api/v2/tram/routes/", "routes").await?;
        let routes = parse_routes(&payload);
        info!(count = routes.len(), "fetched tram routes");
        Ok(routes)
    }

    /// Fetch the stop points catalog.
    pub async fn fetch_points(&self) -> Result<Vec<Stop>, EttuError> {
        let payload = self.get_json("/api/v2/tram/points/", "points").await?;
        let stops = parse_points(&payload);
        info!(count = stops.len(), "fetched tram stops");
        Ok(stops)
    }

    /// GET with retry: up to 3 retries with 2/4/8 s backoff on transient
    /// failures, immediate error on 4xx or malformed JSON.
    async fn get_json(&self, path: &str, label: &str) -> Result<serde_json::Value, EttuError> {
        let url = format!(
            "{}{}?apiKey={}",
            self.base_url,
            path,
            urlencoding::encode(&self.api_key)
        );

        let mut attempt = 0;
        loop {
            match self.try_get(&url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let wait = RETRY_BACKOFF_SECS[attempt];
                    attempt += 1;
                    warn!(
                        label,
                        attempt,
                        max = MAX_RETRIES,
                        wait_secs = wait,
                        error = %e,
                        "source request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                Err(e) => {
                    error!(label, error = %e, "source request failed");
                    return Err(e);
                }
            }
        }
    }

    async fn try_get(&self, url: &str) -> Result<serde_json::Value, EttuError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| EttuError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EttuError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EttuError::Network(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| EttuError::Parse(e.to_string()))
    }
}

/// A scalar the source serializes as either a number or a string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Flexible {
    Num(f64),
    Text(String),
}

impl Flexible {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Flexible::Num(n) => Some(*n),
            Flexible::Text(s) => s.trim().parse().ok(),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|n| n as i64)
    }

    fn into_string(self) -> String {
        match self {
            Flexible::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", n as i64)
                } else {
                    n.to_string()
                }
            }
            Flexible::Text(s) => s.trim().to_string(),
        }
    }
}

fn opt_f64(value: &Option<Flexible>) -> f64 {
    value.as_ref().and_then(Flexible::as_f64).unwrap_or(0.0)
}

fn opt_string(value: Option<Flexible>) -> String {
    value.map(Flexible::into_string).unwrap_or_default()
}

/// ETTU timestamps like "2026-02-13 16:30:42" are Yekaterinburg local time.
fn parse_atime(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    Yekaterinburg
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Lift the record list out of a payload that is either a bare array or an
/// object keyed by one of `keys`.
fn extract_items<'a>(
    payload: &'a serde_json::Value,
    keys: &[&str],
) -> Option<&'a Vec<serde_json::Value>> {
    if let Some(list) = payload.as_array() {
        return Some(list);
    }
    keys.iter().find_map(|k| payload.get(*k)?.as_array())
}

#[derive(Debug, Deserialize)]
struct BoardRecord {
    #[serde(alias = "DEV_ID")]
    id: Flexible,
    #[serde(default, alias = "BOARD_NUM", alias = "gos_num")]
    board_num: Option<Flexible>,
    #[serde(default, alias = "ROUTE", alias = "marsh")]
    route: Option<Flexible>,
    #[serde(default, alias = "LAT")]
    lat: Option<Flexible>,
    #[serde(default, alias = "LON", alias = "lng")]
    lon: Option<Flexible>,
    #[serde(default, alias = "VELOCITY", alias = "SPEED")]
    speed: Option<Flexible>,
    #[serde(default, alias = "COURSE", alias = "dir")]
    course: Option<Flexible>,
    #[serde(default, alias = "ATIME")]
    timestamp: Option<Flexible>,
}

fn parse_vehicles(payload: &serde_json::Value) -> Vec<RawVehicle> {
    let Some(items) = extract_items(payload, &["vehicles", "boards"]) else {
        warn!("boards payload had no recognizable list");
        return Vec::new();
    };

    let mut vehicles = Vec::with_capacity(items.len());
    for item in items {
        let record: BoardRecord = match serde_json::from_value(item.clone()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "skipping malformed vehicle record");
                continue;
            }
        };

        let lat = opt_f64(&record.lat);
        let lon = opt_f64(&record.lon);
        let route_num = opt_string(record.route);
        // Keep only trams with valid coordinates and an assigned route
        if lat == 0.0 || lon == 0.0 || route_num.is_empty() {
            continue;
        }

        let timestamp = record
            .timestamp
            .map(Flexible::into_string)
            .as_deref()
            .and_then(parse_atime);

        vehicles.push(RawVehicle {
            dev_id: record.id.into_string(),
            board_num: opt_string(record.board_num),
            route_num,
            lat,
            lon,
            speed_kmh: opt_f64(&record.speed),
            course_deg: opt_f64(&record.course),
            timestamp,
        });
    }
    vehicles
}

/// A path entry is a bare stop ID, a stringified ID, or an object carrying one
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PathEntry {
    Id(i64),
    Text(String),
    Object {
        #[serde(alias = "ID")]
        id: Flexible,
    },
}

impl PathEntry {
    fn stop_id(&self) -> Option<i64> {
        match self {
            PathEntry::Id(id) => Some(*id),
            PathEntry::Text(s) => s.trim().parse().ok(),
            PathEntry::Object { id } => id.as_i64(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RouteElement {
    #[serde(default)]
    direction: Option<Flexible>,
    /// Major stops only
    #[serde(default)]
    path: Vec<PathEntry>,
    /// Superset of `path` including minor stops
    #[serde(default)]
    full_path: Vec<PathEntry>,
}

impl RouteElement {
    /// All stops, for tracking and stop detection
    fn stop_ids(&self) -> Vec<i64> {
        let entries = if self.full_path.is_empty() {
            &self.path
        } else {
            &self.full_path
        };
        entries.iter().filter_map(PathEntry::stop_id).collect()
    }

    /// Major stops only, for router waypoints
    fn geometry_stop_ids(&self) -> Vec<i64> {
        let entries = if self.path.is_empty() {
            &self.full_path
        } else {
            &self.path
        };
        entries.iter().filter_map(PathEntry::stop_id).collect()
    }
}

#[derive(Debug, Deserialize)]
struct RouteRecord {
    #[serde(alias = "ID")]
    id: Flexible,
    #[serde(default, alias = "num", alias = "NUM")]
    number: Option<Flexible>,
    #[serde(default, alias = "NAME", alias = "title")]
    name: Option<Flexible>,
    #[serde(default)]
    elements: Vec<RouteElement>,
}

fn parse_routes(payload: &serde_json::Value) -> Vec<RawRoute> {
    let Some(items) = extract_items(payload, &["routes"]) else {
        warn!("routes payload had no recognizable list");
        return Vec::new();
    };

    let mut routes = Vec::with_capacity(items.len());
    for item in items {
        let record: RouteRecord = match serde_json::from_value(item.clone()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "skipping malformed route record");
                continue;
            }
        };

        let Some(id) = record.id.as_i64().filter(|&id| id != 0) else {
            continue;
        };

        let mut directions: [Vec<i64>; 2] = [Vec::new(), Vec::new()];
        let mut geometry_directions: [Vec<i64>; 2] = [Vec::new(), Vec::new()];
        for (index, element) in record.elements.iter().enumerate() {
            // The element's own direction field when it is a clean 0/1,
            // otherwise element position (upstream "ind" values are opaque)
            let direction = element
                .direction
                .as_ref()
                .and_then(Flexible::as_i64)
                .filter(|d| *d == 0 || *d == 1)
                .unwrap_or(index as i64);
            if direction > 1 {
                continue;
            }
            directions[direction as usize].extend(element.stop_ids());
            geometry_directions[direction as usize].extend(element.geometry_stop_ids());
        }

        let number = opt_string(record.number);
        if directions.iter().all(Vec::is_empty) {
            warn!(route = %number, id, "route has no stop path in either direction");
        }

        routes.push(RawRoute {
            id,
            number,
            name: opt_string(record.name),
            directions,
            geometry_directions,
        });
    }
    routes
}

#[derive(Debug, Deserialize)]
struct PointRecord {
    #[serde(alias = "ID")]
    id: Flexible,
    #[serde(default, alias = "NAME")]
    name: Option<Flexible>,
    #[serde(default, alias = "LAT")]
    lat: Option<Flexible>,
    #[serde(default, alias = "LON", alias = "lng")]
    lon: Option<Flexible>,
    #[serde(default, alias = "STATUS")]
    status: Option<Flexible>,
    #[serde(default, alias = "DIRECTION")]
    direction: Option<Flexible>,
}

fn parse_points(payload: &serde_json::Value) -> Vec<Stop> {
    let Some(items) = extract_items(payload, &["points", "stops", "stations"]) else {
        warn!("points payload had no recognizable list");
        return Vec::new();
    };

    let mut stops = Vec::with_capacity(items.len());
    for item in items {
        let record: PointRecord = match serde_json::from_value(item.clone()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "skipping malformed point record");
                continue;
            }
        };

        let Some(id) = record.id.as_i64().filter(|&id| id != 0) else {
            continue;
        };
        let lat = opt_f64(&record.lat);
        let lon = opt_f64(&record.lon);
        if lat == 0.0 || lon == 0.0 {
            continue;
        }

        let active = record
            .status
            .as_ref()
            .and_then(Flexible::as_i64)
            .map_or(true, |s| s != 0);

        stops.push(Stop {
            id,
            name: opt_string(record.name),
            lat,
            lon,
            direction: opt_string(record.direction),
            active,
        });
    }
    stops
}
