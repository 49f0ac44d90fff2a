//! Client for the public OSRM routing service, used to obtain a
//! street-following polyline through a route's stop sequence.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum OsrmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("router returned HTTP {0}")]
    Status(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("router found no route (code {0:?})")]
    NoRoute(String),
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
}

/// GeoJSON LineString; coordinates are [lon, lat]
#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    #[serde(default)]
    coordinates: Vec<[f64; 2]>,
}

pub struct OsrmClient {
    client: Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(config: &Config) -> Result<Self, OsrmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OsrmError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.osrm_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Request a road-following polyline through the given [lat, lon]
    /// waypoints. Returns the line in [lat, lon] order.
    pub async fn route_polyline(&self, waypoints: &[[f64; 2]]) -> Result<Vec<[f64; 2]>, OsrmError> {
        if waypoints.len() < 2 {
            return Err(OsrmError::NoRoute("fewer than two waypoints".to_string()));
        }

        let coords = waypoints
            .iter()
            .map(|p| format!("{:.6},{:.6}", p[1], p[0]))
            .collect::<Vec<_>>()
            .join(";");
        let url = format!(
            "{}/route/v1/driving/{}?overview=full&geometries=geojson",
            self.base_url, coords
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OsrmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OsrmError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| OsrmError::Network(e.to_string()))?;

        decode_polyline(&body)
    }
}

fn decode_polyline(body: &str) -> Result<Vec<[f64; 2]>, OsrmError> {
    let parsed: OsrmResponse =
        serde_json::from_str(body).map_err(|e| OsrmError::Parse(e.to_string()))?;

    if parsed.code != "Ok" {
        return Err(OsrmError::NoRoute(parsed.code));
    }

    let line: Vec<[f64; 2]> = parsed
        .routes
        .into_iter()
        .next()
        .map(|r| {
            r.geometry
                .coordinates
                .into_iter()
                .map(|c| [c[1], c[0]])
                .collect()
        })
        .unwrap_or_default();

    if line.len() < 2 {
        return Err(OsrmError::NoRoute("empty geometry".to_string()));
    }
    Ok(line)
}
