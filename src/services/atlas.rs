//! The route atlas: route topology joined with the points catalog and
//! street-following geometry, published as immutable generations.
//!
//! A build fetches routes and points, resolves each route's stop paths,
//! obtains one OSRM polyline per route (stop-to-stop straight lines on
//! failure), and derives per-direction cumulative distance tables and stop
//! positions. The result is an immutable value; the slow loop swaps it in
//! atomically so readers always see a complete generation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{RouteDiagnostics, Stop};
use crate::providers::ettu::{EttuClient, EttuError, RawRoute};
use crate::providers::osrm::OsrmClient;
use crate::services::geo::{self, LocalFrame, Projection};

/// The upstream carries no route colors; the frontend expects one
pub const ROUTE_COLOR: &str = "#e53935";

/// Pause between consecutive router requests (public OSRM rate limit)
const OSRM_PACING_MS: u64 = 300;

#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("source fetch failed: {0}")]
    Source(#[from] EttuError),
    #[error("route {route_number} (id {route_id}) failed distance table validation: {detail}")]
    Invariant {
        route_id: i64,
        route_number: String,
        detail: String,
    },
}

/// A stop placed on a direction's geometry
#[derive(Debug, Clone)]
pub struct StopOnRoute {
    pub id: i64,
    /// Display name combining the stop name and its direction label
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Position in the resolved path sequence
    pub order: usize,
    /// Meters from the start of the direction geometry
    pub distance_along_m: f64,
}

/// One direction of a resolved route
#[derive(Debug, Clone)]
pub struct DirectionPath {
    /// Named stops sorted by `distance_along_m` (path order breaks ties)
    pub stops: Vec<StopOnRoute>,
    pub polyline: Vec<[f64; 2]>,
    pub cum: Vec<f64>,
    pub length_m: f64,
    pub frame: LocalFrame,
}

impl DirectionPath {
    fn empty() -> Self {
        Self {
            stops: Vec::new(),
            polyline: Vec::new(),
            cum: Vec::new(),
            length_m: 0.0,
            frame: LocalFrame::at_latitude(0.0),
        }
    }

    pub fn has_geometry(&self) -> bool {
        self.polyline.len() >= 2 && self.length_m > 0.0
    }

    pub fn project(&self, lat: f64, lon: f64) -> Option<Projection> {
        geo::project_point(&self.polyline, &self.cum, self.frame, lat, lon)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub id: i64,
    pub number: String,
    pub name: String,
    pub directions: [DirectionPath; 2],
    /// Named, active stops across both directions, deduplicated
    pub stop_ids: Vec<i64>,
    pub has_osrm_geometry: bool,
    pub diagnostics: RouteDiagnostics,
}

/// One immutable atlas generation
#[derive(Debug)]
pub struct RouteAtlas {
    pub generation: u64,
    pub built_at: Option<DateTime<Utc>>,
    pub routes: HashMap<i64, ResolvedRoute>,
    /// Route number string → route IDs (the matcher's candidate index)
    pub by_number: HashMap<String, Vec<i64>>,
    /// Full points catalog
    pub stops: BTreeMap<i64, Stop>,
    /// Stop ID → routes serving it
    pub stop_routes: HashMap<i64, Vec<i64>>,
}

impl RouteAtlas {
    /// Placeholder generation used before the first successful build
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: None,
            routes: HashMap::new(),
            by_number: HashMap::new(),
            stops: BTreeMap::new(),
            stop_routes: HashMap::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.generation > 0
    }

    /// Per-route diagnostics sorted by route number
    pub fn route_diagnostics(&self) -> Vec<RouteDiagnostics> {
        let mut diags: Vec<RouteDiagnostics> = self
            .routes
            .values()
            .map(|r| r.diagnostics.clone())
            .collect();
        diags.sort_by(|a, b| {
            a.route_number
                .cmp(&b.route_number)
                .then(a.route_id.cmp(&b.route_id))
        });
        diags
    }
}

/// Route geometry handed to assembly: either a router polyline or the
/// stop-to-stop fallback
pub struct RouteGeometry {
    pub points: Vec<[f64; 2]>,
    pub from_osrm: bool,
}

/// Fetch everything and assemble a new atlas generation.
pub async fn build(
    ettu: &EttuClient,
    osrm: &OsrmClient,
    generation: u64,
) -> Result<RouteAtlas, AtlasError> {
    let routes = ettu.fetch_routes().await?;
    let points = ettu.fetch_points().await?;

    let catalog: BTreeMap<i64, Stop> = points.iter().map(|s| (s.id, s.clone())).collect();

    let mut geometries: HashMap<i64, RouteGeometry> = HashMap::new();
    let mut first_request = true;
    for route in &routes {
        // Major stops only as waypoints; the full sequence would pin the
        // router to every minor stop and kink the line
        let waypoints: Vec<[f64; 2]> = route.geometry_directions[0]
            .iter()
            .filter_map(|id| catalog.get(id))
            .map(|s| [s.lat, s.lon])
            .collect();

        let geometry = if waypoints.len() < 2 {
            RouteGeometry {
                points: waypoints,
                from_osrm: false,
            }
        } else {
            if !first_request {
                tokio::time::sleep(Duration::from_millis(OSRM_PACING_MS)).await;
            }
            first_request = false;
            match osrm.route_polyline(&waypoints).await {
                Ok(line) => RouteGeometry {
                    points: line,
                    from_osrm: true,
                },
                Err(e) => {
                    warn!(
                        route = %route.number,
                        error = %e,
                        "router unavailable, using stop-to-stop geometry"
                    );
                    RouteGeometry {
                        points: waypoints,
                        from_osrm: false,
                    }
                }
            }
        };
        geometries.insert(route.id, geometry);
    }

    assemble(routes, points, geometries, generation, Utc::now())
}

/// Assemble an atlas from already-fetched parts. Fails (and the caller keeps
/// the previous generation) when any route's distance table is invalid.
pub fn assemble(
    routes: Vec<RawRoute>,
    points: Vec<Stop>,
    mut geometries: HashMap<i64, RouteGeometry>,
    generation: u64,
    built_at: DateTime<Utc>,
) -> Result<RouteAtlas, AtlasError> {
    let catalog: BTreeMap<i64, Stop> = points.into_iter().map(|s| (s.id, s)).collect();

    let mut resolved_routes = HashMap::with_capacity(routes.len());
    let mut by_number: HashMap<String, Vec<i64>> = HashMap::new();
    let mut stop_routes: HashMap<i64, Vec<i64>> = HashMap::new();

    for route in &routes {
        let geometry = geometries.remove(&route.id).unwrap_or(RouteGeometry {
            points: Vec::new(),
            from_osrm: false,
        });
        let resolved = resolve_route(route, &catalog, geometry)?;

        for stop_id in &resolved.stop_ids {
            stop_routes.entry(*stop_id).or_default().push(route.id);
        }
        by_number
            .entry(resolved.number.clone())
            .or_default()
            .push(route.id);
        resolved_routes.insert(route.id, resolved);
    }

    let with_geometry = resolved_routes
        .values()
        .filter(|r| r.directions[0].has_geometry())
        .count();
    info!(
        generation,
        routes = resolved_routes.len(),
        stops = catalog.len(),
        with_geometry,
        "route atlas assembled"
    );

    Ok(RouteAtlas {
        generation,
        built_at: Some(built_at),
        routes: resolved_routes,
        by_number,
        stops: catalog,
        stop_routes,
    })
}

/// Combine a stop name with its direction label, e.g. "1-й км (на Пионерскую)"
fn display_name(stop: &Stop) -> String {
    if stop.direction.is_empty() {
        stop.name.clone()
    } else {
        format!("{} ({})", stop.name, stop.direction)
    }
}

fn resolve_route(
    route: &RawRoute,
    catalog: &BTreeMap<i64, Stop>,
    geometry: RouteGeometry,
) -> Result<ResolvedRoute, AtlasError> {
    let mut unresolved_ids = Vec::new();
    let mut unnamed_count = 0;
    let mut path_stop_count = 0;
    let mut resolved_count = 0;

    // Resolve both directions in path order. Unnamed/inactive stops stay in
    // the sequence (their coordinates still shape the geometry) but are kept
    // out of stop detection.
    let mut dir_stops: [Vec<&Stop>; 2] = [Vec::new(), Vec::new()];
    for (direction, path) in route.directions.iter().enumerate() {
        path_stop_count += path.len();
        for stop_id in path {
            match catalog.get(stop_id) {
                Some(stop) => {
                    resolved_count += 1;
                    if stop.name.is_empty() || !stop.active {
                        unnamed_count += 1;
                    }
                    dir_stops[direction].push(stop);
                }
                None => unresolved_ids.push(*stop_id),
            }
        }
    }
    if !unresolved_ids.is_empty() {
        warn!(
            route = %route.number,
            unresolved = unresolved_ids.len(),
            total = path_stop_count,
            "route path has stops missing from the points catalog"
        );
    }

    let has_osrm_geometry = geometry.from_osrm;
    let forward_line = if geometry.points.len() >= 2 {
        geometry.points
    } else {
        // Stop-to-stop fallback, preferring the major-stop geometry list
        let geometry_stops: Vec<[f64; 2]> = route.geometry_directions[0]
            .iter()
            .filter_map(|id| catalog.get(id))
            .map(|s| [s.lat, s.lon])
            .collect();
        if geometry_stops.len() >= 2 {
            geometry_stops
        } else {
            dir_stops[0].iter().map(|s| [s.lat, s.lon]).collect()
        }
    };
    let reverse_line: Vec<[f64; 2]> = forward_line.iter().rev().copied().collect();

    let (forward, fwd_out_of_order) = build_direction(route, forward_line, &dir_stops[0])?;
    let (reverse, rev_out_of_order) = build_direction(route, reverse_line, &dir_stops[1])?;

    let mut stop_ids = Vec::new();
    let mut seen = HashSet::new();
    for stop in forward.stops.iter().chain(reverse.stops.iter()) {
        if seen.insert(stop.id) {
            stop_ids.push(stop.id);
        }
    }

    let diagnostics = RouteDiagnostics {
        route_id: route.id,
        route_number: route.number.clone(),
        path_stop_count,
        resolved_count,
        unnamed_count,
        unresolved_ids,
        out_of_order_stops: fwd_out_of_order + rev_out_of_order,
        has_osrm_geometry,
        reverse_geometry: "reversed_forward".to_string(),
        geometry_points: forward.polyline.len(),
        route_length_m: forward.length_m,
    };

    Ok(ResolvedRoute {
        id: route.id,
        number: route.number.clone(),
        name: route.name.clone(),
        directions: [forward, reverse],
        stop_ids,
        has_osrm_geometry,
        diagnostics,
    })
}

/// Build one direction: cumulative table, validation, and stop placement by
/// projection. Returns the path plus the count of order violations.
fn build_direction(
    route: &RawRoute,
    polyline: Vec<[f64; 2]>,
    stops: &[&Stop],
) -> Result<(DirectionPath, usize), AtlasError> {
    if polyline.len() < 2 {
        // Without geometry this direction cannot match; stops are kept for
        // catalog purposes with no meaningful distance
        let mut path = DirectionPath::empty();
        path.stops = stops
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.name.is_empty() && s.active)
            .map(|(order, s)| StopOnRoute {
                id: s.id,
                name: display_name(s),
                lat: s.lat,
                lon: s.lon,
                order,
                distance_along_m: 0.0,
            })
            .collect();
        return Ok((path, 0));
    }

    let frame = LocalFrame::for_polyline(&polyline);
    let (cum, length_m) = geo::cumulative_distances(&polyline, frame);
    validate_cum(route, &cum, length_m)?;

    let mut on_route: Vec<StopOnRoute> = Vec::new();
    for (order, stop) in stops.iter().enumerate() {
        if stop.name.is_empty() || !stop.active {
            continue;
        }
        let distance_along_m = geo::project_point(&polyline, &cum, frame, stop.lat, stop.lon)
            .map(|p| p.distance_along_m)
            .unwrap_or(0.0);
        on_route.push(StopOnRoute {
            id: stop.id,
            name: display_name(stop),
            lat: stop.lat,
            lon: stop.lon,
            order,
            distance_along_m,
        });
    }

    // Path order and projected order should agree; count where they do not.
    // Violations are diagnostic only and never block matching.
    let out_of_order = on_route
        .windows(2)
        .filter(|w| w[1].distance_along_m < w[0].distance_along_m)
        .count();
    if out_of_order > 0 {
        warn!(
            route = %route.number,
            out_of_order,
            "stop projections disagree with path order"
        );
    }

    // Stable sort: equal distances keep their path order
    on_route.sort_by(|a, b| a.distance_along_m.total_cmp(&b.distance_along_m));

    Ok((
        DirectionPath {
            stops: on_route,
            polyline,
            cum,
            length_m,
            frame,
        },
        out_of_order,
    ))
}

fn validate_cum(route: &RawRoute, cum: &[f64], length_m: f64) -> Result<(), AtlasError> {
    let invariant_error = |detail: String| AtlasError::Invariant {
        route_id: route.id,
        route_number: route.number.clone(),
        detail,
    };

    if cum.iter().any(|c| !c.is_finite()) {
        return Err(invariant_error("non-finite cumulative distance".to_string()));
    }
    if cum.first().copied() != Some(0.0) {
        return Err(invariant_error("cumulative table does not start at 0".to_string()));
    }
    if cum.windows(2).any(|w| w[1] < w[0]) {
        return Err(invariant_error("cumulative table decreases".to_string()));
    }
    let last = cum.last().copied().unwrap_or(0.0);
    if (last - length_m).abs() > 1e-3 {
        return Err(invariant_error(format!(
            "cumulative end {last} differs from length {length_m}"
        )));
    }
    Ok(())
}
