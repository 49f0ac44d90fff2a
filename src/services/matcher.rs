//! Snaps GPS fixes onto route geometries and infers the travel direction.

use crate::services::atlas::RouteAtlas;
use crate::services::geo;

#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub route_id: i64,
    /// 0 = forward, 1 = reverse
    pub direction: usize,
    /// Clamped to [0, 1]
    pub progress: f64,
    pub perp_distance_m: f64,
    /// Nearest point on the matched geometry as [lat, lon]
    pub snapped: [f64; 2],
    pub distance_along_m: f64,
}

/// Match a vehicle against the routes carrying its reported number.
///
/// Every candidate direction is projected independently. A direction whose
/// segment bearing agrees with the vehicle course (shortest angular
/// difference ≤ 90°) beats a disagreeing one; within equal agreement the
/// smaller perpendicular distance wins, which also settles Δ≈90° ties.
/// Returns None when no direction comes within `max_snap_distance_m`.
pub fn match_vehicle(
    atlas: &RouteAtlas,
    route_num: &str,
    lat: f64,
    lon: f64,
    course_deg: f64,
    max_snap_distance_m: f64,
) -> Option<MatchResult> {
    let candidate_ids = atlas.by_number.get(route_num)?;

    let mut best: Option<(bool, MatchResult)> = None;
    for route_id in candidate_ids {
        let Some(route) = atlas.routes.get(route_id) else {
            continue;
        };
        for (direction, path) in route.directions.iter().enumerate() {
            let Some(proj) = path.project(lat, lon) else {
                continue;
            };
            if proj.perp_distance_m > max_snap_distance_m {
                continue;
            }

            let agrees =
                geo::angular_diff_deg(course_deg, proj.segment_bearing_deg) <= 90.0;
            let candidate = MatchResult {
                route_id: *route_id,
                direction,
                progress: proj.progress,
                perp_distance_m: proj.perp_distance_m,
                snapped: proj.snapped,
                distance_along_m: proj.distance_along_m,
            };

            let better = match &best {
                None => true,
                Some((best_agrees, best_match)) => {
                    (agrees && !best_agrees)
                        || (agrees == *best_agrees
                            && candidate.perp_distance_m < best_match.perp_distance_m)
                }
            };
            if better {
                best = Some((agrees, candidate));
            }
        }
    }

    best.map(|(_, result)| result)
}
