//! Upcoming vehicles for a stop, in two tiers.
//!
//! Tier 1 trusts the pipeline: vehicles whose detected `next_stops` include
//! the stop arrive with their pre-computed estimates. Tier 2 covers routes
//! serving the stop that produced no tier-1 hit at all: their active
//! vehicles get a great-circle straight-line estimate from the raw fix.

use std::collections::{HashMap, HashSet};

use crate::models::{StopArrival, VehicleState};
use crate::services::atlas::RouteAtlas;
use crate::services::{eta, geo};

/// Arrivals shown per stop
const MAX_ARRIVALS: usize = 15;

pub fn arrivals_for_stop(
    atlas: &RouteAtlas,
    vehicles: &HashMap<String, VehicleState>,
    stop_id: i64,
    route_filter: Option<i64>,
) -> Vec<StopArrival> {
    let serving: &[i64] = atlas
        .stop_routes
        .get(&stop_id)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    if serving.is_empty() {
        return Vec::new();
    }

    let relevant = |state: &VehicleState| -> Option<i64> {
        let route_id = state.route_id?;
        if !serving.contains(&route_id) {
            return None;
        }
        if route_filter.is_some_and(|f| f != route_id) {
            return None;
        }
        // Ghosts carry stale positions; keep them off the arrivals board
        if state.signal_lost {
            return None;
        }
        Some(route_id)
    };

    let mut arrivals = Vec::new();
    let mut tier1_routes: HashSet<i64> = HashSet::new();

    for state in vehicles.values() {
        let Some(route_id) = relevant(state) else {
            continue;
        };
        if let Some(next) = state.next_stops.iter().find(|n| n.id == stop_id) {
            tier1_routes.insert(route_id);
            arrivals.push(StopArrival {
                vehicle_id: state.id.clone(),
                board_num: state.board_num.clone(),
                route: state.route.clone(),
                route_id: state.route_id,
                eta_seconds: next.eta_seconds,
            });
        }
    }

    if let Some(stop) = atlas.stops.get(&stop_id) {
        for state in vehicles.values() {
            let Some(route_id) = relevant(state) else {
                continue;
            };
            if tier1_routes.contains(&route_id) {
                continue;
            }
            let distance_m = geo::haversine_m(state.raw_lat, state.raw_lon, stop.lat, stop.lon);
            let Some(estimate) = eta::eta_seconds(distance_m, state.speed) else {
                continue;
            };
            arrivals.push(StopArrival {
                vehicle_id: state.id.clone(),
                board_num: state.board_num.clone(),
                route: state.route.clone(),
                route_id: state.route_id,
                eta_seconds: Some(estimate),
            });
        }
    }

    arrivals.sort_by_key(|a| a.eta_seconds.unwrap_or(i64::MAX));
    arrivals.truncate(MAX_ARRIVALS);
    arrivals
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use chrono::Utc;

    use super::*;
    use crate::models::{NextStop, Stop};
    use crate::providers::ettu::RawRoute;
    use crate::services::atlas::assemble;

    fn test_atlas() -> RouteAtlas {
        let stops = vec![
            Stop {
                id: 1,
                name: "South".to_string(),
                lat: 56.800,
                lon: 60.600,
                direction: String::new(),
                active: true,
            },
            Stop {
                id: 2,
                name: "North".to_string(),
                lat: 56.890,
                lon: 60.600,
                direction: String::new(),
                active: true,
            },
        ];
        let route = RawRoute {
            id: 7,
            number: "1".to_string(),
            name: String::new(),
            directions: [vec![1, 2], vec![2, 1]],
            geometry_directions: [vec![1, 2], vec![2, 1]],
        };
        assemble(vec![route], stops, StdHashMap::new(), 1, Utc::now()).unwrap()
    }

    fn vehicle(id: &str, next_stops: Vec<NextStop>) -> VehicleState {
        VehicleState {
            id: id.to_string(),
            board_num: format!("b-{id}"),
            route: "1".to_string(),
            route_id: Some(7),
            lat: 56.84,
            lon: 60.60,
            speed: 36.0,
            course: 0.0,
            prev_stop: None,
            next_stops,
            progress: Some(0.4),
            timestamp: Some(Utc::now()),
            signal_lost: false,
            direction: Some(0),
            distance_along_m: Some(4000.0),
            raw_lat: 56.84,
            raw_lon: 60.60,
        }
    }

    #[test]
    fn tier1_uses_precomputed_eta() {
        let atlas = test_atlas();
        let mut vehicles = HashMap::new();
        vehicles.insert(
            "a".to_string(),
            vehicle(
                "a",
                vec![NextStop {
                    id: 2,
                    name: "North".to_string(),
                    eta_seconds: Some(321),
                }],
            ),
        );

        let arrivals = arrivals_for_stop(&atlas, &vehicles, 2, None);
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].vehicle_id, "a");
        assert_eq!(arrivals[0].eta_seconds, Some(321));
    }

    #[test]
    fn tier2_estimates_when_no_pipeline_hit() {
        let atlas = test_atlas();
        let mut vehicles = HashMap::new();
        // On the route but its next_stops never mention stop 2
        vehicles.insert("a".to_string(), vehicle("a", Vec::new()));

        let arrivals = arrivals_for_stop(&atlas, &vehicles, 2, None);
        assert_eq!(arrivals.len(), 1);
        // ~5.6 km at 10 m/s: somewhere around 9-10 minutes
        let eta = arrivals[0].eta_seconds.unwrap();
        assert!((450..700).contains(&eta), "eta = {eta}");
    }

    #[test]
    fn tier1_hit_suppresses_tier2_for_the_route() {
        let atlas = test_atlas();
        let mut vehicles = HashMap::new();
        vehicles.insert(
            "tracked".to_string(),
            vehicle(
                "tracked",
                vec![NextStop {
                    id: 2,
                    name: "North".to_string(),
                    eta_seconds: Some(100),
                }],
            ),
        );
        vehicles.insert("other".to_string(), vehicle("other", Vec::new()));

        let arrivals = arrivals_for_stop(&atlas, &vehicles, 2, None);
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].vehicle_id, "tracked");
    }

    #[test]
    fn ghosts_and_filtered_routes_are_excluded() {
        let atlas = test_atlas();
        let mut vehicles = HashMap::new();

        let mut ghost = vehicle("ghost", Vec::new());
        ghost.signal_lost = true;
        vehicles.insert("ghost".to_string(), ghost);

        let mut off_route = vehicle("off", Vec::new());
        off_route.route_id = None;
        vehicles.insert("off".to_string(), off_route);

        assert!(arrivals_for_stop(&atlas, &vehicles, 2, None).is_empty());

        // Route filter keeps only the requested route
        vehicles.insert("a".to_string(), vehicle("a", Vec::new()));
        assert!(arrivals_for_stop(&atlas, &vehicles, 2, Some(99)).is_empty());
        assert_eq!(arrivals_for_stop(&atlas, &vehicles, 2, Some(7)).len(), 1);
    }

    #[test]
    fn unknown_stop_has_no_arrivals() {
        let atlas = test_atlas();
        let vehicles = HashMap::new();
        assert!(arrivals_for_stop(&atlas, &vehicles, 404, None).is_empty());
    }

    #[test]
    fn sorted_by_eta_with_null_last() {
        let atlas = test_atlas();
        let mut vehicles = HashMap::new();
        for (id, eta) in [("a", Some(300)), ("b", Some(60)), ("c", None)] {
            vehicles.insert(
                id.to_string(),
                vehicle(
                    id,
                    vec![NextStop {
                        id: 2,
                        name: "North".to_string(),
                        eta_seconds: eta,
                    }],
                ),
            );
        }
        let arrivals = arrivals_for_stop(&atlas, &vehicles, 2, None);
        let order: Vec<&str> = arrivals.iter().map(|a| a.vehicle_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }
}
