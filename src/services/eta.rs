//! First-order arrival estimates along the stop sequence.

use crate::models::NextStop;
use crate::services::atlas::StopOnRoute;

/// Floor applied to reported speed so a stopped tram still gets an estimate
pub const MIN_SPEED_KMH: f64 = 5.0;
/// Estimates beyond one hour are unreliable and reported as None
pub const MAX_ETA_SECONDS: i64 = 3600;

/// Linear time estimate for a remaining distance. Negative distances
/// (numerical slop around a stop) clamp to zero.
pub fn eta_seconds(remaining_m: f64, speed_kmh: f64) -> Option<i64> {
    let remaining = remaining_m.max(0.0);
    let speed_ms = speed_kmh.max(MIN_SPEED_KMH) / 3.6;
    let eta = (remaining / speed_ms) as i64;
    (eta <= MAX_ETA_SECONDS).then_some(eta)
}

/// Annotate upcoming stops with estimates from the vehicle's position.
/// Stops beyond the horizon are still emitted, with a null estimate.
pub fn upcoming_stops(
    distance_along_m: f64,
    speed_kmh: f64,
    next_stops: &[&StopOnRoute],
) -> Vec<NextStop> {
    next_stops
        .iter()
        .map(|stop| NextStop {
            id: stop.id,
            name: stop.name.clone(),
            eta_seconds: eta_seconds(stop.distance_along_m - distance_along_m, speed_kmh),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: i64, distance_along_m: f64) -> StopOnRoute {
        StopOnRoute {
            id,
            name: format!("Stop {id}"),
            lat: 56.84,
            lon: 60.60,
            order: 0,
            distance_along_m,
        }
    }

    #[test]
    fn basic_estimate() {
        // 5000 m at 36 km/h (10 m/s) is 500 s
        assert_eq!(eta_seconds(5000.0, 36.0), Some(500));
    }

    #[test]
    fn zero_speed_uses_floor() {
        // 1000 m at the 5 km/h floor is 720 s
        assert_eq!(eta_seconds(1000.0, 0.0), Some(720));
    }

    #[test]
    fn negative_remaining_clamps_to_zero() {
        assert_eq!(eta_seconds(-12.5, 20.0), Some(0));
    }

    #[test]
    fn beyond_horizon_is_none() {
        // 5000 km ahead: far past the one-hour cap
        assert_eq!(eta_seconds(5_000_000.0, 60.0), None);
        // Exactly at the cap survives
        assert_eq!(eta_seconds(3600.0 * 10.0, 36.0), Some(3600));
    }

    #[test]
    fn upcoming_stops_keep_far_stops_with_null_eta() {
        let near = stop(1, 1500.0);
        let far = stop(2, 200_000.0);
        let stops = vec![&near, &far];
        let result = upcoming_stops(500.0, 36.0, &stops);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, 1);
        assert_eq!(result[0].eta_seconds, Some(100));
        assert_eq!(result[1].id, 2);
        assert_eq!(result[1].eta_seconds, None);
    }

    #[test]
    fn no_estimate_is_negative() {
        for remaining in [-500.0, 0.0, 10.0, 35_999.0] {
            if let Some(eta) = eta_seconds(remaining, 0.0) {
                assert!((0..=MAX_ETA_SECONDS).contains(&eta));
            }
        }
    }
}
