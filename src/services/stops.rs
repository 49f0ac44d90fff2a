//! Locates the previous and upcoming stops for a position along a route.

use crate::services::atlas::StopOnRoute;

/// Upcoming stops shown on a vehicle state
pub const MAX_NEXT_STOPS: usize = 5;

#[derive(Debug, Default)]
pub struct Detection<'a> {
    /// Last stop with `distance_along ≤` the vehicle's
    pub prev_stop: Option<&'a StopOnRoute>,
    /// Following stops in travel order, up to the requested count
    pub next_stops: Vec<&'a StopOnRoute>,
}

/// Binary search over a direction's stops, which are pre-sorted by
/// `distance_along_m` (insertion order breaks ties between co-located stops).
pub fn detect(stops: &[StopOnRoute], distance_along_m: f64, max_next: usize) -> Detection<'_> {
    let idx = stops.partition_point(|s| s.distance_along_m <= distance_along_m);
    Detection {
        prev_stop: idx.checked_sub(1).map(|i| &stops[i]),
        next_stops: stops[idx..].iter().take(max_next).collect(),
    }
}
