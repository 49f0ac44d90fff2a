//! Linear referencing over route polylines.
//!
//! All planar math runs in an equirectangular local frame anchored at the
//! polyline's mean latitude: one degree of latitude is 111 320 m and one
//! degree of longitude is scaled by the cosine of that latitude. At city
//! scale this stays within centimeters of a geodesic solution.

/// Meters per degree of latitude
pub const LAT_M_PER_DEG: f64 = 111_320.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Equirectangular frame fixed at a reference latitude
#[derive(Debug, Clone, Copy)]
pub struct LocalFrame {
    lon_m_per_deg: f64,
}

impl LocalFrame {
    pub fn at_latitude(lat_deg: f64) -> Self {
        Self {
            lon_m_per_deg: LAT_M_PER_DEG * lat_deg.to_radians().cos(),
        }
    }

    /// Frame anchored at the mean latitude of a polyline
    pub fn for_polyline(points: &[[f64; 2]]) -> Self {
        if points.is_empty() {
            return Self::at_latitude(0.0);
        }
        let mean = points.iter().map(|p| p[0]).sum::<f64>() / points.len() as f64;
        Self::at_latitude(mean)
    }

    /// Planar offset of `b` relative to `a` in meters: (east, north)
    fn delta_m(&self, a: [f64; 2], b: [f64; 2]) -> (f64, f64) {
        let north = (b[0] - a[0]) * LAT_M_PER_DEG;
        let east = (b[1] - a[1]) * self.lon_m_per_deg;
        (east, north)
    }

    /// Straight-line distance between two points in meters
    pub fn distance_m(&self, a: [f64; 2], b: [f64; 2]) -> f64 {
        let (east, north) = self.delta_m(a, b);
        (east * east + north * north).sqrt()
    }

    /// Compass bearing from `a` to `b`: 0 = north, clockwise
    pub fn bearing_deg(&self, a: [f64; 2], b: [f64; 2]) -> f64 {
        let (east, north) = self.delta_m(a, b);
        east.atan2(north).to_degrees().rem_euclid(360.0)
    }
}

/// Cumulative arc-length table for a polyline. Returns the per-vertex
/// distances (`cum[0] = 0`, `cum[last]` = total) and the total length.
pub fn cumulative_distances(points: &[[f64; 2]], frame: LocalFrame) -> (Vec<f64>, f64) {
    let mut cum = Vec::with_capacity(points.len());
    let mut total = 0.0;
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            total += frame.distance_m(points[i - 1], *p);
        }
        cum.push(total);
    }
    (cum, total)
}

/// Result of projecting a point onto a polyline
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Fractional position along the line, clamped to [0, 1]
    pub progress: f64,
    /// Meters from the line start to the snapped point
    pub distance_along_m: f64,
    /// Perpendicular distance in meters; for points projecting beyond an
    /// endpoint this is the distance to that endpoint
    pub perp_distance_m: f64,
    /// Nearest point on the line as [lat, lon]
    pub snapped: [f64; 2],
    /// Bearing of the containing segment in degrees
    pub segment_bearing_deg: f64,
}

/// Snap a point onto a polyline using the given cumulative table.
/// Returns None for degenerate lines (< 2 points or zero length).
pub fn project_point(
    points: &[[f64; 2]],
    cum: &[f64],
    frame: LocalFrame,
    lat: f64,
    lon: f64,
) -> Option<Projection> {
    if points.len() < 2 || cum.len() != points.len() {
        return None;
    }
    let total = *cum.last()?;
    if total <= 0.0 {
        return None;
    }

    let target = [lat, lon];
    let mut best: Option<Projection> = None;

    for i in 0..points.len() - 1 {
        let a = points[i];
        let b = points[i + 1];
        let seg_len = cum[i + 1] - cum[i];
        if seg_len <= 0.0 {
            continue;
        }

        let (dx, dy) = frame.delta_m(a, b);
        let (px, py) = frame.delta_m(a, target);
        let t = ((px * dx + py * dy) / (dx * dx + dy * dy)).clamp(0.0, 1.0);
        let (cx, cy) = (dx * t, dy * t);
        let dist = ((px - cx) * (px - cx) + (py - cy) * (py - cy)).sqrt();

        if best.map_or(true, |p| dist < p.perp_distance_m) {
            // Land exactly on the vertex when the projection clamps, so
            // endpoint matches report progress 0 or 1 without rounding dust
            let distance_along = if t >= 1.0 {
                cum[i + 1]
            } else {
                cum[i] + seg_len * t
            };
            best = Some(Projection {
                progress: (distance_along / total).clamp(0.0, 1.0),
                distance_along_m: distance_along,
                perp_distance_m: dist,
                snapped: [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t],
                segment_bearing_deg: frame.bearing_deg(a, b),
            });
        }
    }

    best
}

/// Bearing of the segment containing `distance_m`. Distances beyond either
/// end take the adjacent segment's bearing.
pub fn bearing_at(points: &[[f64; 2]], cum: &[f64], frame: LocalFrame, distance_m: f64) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let seg = segment_index(cum, distance_m);
    frame.bearing_deg(points[seg], points[seg + 1])
}

/// Interpolated [lat, lon] at a fractional position along the line
pub fn point_at_progress(points: &[[f64; 2]], cum: &[f64], progress: f64) -> Option<[f64; 2]> {
    if points.len() < 2 || cum.len() != points.len() {
        return None;
    }
    let total = *cum.last()?;
    if total <= 0.0 {
        return None;
    }

    let target = progress.clamp(0.0, 1.0) * total;
    let seg = segment_index(cum, target);
    let seg_len = cum[seg + 1] - cum[seg];
    let t = if seg_len > 0.0 {
        (target - cum[seg]) / seg_len
    } else {
        0.0
    };
    let a = points[seg];
    let b = points[seg + 1];
    Some([a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t])
}

/// Index of the non-degenerate segment containing `distance_m`
fn segment_index(cum: &[f64], distance_m: f64) -> usize {
    let last_seg = cum.len().saturating_sub(2);
    let mut idx = cum
        .partition_point(|&c| c <= distance_m)
        .saturating_sub(1)
        .min(last_seg);
    // Step over zero-length segments left by duplicate vertices
    while idx < last_seg && cum[idx + 1] - cum[idx] <= 0.0 {
        idx += 1;
    }
    while idx > 0 && cum[idx + 1] - cum[idx] <= 0.0 {
        idx -= 1;
    }
    idx
}

/// Great-circle distance in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().asin()
}

/// Shortest angular difference between two bearings, in [0, 180]
pub fn angular_diff_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}
