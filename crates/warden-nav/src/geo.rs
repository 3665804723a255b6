//! f64 geographic helpers shared by the geofence, battery, and GPS-denial
//! code. Haversine for distances; local-plane projections only for segment
//! geometry at fence scale.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` to `b`, degrees 0..360.
pub fn bearing_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlon = (b.lon - a.lon).to_radians();
    let x = dlon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (x.atan2(y).to_degrees() + 360.0) % 360.0
}

/// Great-circle destination from `start` along `bearing_deg` for `distance_m`.
pub fn destination_point(start: GeoPoint, distance_m: f64, bearing: f64) -> GeoPoint {
    let lat1 = start.lat.to_radians();
    let lon1 = start.lon.to_radians();
    let brng = bearing.to_radians();
    let d = distance_m / EARTH_RADIUS_M;

    let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * brng.cos()).asin();
    let lon2 = lon1
        + (brng.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());

    GeoPoint::new(lat2.to_degrees(), lon2.to_degrees())
}

/// Ray-casting point-in-polygon test. The polygon closes implicitly.
pub fn point_in_polygon(poly: &[GeoPoint], p: GeoPoint) -> bool {
    let n = poly.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (poly[i].lon, poly[i].lat);
        let (xj, yj) = (poly[j].lon, poly[j].lat);
        let crosses = ((yi > p.lat) != (yj > p.lat))
            && (p.lon < (xj - xi) * (p.lat - yi) / (yj - yi + 1e-12) + xi);
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

// Equirectangular projection around a local origin; adequate for
// segment-distance work at fence scale.
fn to_xy(p: GeoPoint, origin: GeoPoint) -> (f64, f64) {
    let x = (p.lon - origin.lon).to_radians() * EARTH_RADIUS_M * origin.lat.to_radians().cos();
    let y = (p.lat - origin.lat).to_radians() * EARTH_RADIUS_M;
    (x, y)
}

fn from_xy(x: f64, y: f64, origin: GeoPoint) -> GeoPoint {
    let lat = origin.lat + (y / EARTH_RADIUS_M).to_degrees();
    let lon = origin.lon
        + (x / (EARTH_RADIUS_M * origin.lat.to_radians().cos())).to_degrees();
    GeoPoint::new(lat, lon)
}

/// Distance in meters from `p` to the segment a-b.
pub fn dist_point_to_segment_m(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    nearest_on_segment(p, a, b).1
}

fn nearest_on_segment(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> (GeoPoint, f64) {
    let (px, py) = to_xy(p, a);
    let (bx, by) = to_xy(b, a);

    let c2 = bx * bx + by * by;
    let t = if c2 <= f64::EPSILON {
        0.0
    } else {
        ((px * bx + py * by) / c2).clamp(0.0, 1.0)
    };
    let (nx, ny) = (bx * t, by * t);
    let dist = ((px - nx).powi(2) + (py - ny).powi(2)).sqrt();
    (from_xy(nx, ny, a), dist)
}

/// Nearest point on the polygon boundary and the distance to it.
pub fn nearest_on_polygon(poly: &[GeoPoint], p: GeoPoint) -> Option<(GeoPoint, f64)> {
    if poly.len() < 3 {
        return None;
    }
    let mut best: Option<(GeoPoint, f64)> = None;
    for i in 0..poly.len() {
        let a = poly[i];
        let b = poly[(i + 1) % poly.len()];
        let (nearest, dist) = nearest_on_segment(p, a, b);
        if best.map(|(_, d)| dist < d).unwrap_or(true) {
            best = Some((nearest, dist));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // roughly 111 km per degree of latitude
        let a = GeoPoint::new(21.0, 105.0);
        let b = GeoPoint::new(22.0, 105.0);
        let d = haversine_m(a, b);
        assert!((d - 111_195.0).abs() < 200.0, "got {}", d);
        assert_eq!(haversine_m(a, a), 0.0);
    }

    #[test]
    fn bearing_cardinal_directions() {
        let o = GeoPoint::new(21.0, 105.0);
        assert!((bearing_deg(o, GeoPoint::new(22.0, 105.0)) - 0.0).abs() < 0.01);
        assert!((bearing_deg(o, GeoPoint::new(21.0, 106.0)) - 90.0).abs() < 1.0);
        assert!((bearing_deg(o, GeoPoint::new(20.0, 105.0)) - 180.0).abs() < 0.01);
    }

    #[test]
    fn destination_round_trip() {
        let o = GeoPoint::new(21.0285, 105.8048);
        let d = destination_point(o, 500.0, 47.0);
        assert!((haversine_m(o, d) - 500.0).abs() < 0.5);
        assert!((bearing_deg(o, d) - 47.0).abs() < 0.1);
    }

    #[test]
    fn point_in_polygon_square() {
        let square = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ];
        assert!(point_in_polygon(&square, GeoPoint::new(0.5, 0.5)));
        assert!(!point_in_polygon(&square, GeoPoint::new(1.5, 0.5)));
        assert!(!point_in_polygon(&square, GeoPoint::new(-0.1, -0.1)));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let line = vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0)];
        assert!(!point_in_polygon(&line, GeoPoint::new(0.5, 0.5)));
    }

    #[test]
    fn nearest_point_on_square_edge() {
        let square = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 0.01),
            GeoPoint::new(0.01, 0.01),
            GeoPoint::new(0.01, 0.0),
        ];
        // point due west of the left edge midpoint
        let p = GeoPoint::new(0.005, -0.01);
        let (nearest, dist) = nearest_on_polygon(&square, p).unwrap();
        assert!((nearest.lon - 0.0).abs() < 1e-6);
        assert!((nearest.lat - 0.005).abs() < 1e-6);
        assert!((dist - haversine_m(p, nearest)).abs() < 1.0);
    }
}
