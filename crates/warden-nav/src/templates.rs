//! Preset fence shapes for quick field setup. All of them are valid by
//! construction, so the constructors skip the fallible `GeoFence::new` path.

use crate::geo::GeoPoint;
use crate::geofence::GeoFence;

fn offset_point(center: GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
    let lat = center.lat + north_m / 111_000.0;
    let lon = center.lon + east_m / (111_000.0 * center.lat.to_radians().cos());
    GeoPoint::new(lat, lon)
}

/// Five-pointed star exclusion zone (10 vertices, alternating radius).
pub fn star_exclusion(center: GeoPoint, radius_m: f64, name: &str) -> GeoFence {
    let mut points = Vec::with_capacity(10);
    for i in 0..10 {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / 10.0 - std::f64::consts::FRAC_PI_2;
        let r = if i % 2 == 0 { radius_m } else { radius_m * 0.4 };
        points.push(offset_point(center, r * angle.cos(), r * angle.sin()));
    }
    GeoFence {
        name: name.to_string(),
        points,
        is_exclusion: true,
        altitude_min: 0.0,
        altitude_max: 1000.0,
    }
}

/// Circular exclusion zone approximated by `segments` vertices.
pub fn circle_exclusion(center: GeoPoint, radius_m: f64, name: &str) -> GeoFence {
    circle_exclusion_segments(center, radius_m, name, 16)
}

pub fn circle_exclusion_segments(
    center: GeoPoint,
    radius_m: f64,
    name: &str,
    segments: usize,
) -> GeoFence {
    let segments = segments.max(3);
    let mut points = Vec::with_capacity(segments);
    for i in 0..segments {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / segments as f64;
        points.push(offset_point(
            center,
            radius_m * angle.cos(),
            radius_m * angle.sin(),
        ));
    }
    GeoFence {
        name: name.to_string(),
        points,
        is_exclusion: true,
        altitude_min: 0.0,
        altitude_max: 1000.0,
    }
}

/// Axis-aligned rectangle from its southwest and northeast corners.
pub fn rectangle_exclusion(southwest: GeoPoint, northeast: GeoPoint, name: &str) -> GeoFence {
    GeoFence {
        name: name.to_string(),
        points: vec![
            GeoPoint::new(southwest.lat, southwest.lon),
            GeoPoint::new(southwest.lat, northeast.lon),
            GeoPoint::new(northeast.lat, northeast.lon),
            GeoPoint::new(northeast.lat, southwest.lon),
        ],
        is_exclusion: true,
        altitude_min: 0.0,
        altitude_max: 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{haversine_m, point_in_polygon};

    #[test]
    fn star_center_is_inside() {
        let center = GeoPoint::new(21.030, 105.806);
        let star = star_exclusion(center, 150.0, "star");
        assert_eq!(star.points.len(), 10);
        assert!(point_in_polygon(&star.points, center));
    }

    #[test]
    fn circle_vertices_sit_on_radius() {
        let center = GeoPoint::new(21.0, 105.0);
        let circle = circle_exclusion(center, 80.0, "circle");
        for p in &circle.points {
            let d = haversine_m(center, *p);
            assert!((d - 80.0).abs() < 2.0, "vertex at {}", d);
        }
    }

    #[test]
    fn rectangle_contains_its_center() {
        let sw = GeoPoint::new(21.0, 105.0);
        let ne = GeoPoint::new(21.01, 105.01);
        let rect = rectangle_exclusion(sw, ne, "rect");
        assert!(point_in_polygon(&rect.points, GeoPoint::new(21.005, 105.005)));
    }
}
