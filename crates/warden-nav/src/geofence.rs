use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::geo::{
    bearing_deg, destination_point, haversine_m, nearest_on_polygon, point_in_polygon, GeoPoint,
};

/// Recommended response to a fence result. The engine only recommends;
/// command execution lives at the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceAction {
    Warn,
    Rth,
    Loiter,
    Land,
    GuidedReturn,
}

#[derive(Debug, thiserror::Error)]
pub enum GeofenceError {
    #[error("fence '{0}' needs at least 3 vertices")]
    TooFewVertices(String),
    #[error("fence '{0}' altitude band is inverted")]
    InvertedAltitudeBand(String),
    #[error("geofence file: {0}")]
    Io(#[from] std::io::Error),
    #[error("geofence file: {0}")]
    Format(#[from] serde_json::Error),
}

/// One polygon fence. Exclusion keeps the aircraft out; inclusion keeps it
/// in. The altitude band applies independently of the horizontal test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoFence {
    pub name: String,
    pub points: Vec<GeoPoint>,
    pub is_exclusion: bool,
    pub altitude_min: f64,
    pub altitude_max: f64,
}

impl GeoFence {
    pub fn new(
        name: impl Into<String>,
        points: Vec<GeoPoint>,
        is_exclusion: bool,
        altitude_min: f64,
        altitude_max: f64,
    ) -> Result<Self, GeofenceError> {
        let name = name.into();
        if points.len() < 3 {
            return Err(GeofenceError::TooFewVertices(name));
        }
        if altitude_min > altitude_max {
            return Err(GeofenceError::InvertedAltitudeBand(name));
        }
        Ok(Self {
            name,
            points,
            is_exclusion,
            altitude_min,
            altitude_max,
        })
    }

    fn validate(&self) -> Result<(), GeofenceError> {
        if self.points.len() < 3 {
            return Err(GeofenceError::TooFewVertices(self.name.clone()));
        }
        if self.altitude_min > self.altitude_max {
            return Err(GeofenceError::InvertedAltitudeBand(self.name.clone()));
        }
        Ok(())
    }

    pub fn in_altitude_band(&self, altitude: f64) -> bool {
        (self.altitude_min..=self.altitude_max).contains(&altitude)
    }

    /// Horizontal + altitude containment.
    pub fn contains(&self, p: GeoPoint, altitude: f64) -> bool {
        self.in_altitude_band(altitude) && point_in_polygon(&self.points, p)
    }

    /// Signed distance to the boundary in meters: negative inside.
    pub fn boundary_distance_m(&self, p: GeoPoint) -> Option<f64> {
        let (nearest, _) = nearest_on_polygon(&self.points, p)?;
        let d = haversine_m(p, nearest);
        Some(if point_in_polygon(&self.points, p) { -d } else { d })
    }

    /// Nearest point outside this exclusion zone with a 20 m buffer past the
    /// boundary, along the interior-to-boundary bearing.
    pub fn safe_return_point(&self, from_inside: GeoPoint) -> Option<GeoPoint> {
        if !self.is_exclusion {
            return None;
        }
        let (nearest, _) = nearest_on_polygon(&self.points, from_inside)?;
        let outward = bearing_deg(from_inside, nearest);
        Some(destination_point(nearest, 20.0, outward))
    }
}

/// Result of one position check.
#[derive(Debug, Clone)]
pub struct FenceCheck {
    pub safe: bool,
    pub message: String,
    pub action: Option<FenceAction>,
    /// False when the same breach already alerted within the cooldown.
    pub should_alert: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFences {
    home: GeoPoint,
    max_distance: f64,
    fences: Vec<GeoFence>,
}

/// The full fence set plus the home-radius cap. Home and max distance must be
/// set before any check can answer "safe".
pub struct GeofencingSystem {
    home: GeoPoint,
    max_distance_m: f64,
    fences: Vec<GeoFence>,

    pub warning_distance_m: f64,
    breach_cooldown_s: f64,
    breach_count: u64,
    last_breach: Option<(String, Instant)>,
}

impl GeofencingSystem {
    pub fn new(home: GeoPoint, max_distance_m: f64) -> Self {
        info!(
            lat = home.lat,
            lon = home.lon,
            max_distance_m,
            "geofencing system initialized"
        );
        Self {
            home,
            max_distance_m,
            fences: Vec::new(),
            warning_distance_m: 30.0,
            breach_cooldown_s: 5.0,
            breach_count: 0,
            last_breach: None,
        }
    }

    pub fn home(&self) -> GeoPoint {
        self.home
    }

    pub fn max_distance_m(&self) -> f64 {
        self.max_distance_m
    }

    pub fn fences(&self) -> &[GeoFence] {
        &self.fences
    }

    pub fn breach_count(&self) -> u64 {
        self.breach_count
    }

    pub fn add_fence(&mut self, fence: GeoFence) {
        info!(
            name = fence.name.as_str(),
            vertices = fence.points.len(),
            exclusion = fence.is_exclusion,
            "fence added"
        );
        self.fences.push(fence);
    }

    pub fn remove_fence(&mut self, name: &str) -> bool {
        let before = self.fences.len();
        self.fences.retain(|f| f.name != name);
        self.fences.len() != before
    }

    /// Check order: home radius first, then each fence (exclusion-inside,
    /// inclusion-outside), then proximity warnings.
    pub fn check_position(&mut self, current: GeoPoint, altitude: f64) -> FenceCheck {
        let distance_home = haversine_m(self.home, current);
        if distance_home > self.max_distance_m {
            error!(
                distance_m = distance_home as i64,
                max_m = self.max_distance_m as i64,
                "max distance breach"
            );
            return self.breach(
                format!("Too far from home: {:.0}m", distance_home),
                FenceAction::Rth,
                "max_distance",
            );
        }

        for i in 0..self.fences.len() {
            let fence = &self.fences[i];
            let inside = fence.contains(current, altitude);

            if fence.is_exclusion && inside {
                error!(fence = fence.name.as_str(), "inside exclusion zone");
                let name = fence.name.clone();
                return self.breach(
                    format!("BREACH: inside no-fly zone '{}'", name),
                    FenceAction::GuidedReturn,
                    &name,
                );
            }
            if !fence.is_exclusion && !inside {
                error!(fence = fence.name.as_str(), "outside required zone");
                let name = fence.name.clone();
                return self.breach(
                    format!("BREACH: outside required zone '{}'", name),
                    FenceAction::GuidedReturn,
                    &name,
                );
            }

            if fence.is_exclusion && fence.in_altitude_band(altitude) {
                if let Some(d) = fence.boundary_distance_m(current) {
                    if d > 0.0 && d < self.warning_distance_m {
                        warn!(
                            fence = fence.name.as_str(),
                            distance_m = d as i64,
                            "close to exclusion zone"
                        );
                    }
                }
            }
        }

        self.last_breach = None;
        FenceCheck {
            safe: true,
            message: "Position safe".into(),
            action: None,
            should_alert: false,
        }
    }

    fn breach(&mut self, message: String, action: FenceAction, key: &str) -> FenceCheck {
        self.breach_count += 1;
        let now = Instant::now();
        let should_alert = match &self.last_breach {
            Some((prev_key, at)) if prev_key == key => {
                now.duration_since(*at).as_secs_f64() >= self.breach_cooldown_s
            }
            _ => true,
        };
        if should_alert {
            self.last_breach = Some((key.to_string(), now));
        }
        FenceCheck {
            safe: false,
            message,
            action: Some(action),
            should_alert,
        }
    }

    /// Where to send the aircraft when in breach: out of the violated
    /// exclusion zone, or home when past the radius cap.
    pub fn safe_return_point(&self, current: GeoPoint, altitude: f64) -> Option<GeoPoint> {
        for fence in &self.fences {
            if fence.is_exclusion && fence.contains(current, altitude) {
                return fence.safe_return_point(current);
            }
        }
        if haversine_m(self.home, current) > self.max_distance_m {
            return Some(self.home);
        }
        None
    }

    // ---- persistence ----

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), GeofenceError> {
        let doc = PersistedFences {
            home: self.home,
            max_distance: self.max_distance_m,
            fences: self.fences.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a fence set. A file that parses but fails validation leaves the
    /// current configuration untouched: a corrupted load must never degrade
    /// into a permissive fence set.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), GeofenceError> {
        let json = std::fs::read_to_string(path)?;
        let doc: PersistedFences = serde_json::from_str(&json)?;
        for fence in &doc.fences {
            fence.validate()?;
        }
        self.home = doc.home;
        self.max_distance_m = doc.max_distance;
        self.fences = doc.fences;
        info!(fences = self.fences.len(), "geofences loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::point_in_polygon;
    use crate::templates;

    fn system_with_star() -> GeofencingSystem {
        let home = GeoPoint::new(21.028511, 105.804817);
        let mut sys = GeofencingSystem::new(home, 1000.0);
        let star = templates::star_exclusion(GeoPoint::new(21.030, 105.806), 150.0, "Military Base");
        sys.add_fence(star);
        sys
    }

    #[test]
    fn inside_star_zone_is_breach_with_guided_return() {
        let mut sys = system_with_star();
        let check = sys.check_position(GeoPoint::new(21.030, 105.806), 50.0);
        assert!(!check.safe);
        assert_eq!(check.action, Some(FenceAction::GuidedReturn));
    }

    #[test]
    fn near_home_position_is_safe() {
        let mut sys = system_with_star();
        let check = sys.check_position(GeoPoint::new(21.029, 105.805), 50.0);
        assert!(check.safe, "{}", check.message);
        assert!(check.action.is_none());
    }

    #[test]
    fn beyond_max_distance_recommends_rth() {
        let mut sys = system_with_star();
        let check = sys.check_position(GeoPoint::new(21.040, 105.810), 50.0);
        assert!(!check.safe);
        assert_eq!(check.action, Some(FenceAction::Rth));
    }

    #[test]
    fn altitude_band_limits_exclusion() {
        let home = GeoPoint::new(21.0285, 105.8048);
        let mut sys = GeofencingSystem::new(home, 2000.0);
        let mut fence =
            templates::circle_exclusion(GeoPoint::new(21.030, 105.806), 100.0, "Low Zone");
        fence.altitude_min = 0.0;
        fence.altitude_max = 120.0;
        sys.add_fence(fence);

        assert!(!sys.check_position(GeoPoint::new(21.030, 105.806), 50.0).safe);
        // overflight above the band is allowed
        assert!(sys.check_position(GeoPoint::new(21.030, 105.806), 200.0).safe);
    }

    #[test]
    fn inclusion_zone_must_contain_position() {
        let home = GeoPoint::new(21.0285, 105.8048);
        let mut sys = GeofencingSystem::new(home, 5000.0);
        let mut zone = templates::circle_exclusion(home, 800.0, "Operating Area");
        zone.is_exclusion = false;
        sys.add_fence(zone);

        assert!(sys.check_position(GeoPoint::new(21.029, 105.805), 50.0).safe);
        let far = crate::geo::destination_point(home, 900.0, 90.0);
        let check = sys.check_position(far, 50.0);
        assert!(!check.safe);
        assert_eq!(check.action, Some(FenceAction::GuidedReturn));
    }

    #[test]
    fn safe_return_point_sits_outside_the_zone() {
        let sys = system_with_star();
        let inside = GeoPoint::new(21.030, 105.806);
        let safe = sys.safe_return_point(inside, 50.0).unwrap();
        let fence = &sys.fences()[0];
        assert!(!point_in_polygon(&fence.points, safe));
        // past the boundary by the 20 m buffer, give or take projection error
        let d = fence.boundary_distance_m(safe).unwrap();
        assert!(d > 5.0 && d < 40.0, "buffer distance {}", d);
    }

    #[test]
    fn repeated_breach_collapses_within_cooldown() {
        let mut sys = system_with_star();
        let p = GeoPoint::new(21.030, 105.806);
        let first = sys.check_position(p, 50.0);
        assert!(first.should_alert);
        let second = sys.check_position(p, 50.0);
        assert!(!second.should_alert, "same breach inside cooldown");
    }

    #[test]
    fn fence_validation_rejects_degenerate_polygons() {
        let pts = vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0)];
        assert!(matches!(
            GeoFence::new("bad", pts, true, 0.0, 100.0),
            Err(GeofenceError::TooFewVertices(_))
        ));
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("fences_a.json");
        let path_b = dir.path().join("fences_b.json");

        let sys = system_with_star();
        sys.save_to_file(&path_a).unwrap();

        let mut loaded = GeofencingSystem::new(GeoPoint::new(0.0, 0.0), 1.0);
        loaded.load_from_file(&path_a).unwrap();
        loaded.save_to_file(&path_b).unwrap();

        let a = std::fs::read(&path_a).unwrap();
        let b = std::fs::read(&path_b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn corrupted_file_leaves_existing_fences_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\"home\": {\"lat\": 1.0").unwrap();

        let mut sys = system_with_star();
        assert!(sys.load_from_file(&path).is_err());
        assert_eq!(sys.fences().len(), 1, "fences must survive a failed load");
    }
}
