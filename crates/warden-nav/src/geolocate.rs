//! Pixel-to-ground geolocation: intersect the camera ray through a bbox
//! center with a flat-ground plane and convert the offset to lat/lon.

use serde::Deserialize;

use crate::geo::GeoPoint;
use warden_proto::{BBox, TelemetrySnapshot};

// WGS84 equatorial radius; local-flat-earth conversion is fine for the
// sub-kilometer offsets a bbox ray produces.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Camera intrinsics plus the fixed mounting attitude relative to the body
/// frame. Pitch is negative when the camera looks down.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CameraMount {
    pub hfov_deg: f64,
    pub vfov_deg: f64,
    pub pitch_deg: f64,
    pub roll_deg: f64,
    pub yaw_deg: f64,
}

impl Default for CameraMount {
    fn default() -> Self {
        // Pi camera v1 on a slightly nose-down mount
        Self {
            hfov_deg: 54.0,
            vfov_deg: 41.0,
            pitch_deg: -20.0,
            roll_deg: 0.0,
            yaw_deg: 0.0,
        }
    }
}

type Mat3 = [[f64; 3]; 3];

fn mat_mul_vec(m: &Mat3, v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn mat_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    out
}

/// Z-Y-X (yaw, pitch, roll) rotation, aerospace convention.
fn euler_zyx(roll: f64, pitch: f64, yaw: f64) -> Mat3 {
    let (cr, sr) = (roll.cos(), roll.sin());
    let (cp, sp) = (pitch.cos(), pitch.sin());
    let (cy, sy) = (yaw.cos(), yaw.sin());

    let rx: Mat3 = [[1.0, 0.0, 0.0], [0.0, cr, -sr], [0.0, sr, cr]];
    let ry: Mat3 = [[cp, 0.0, sp], [0.0, 1.0, 0.0], [-sp, 0.0, cp]];
    let rz: Mat3 = [[cy, -sy, 0.0], [sy, cy, 0.0], [0.0, 0.0, 1.0]];

    mat_mul(&mat_mul(&rz, &ry), &rx)
}

/// Ground intersection of the ray through the bbox center.
///
/// Returns None without a solution: missing position, aircraft at or below
/// the assumed ground plane, or a ray that never meets the ground.
pub fn target_geolocation(
    bbox: BBox,
    image_width: u32,
    image_height: u32,
    snapshot: &TelemetrySnapshot,
    mount: &CameraMount,
    ground_alt_msl: f64,
) -> Option<GeoPoint> {
    if snapshot.stale || image_width == 0 || image_height == 0 {
        return None;
    }
    let agl = snapshot.alt_m - ground_alt_msl;
    if agl <= 0.0 {
        return None;
    }

    let (px, py) = bbox.center();

    // pixel -> per-axis angle from the optical center
    let angle_x = (((px as f64 / image_width as f64) - 0.5) * mount.hfov_deg).to_radians();
    let angle_y = (((py as f64 / image_height as f64) - 0.5) * mount.vfov_deg).to_radians();

    // camera frame (x right, y down, z forward), normalized
    let cam = [angle_x.tan(), angle_y.tan(), 1.0];
    let norm = (cam[0] * cam[0] + cam[1] * cam[1] + cam[2] * cam[2]).sqrt();
    let cam = [cam[0] / norm, cam[1] / norm, cam[2] / norm];

    // camera -> body axes (x forward, y right, z down)
    let cam_body_axes = [cam[2], cam[0], cam[1]];

    let r_cam_to_body = euler_zyx(
        mount.roll_deg.to_radians(),
        mount.pitch_deg.to_radians(),
        mount.yaw_deg.to_radians(),
    );
    let body = mat_mul_vec(&r_cam_to_body, cam_body_axes);

    let r_body_to_ned = euler_zyx(
        snapshot.roll as f64,
        snapshot.pitch as f64,
        snapshot.yaw as f64,
    );
    let ned = mat_mul_vec(&r_body_to_ned, body);

    // ray must point down to meet the ground
    if ned[2] <= 0.0 {
        return None;
    }

    let scale = agl / ned[2];
    let north = ned[0] * scale;
    let east = ned[1] * scale;

    let dlat = north / EARTH_RADIUS_M;
    let dlon = east / (EARTH_RADIUS_M * snapshot.lat.to_radians().cos());

    Some(GeoPoint::new(
        snapshot.lat + dlat.to_degrees(),
        snapshot.lon + dlon.to_degrees(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::BatteryTelemetry;

    fn snapshot(lat: f64, lon: f64, alt: f64, pitch: f32) -> TelemetrySnapshot {
        TelemetrySnapshot {
            captured_unix_ms: 0,
            lat,
            lon,
            alt_m: alt,
            roll: 0.0,
            pitch,
            yaw: 0.0,
            ground_speed: 0.0,
            heading_deg: 0.0,
            battery: BatteryTelemetry::default(),
            fix_type: 3,
            sats: 12,
            hdop: 0.8,
            stale: false,
        }
    }

    fn nadir_mount() -> CameraMount {
        CameraMount {
            pitch_deg: -90.0,
            ..CameraMount::default()
        }
    }

    #[test]
    fn straight_down_center_pixel_maps_to_uav_position() {
        let snap = snapshot(21.0, 105.0, 100.0, 0.0);
        let bbox = BBox::new(315, 235, 325, 245); // center (320, 240)
        let p = target_geolocation(bbox, 640, 480, &snap, &nadir_mount(), 0.0).unwrap();
        assert!((p.lat - 21.0).abs() < 1e-6, "lat {}", p.lat);
        assert!((p.lon - 105.0).abs() < 1e-6, "lon {}", p.lon);
    }

    #[test]
    fn off_center_pixel_lands_off_axis() {
        let snap = snapshot(21.0, 105.0, 100.0, 0.0);
        // right half of the image: target east of the aircraft (yaw 0 = north)
        let bbox = BBox::new(475, 235, 485, 245);
        let p = target_geolocation(bbox, 640, 480, &snap, &nadir_mount(), 0.0).unwrap();
        assert!(p.lon > 105.0);
        assert!((p.lat - 21.0).abs() < 1e-5);
    }

    #[test]
    fn upward_ray_has_no_solution() {
        let snap = snapshot(21.0, 105.0, 100.0, 0.0);
        let level_mount = CameraMount {
            pitch_deg: 45.0,
            ..CameraMount::default()
        };
        let bbox = BBox::new(315, 235, 325, 245);
        assert!(target_geolocation(bbox, 640, 480, &snap, &level_mount, 0.0).is_none());
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let mut snap = snapshot(21.0, 105.0, 100.0, 0.0);
        snap.stale = true;
        let bbox = BBox::new(315, 235, 325, 245);
        assert!(target_geolocation(bbox, 640, 480, &snap, &nadir_mount(), 0.0).is_none());
    }

    #[test]
    fn below_ground_altitude_is_rejected() {
        let snap = snapshot(21.0, 105.0, -5.0, 0.0);
        let bbox = BBox::new(315, 235, 325, 245);
        assert!(target_geolocation(bbox, 640, 480, &snap, &nadir_mount(), 0.0).is_none());
    }
}
