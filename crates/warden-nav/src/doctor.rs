use anyhow::Result;

use crate::geo::GeoPoint;
use crate::geofence::GeofencingSystem;

pub fn check_home(home: GeoPoint) -> Result<()> {
    anyhow::ensure!(
        home.lat.abs() <= 90.0 && home.lon.abs() <= 180.0,
        "home coordinates invalid"
    );
    anyhow::ensure!(
        home.lat != 0.0 || home.lon != 0.0,
        "home position not set (0,0)"
    );
    Ok(())
}

pub fn check_geofence(system: &GeofencingSystem) -> Result<()> {
    check_home(system.home())?;
    anyhow::ensure!(system.max_distance_m() >= 50.0, "geofence.max_distance too small");
    for fence in system.fences() {
        anyhow::ensure!(
            fence.points.len() >= 3,
            "fence '{}' must have >= 3 points",
            fence.name
        );
        anyhow::ensure!(
            fence.altitude_min <= fence.altitude_max,
            "fence '{}' altitude band inverted",
            fence.name
        );
    }
    Ok(())
}

pub fn check_gps_thresholds(min_sats: u8, max_hdop: f32) -> Result<()> {
    anyhow::ensure!(min_sats >= 4, "gps.min_sats too low");
    anyhow::ensure!(max_hdop > 0.5 && max_hdop < 10.0, "gps.max_hdop out of range");
    Ok(())
}
