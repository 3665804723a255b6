pub mod doctor;
pub mod geo;
pub mod geofence;
pub mod geolocate;
pub mod mission;
pub mod templates;

pub use geo::GeoPoint;
pub use geofence::{FenceAction, FenceCheck, GeoFence, GeofenceError, GeofencingSystem};
