pub mod battery;
pub mod gpsmon;

pub use battery::{BatteryFailsafe, BatteryParams, BatteryState, FailsafeDecision, FlightState};
pub use gpsmon::{GpsDenialMonitor, GpsReading, GpsStatus, GpsWatch, ImuReading};
