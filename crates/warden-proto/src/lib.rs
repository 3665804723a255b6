pub mod modes;
pub mod perception;
pub mod telemetry;
pub mod uplink;

pub use perception::{BBox, Detection};
pub use telemetry::{
    BatteryTelemetry, PilotMessenger, Severity, SnapshotSource, TelemetrySnapshot,
};
