use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BatteryTelemetry {
    pub voltage_v: f32,
    pub current_a: f32,
    pub consumed_mah: f32,
    /// Percent 0-100, -1 when the FC reports it as unknown.
    pub remaining_pct: i8,
}

/// One consistent view of FC state, paired with a frame at capture time and
/// consumed by the safety components at their own cadence.
///
/// Fields are read from a single locked view; a snapshot is never patched
/// after creation. `stale` is set when the FC link has not refreshed one of
/// the field groups within the staleness window; callers must treat a stale
/// snapshot as "no data" for safety decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub captured_unix_ms: i64,

    pub lat: f64,
    pub lon: f64,
    /// Meters MSL.
    pub alt_m: f64,

    // Radians.
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,

    pub ground_speed: f32,
    pub heading_deg: f32,

    pub battery: BatteryTelemetry,

    /// GPS fix type: 0 = none, 2 = 2D, 3 = 3D.
    pub fix_type: u8,
    pub sats: u8,
    pub hdop: f32,

    pub stale: bool,
}

impl TelemetrySnapshot {
    pub fn has_position(&self) -> bool {
        !self.stale && self.fix_type >= 2
    }
}

/// Capability handed to the capture stage: the latest consistent FC state.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> TelemetrySnapshot;
}

/// MAVLink STATUSTEXT severities used by the safety components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Warning,
    Notice,
    Info,
}

impl Severity {
    pub fn wire_value(self) -> u8 {
        match self {
            Severity::Critical => 2,
            Severity::Warning => 3,
            Severity::Notice => 5,
            Severity::Info => 6,
        }
    }
}

/// Narrow capability the safety monitors hold instead of the full command
/// gateway: pilot-visible text and a mode suggestion, nothing that moves the
/// aircraft.
pub trait PilotMessenger: Send + Sync {
    fn status_text(&self, msg: &str, severity: Severity);
    fn suggest_mode(&self, mode: &str);
}
