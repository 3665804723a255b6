pub mod autodetect;
pub mod gateway;
pub mod link;
pub mod ratelimit;
pub mod rc;
pub mod reader;
pub mod telemetry;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    pub enable: bool,

    /// If true, probe candidate serial ports/bauds and pick the first that
    /// yields a MAVLink HEARTBEAT.
    pub autodetect: bool,

    /// When autodetect=false: fixed port config. Accepts a serial device path
    /// or a mavlink URL ("tcpout:host:port" for SITL).
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// Autodetect candidates (paths).
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,
    pub heartbeat_timeout_ms: Option<u64>,

    /// MAVLink ids we use (companion side).
    pub sys_id: u8,
    pub comp_id: u8,

    /// Target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Refuse motion commands until an FC heartbeat has been seen.
    pub require_heartbeat: bool,

    /// Telemetry staleness window; snapshots older than this are flagged.
    pub stale_after_ms: Option<u64>,
}
