use serde::{Deserialize, Serialize};

use crate::perception::Detection;
use crate::telemetry::TelemetrySnapshot;

/// Telemetry record posted to the ground station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub ts_unix_ms: i64,
    pub snapshot: TelemetrySnapshot,
}

/// Detections for one frame, posted at the perception stage's pace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub ts_unix_ms: i64,
    pub frame_id: u64,
    pub mode: String,
    pub detections: Vec<Detection>,
}

/// A geolocated target derived from a detection and the paired snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetReport {
    pub ts_unix_ms: i64,
    pub frame_id: u64,
    pub class_name: String,
    pub confidence: f32,
    pub lat: f64,
    pub lon: f64,
}

/// Items flowing through the upload queue to the uplink stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadItem {
    Telemetry(TelemetryReport),
    Detections(DetectionReport),
    Target(TargetReport),
}
