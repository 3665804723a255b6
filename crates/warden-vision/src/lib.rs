pub mod adaptive;
pub mod camera;
pub mod hybrid;
pub mod modes;
pub mod tracker;

use anyhow::Result;
use serde::Deserialize;

use camera::Frame;
use warden_proto::Detection;

/// Object detection backend. Implementations wrap an inference engine
/// (TFLite, ONNX); the core only depends on this trait.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub enable: bool,
    /// Inference backend name; resolved by the binary at startup.
    pub backend: String,
    pub model_path: Option<String>,
    pub class_names: Vec<String>,
}
