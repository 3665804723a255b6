use anyhow::Result;

use crate::camera::Frame;
use warden_proto::BBox;

/// Fast single-target tracker updated every frame on the main perception
/// thread. Implementations must be cheap (~ms); the detector never runs here.
pub trait Tracker: Send {
    /// (Re)initialize on a new target. Fails when the bbox is unusable
    /// (degenerate or outside the frame).
    fn init(&mut self, frame: &Frame, bbox: BBox) -> Result<()>;

    /// Advance one frame. None means the tracker lost the target.
    fn update(&mut self, frame: &Frame) -> Option<BBox>;
}

/// Built-in constant-velocity coasting tracker. It does not inspect pixels:
/// it advances the last seeded box by the velocity observed across reseeds
/// and decays confidence until the next detector verification refreshes it.
/// Serves as the fallback when no visual tracker backend is linked in.
pub struct KinematicTracker {
    bbox: Option<BBox>,
    prev_seed: Option<BBox>,
    velocity: (f32, f32),
    frames_since_seed: u32,
    /// Frames the tracker will coast without a reseed before giving up.
    coast_budget: u32,
}

impl KinematicTracker {
    pub fn new(coast_budget: u32) -> Self {
        Self {
            bbox: None,
            prev_seed: None,
            velocity: (0.0, 0.0),
            frames_since_seed: 0,
            coast_budget,
        }
    }
}

impl Default for KinematicTracker {
    fn default() -> Self {
        // ~3 s at 30 FPS
        Self::new(90)
    }
}

impl Tracker for KinematicTracker {
    fn init(&mut self, frame: &Frame, bbox: BBox) -> Result<()> {
        anyhow::ensure!(bbox.area() > 0, "degenerate tracker bbox");
        let clamped = bbox.clamp_to(frame.width, frame.height);
        anyhow::ensure!(clamped.area() > 0, "tracker bbox outside frame");

        if let Some(prev) = self.prev_seed {
            let n = self.frames_since_seed;
            if n > 0 {
                let (cx, cy) = bbox.center();
                let (px, py) = prev.center();
                self.velocity = ((cx - px) / n as f32, (cy - py) / n as f32);
            }
        }
        self.prev_seed = Some(bbox);
        self.bbox = Some(bbox);
        self.frames_since_seed = 0;
        Ok(())
    }

    fn update(&mut self, frame: &Frame) -> Option<BBox> {
        let cur = self.bbox?;
        self.frames_since_seed += 1;
        if self.frames_since_seed > self.coast_budget {
            self.bbox = None;
            return None;
        }
        let next = cur
            .shifted(self.velocity.0, self.velocity.1)
            .clamp_to(frame.width, frame.height);
        if next.area() <= 0 {
            // drifted fully out of frame
            self.bbox = None;
            return None;
        }
        self.bbox = Some(next);
        Some(next)
    }
}
