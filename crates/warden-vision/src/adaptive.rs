use anyhow::Result;
use tracing::{debug, info, warn};

use crate::camera::Frame;
use crate::hybrid::{HybridTracker, TrackAlert};
use crate::modes::{ModeChange, ModeController};
use crate::Detector;
use warden_proto::modes::{DetectRate, MissionMode};
use warden_proto::Detection;

const MIN_TRACK_AREA: i64 = 400; // 20x20 px
const MAX_TRACK_AREA: i64 = 100_000;

/// Target currently followed by the hybrid tracker.
#[derive(Debug, Clone)]
struct TrackedTarget {
    class_id: i32,
    class_name: String,
    confidence: f32,
}

/// Mode-aware perception front end: runs the detector at the cadence the
/// current mission mode asks for and delegates the frames in between to the
/// hybrid tracker.
pub struct AdaptiveDetector {
    detector: Box<dyn Detector>,
    hybrid: HybridTracker,
    modes: ModeController,

    frame_count: u64,
    target: Option<TrackedTarget>,
    emergency_tracking: bool,
    alerts: Vec<TrackAlert>,
}

impl AdaptiveDetector {
    pub fn new(detector: Box<dyn Detector>, hybrid: HybridTracker, modes: ModeController) -> Self {
        Self {
            detector,
            hybrid,
            modes,
            frame_count: 0,
            target: None,
            emergency_tracking: false,
            alerts: Vec::new(),
        }
    }

    pub fn mode(&self) -> MissionMode {
        self.modes.current()
    }

    pub fn is_tracking(&self) -> bool {
        self.hybrid.is_tracking()
    }

    pub fn take_alerts(&mut self) -> Vec<TrackAlert> {
        let mut out = std::mem::take(&mut self.alerts);
        out.extend(self.hybrid.take_alerts());
        out
    }

    /// Apply a pilot mode request from the RC decoder.
    pub fn apply_mode_request(&mut self, mode: MissionMode, rate: DetectRate, emergency: bool) {
        if let Some(change) = self.modes.request(mode, rate, emergency) {
            self.on_mode_change(change);
        }
    }

    fn on_mode_change(&mut self, change: ModeChange) {
        if change.reset_tracking {
            self.clear_tracking();
        }
        info!(
            from = change.from.as_str(),
            to = change.to.as_str(),
            "perception reconfigured"
        );
    }

    fn clear_tracking(&mut self) {
        if self.emergency_tracking {
            self.emergency_tracking = false;
            if let Some(change) = self.modes.set_critical("rescue_track", false) {
                self.on_mode_change(change);
            }
        }
        self.hybrid.stop_tracking();
        self.target = None;
    }

    /// Process one frame. Either a full detector pass that (re)seeds the
    /// tracker, or a cheap tracker-only update.
    pub fn process_frame(&mut self, frame: &Frame, frame_id: u64) -> Vec<Detection> {
        self.frame_count += 1;

        let Some(interval) = self.modes.detect_interval() else {
            // MANUAL: perception idle
            if self.hybrid.is_tracking() {
                self.clear_tracking();
            }
            return Vec::new();
        };

        let detect_now =
            !self.hybrid.is_tracking() || self.frame_count % interval.max(1) as u64 == 0;

        if detect_now {
            match self.run_detection(frame) {
                Ok(dets) if !dets.is_empty() => {
                    self.seed_tracking(frame, frame_id, &dets);
                    return dets;
                }
                Ok(_) => {}
                Err(e) => {
                    // transient inference failure: fall through to tracking
                    warn!("detection failed: {:#}", e);
                }
            }
        }

        match self.hybrid.update(frame, frame_id) {
            Some(bbox) => {
                let target = self.target.clone();
                let (class_id, class_name, confidence) = target
                    .map(|t| (t.class_id, t.class_name, t.confidence))
                    .unwrap_or((-1, "unknown".into(), 0.0));
                vec![Detection {
                    bbox,
                    class_id,
                    class_name,
                    confidence,
                    track_confidence: Some(self.hybrid.confidence()),
                }]
            }
            None => {
                if self.target.take().is_some() {
                    debug!("tracking ended, will re-detect");
                    if self.emergency_tracking {
                        self.emergency_tracking = false;
                        if let Some(change) = self.modes.set_critical("rescue_track", false) {
                            self.on_mode_change(change);
                        }
                    }
                }
                Vec::new()
            }
        }
    }

    fn run_detection(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let profile = self.modes.profile().clone();
        let mut dets = self.detector.detect(frame)?;
        dets.retain(|d| {
            d.confidence >= profile.confidence_threshold
                && (profile.target_classes.is_empty()
                    || profile.target_classes.iter().any(|c| c == &d.class_name))
                && (MIN_TRACK_AREA..=MAX_TRACK_AREA).contains(&d.bbox.area())
        });
        dets.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(dets)
    }

    fn seed_tracking(&mut self, frame: &Frame, frame_id: u64, dets: &[Detection]) {
        let best = &dets[0];
        match self.hybrid.start_tracking(frame, best.bbox, frame_id) {
            Ok(()) => {
                self.target = Some(TrackedTarget {
                    class_id: best.class_id,
                    class_name: best.class_name.clone(),
                    confidence: best.confidence,
                });
                if self.modes.current() == MissionMode::SearchRescue
                    && best.class_name == "person"
                    && !self.emergency_tracking
                {
                    self.emergency_tracking = true;
                    self.modes.set_critical("rescue_track", true);
                    warn!("rescue target acquired, mode transitions deferred");
                }
            }
            Err(e) => {
                // logic violation on our side, never fatal to the pipeline
                warn!("tracker seed failed: {:#}", e);
                self.target = None;
            }
        }
    }

    /// Stop the background verifier; called on pipeline shutdown.
    pub fn shutdown(&mut self) {
        self.clear_tracking();
        self.hybrid.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::VerifyConfig;
    use crate::modes::ModeController;
    use crate::tracker::KinematicTracker;
    use std::collections::HashMap;
    use warden_proto::BBox;

    struct ScriptedDetector {
        result: Vec<Detection>,
        calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(self.result.clone())
        }
    }

    fn det(x1: i32, conf: f32, class: &str) -> Detection {
        Detection {
            bbox: BBox::new(x1, 100, x1 + 100, 200),
            class_id: 0,
            class_name: class.into(),
            confidence: conf,
            track_confidence: None,
        }
    }

    fn frame() -> Frame {
        Frame::from_bgr(640, 480, vec![0; 640 * 480 * 3])
    }

    fn adaptive(result: Vec<Detection>) -> (AdaptiveDetector, std::sync::Arc<std::sync::atomic::AtomicU32>) {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let main_det = Box::new(ScriptedDetector {
            result: result.clone(),
            calls: calls.clone(),
        });
        let verify_det = Box::new(ScriptedDetector {
            result,
            calls: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0)),
        });
        let hybrid = HybridTracker::spawn(
            Box::new(KinematicTracker::default()),
            verify_det,
            VerifyConfig::default(),
        );
        let modes = ModeController::new(HashMap::new());
        (AdaptiveDetector::new(main_det, hybrid, modes), calls)
    }

    #[test]
    fn detection_seeds_then_tracker_takes_over() {
        let (mut ad, calls) = adaptive(vec![det(100, 0.9, "person")]);
        let f = frame();

        let out = ad.process_frame(&f, 1);
        assert_eq!(out.len(), 1);
        assert!(ad.is_tracking());
        let after_seed = calls.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(after_seed, 1);

        // next frames inside the cadence window are tracker-only
        for id in 2..10u64 {
            let out = ad.process_frame(&f, id);
            assert_eq!(out.len(), 1);
            assert!(out[0].track_confidence.is_some());
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), after_seed);
        ad.shutdown();
    }

    #[test]
    fn low_confidence_detections_are_filtered() {
        // reconnaissance threshold is 0.5
        let (mut ad, _) = adaptive(vec![det(100, 0.3, "person")]);
        let f = frame();
        let out = ad.process_frame(&f, 1);
        assert!(out.is_empty());
        assert!(!ad.is_tracking());
        ad.shutdown();
    }

    #[test]
    fn manual_mode_idles_perception() {
        let (mut ad, calls) = adaptive(vec![det(100, 0.9, "person")]);
        ad.apply_mode_request(MissionMode::Manual, DetectRate::Medium, false);
        let f = frame();
        assert!(ad.process_frame(&f, 1).is_empty());
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 0);
        ad.shutdown();
    }

    #[test]
    fn rescue_person_sets_critical_and_defers_mode_switch() {
        let (mut ad, _) = adaptive(vec![det(100, 0.9, "person")]);
        ad.apply_mode_request(MissionMode::SearchRescue, DetectRate::High, false);
        let f = frame();
        ad.process_frame(&f, 1);
        assert!(ad.is_tracking());

        // pilot flips the switch mid-rescue: deferred
        ad.apply_mode_request(MissionMode::PeopleCounting, DetectRate::Low, false);
        assert_eq!(ad.mode(), MissionMode::SearchRescue);
        ad.shutdown();
    }
}
