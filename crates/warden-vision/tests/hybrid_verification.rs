//! End-to-end exercise of the hybrid tracker: a drifting fast tracker is
//! verified by a slow detector and the time-aligned comparison keeps the
//! track locked instead of misdiagnosing drift.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use warden_proto::{BBox, Detection};
use warden_vision::camera::Frame;
use warden_vision::hybrid::{HybridTracker, TrackAlert, VerifyConfig};
use warden_vision::tracker::Tracker;
use warden_vision::Detector;

fn frame() -> Frame {
    Frame::from_bgr(640, 480, vec![0; 640 * 480 * 3])
}

/// Tracker that reports a pre-scripted trajectory and records reseeds.
struct ScriptedTracker {
    per_frame_dx: i32,
    bbox: BBox,
    inits: Arc<Mutex<Vec<BBox>>>,
}

impl Tracker for ScriptedTracker {
    fn init(&mut self, _frame: &Frame, bbox: BBox) -> Result<()> {
        self.bbox = bbox;
        self.inits.lock().unwrap().push(bbox);
        Ok(())
    }

    fn update(&mut self, _frame: &Frame) -> Option<BBox> {
        self.bbox = self.bbox.shifted(self.per_frame_dx as f32, 0.0);
        Some(self.bbox)
    }
}

/// Detector that always reports the target at the position it occupied at
/// the latency-delayed frame, as a real detector would.
struct LaggedDetector {
    start: BBox,
    per_frame_dx: i32,
    latency_frames: u32,
    calls: Arc<AtomicU32>,
    submitted_at: Arc<AtomicU32>,
}

impl Detector for LaggedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let seen_frame = self
            .submitted_at
            .load(Ordering::SeqCst)
            .saturating_sub(self.latency_frames);
        let bbox = self
            .start
            .shifted(self.per_frame_dx as f32 * seen_frame as f32, 0.0);
        Ok(vec![Detection {
            bbox,
            class_id: 0,
            class_name: "person".into(),
            confidence: 0.9,
            track_confidence: None,
        }])
    }
}

#[test]
fn verification_recovers_drift_and_keeps_lock() {
    let cfg = VerifyConfig::default();
    let inits = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicU32::new(0));
    let submitted_at = Arc::new(AtomicU32::new(30));

    let tracker = ScriptedTracker {
        per_frame_dx: 5,
        bbox: BBox::new(100, 100, 200, 200),
        inits: inits.clone(),
    };
    let detector = LaggedDetector {
        start: BBox::new(100, 100, 200, 200),
        per_frame_dx: 5,
        latency_frames: cfg.latency_frames,
        calls: calls.clone(),
        submitted_at,
    };

    let mut hybrid = HybridTracker::spawn(Box::new(tracker), Box::new(detector), cfg);
    let f = frame();

    hybrid.start_tracking(&f, BBox::new(100, 100, 200, 200), 0).unwrap();
    assert!(hybrid.is_tracking());

    // 30 frames of +5 px/frame motion; the 30th triggers verification
    for frame_id in 1..=30u64 {
        assert!(hybrid.update(&f, frame_id).is_some());
    }

    // let the worker finish and the next frames apply its verdict
    let mut frame_id = 31u64;
    while calls.load(Ordering::SeqCst) == 0 && frame_id < 60 {
        std::thread::sleep(Duration::from_millis(10));
        hybrid.update(&f, frame_id);
        frame_id += 1;
    }
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(10));
        hybrid.update(&f, frame_id);
        frame_id += 1;
    }

    assert!(hybrid.is_tracking(), "time-aligned verification must keep the lock");
    assert!(
        hybrid.confidence() >= 1.0,
        "EXCELLENT verdict raises confidence, got {}",
        hybrid.confidence()
    );

    // the EXCELLENT verdict reseeded the tracker from the detector box
    let reseeds = inits.lock().unwrap();
    assert!(
        reseeds.len() >= 2,
        "expected a reseed beyond the initial seed, got {:?}",
        *reseeds
    );

    let alerts = hybrid.take_alerts();
    assert!(
        !alerts.iter().any(|a| matches!(a, TrackAlert::Stopped { .. })),
        "lock must not be dropped: {:?}",
        alerts
    );

    hybrid.shutdown();
}

/// A detector that never sees anything exhausts the occlusion grace budget
/// and tracking stops without panicking the pipeline.
struct BlindDetector;

impl Detector for BlindDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[test]
fn empty_verifications_stop_tracking_after_grace() {
    let cfg = VerifyConfig {
        interval_frames: 5,
        grace_frames: 10,
        ..VerifyConfig::default()
    };
    let inits = Arc::new(Mutex::new(Vec::new()));
    let tracker = ScriptedTracker {
        per_frame_dx: 0,
        bbox: BBox::new(100, 100, 200, 200),
        inits,
    };
    let mut hybrid = HybridTracker::spawn(Box::new(tracker), Box::new(BlindDetector), cfg);
    let f = frame();
    hybrid.start_tracking(&f, BBox::new(100, 100, 200, 200), 0).unwrap();

    // interval 5, grace 10: the third empty verification exceeds the budget
    let mut frame_id = 1u64;
    for _ in 0..200 {
        if hybrid.update(&f, frame_id).is_none() {
            break;
        }
        frame_id += 1;
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(!hybrid.is_tracking(), "grace exhaustion must stop tracking");
    let alerts = hybrid.take_alerts();
    assert!(alerts
        .iter()
        .any(|a| matches!(a, TrackAlert::Stopped { .. })));
    hybrid.shutdown();
}
