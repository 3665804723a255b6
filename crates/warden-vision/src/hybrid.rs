//! Hybrid tracker + asynchronous detector verification.
//!
//! The tracker runs every frame on the perception thread (~2 ms). The
//! detector (~300 ms) runs on a background worker and its results are
//! reconciled against where the tracker *was* when the detector's input frame
//! was captured, not where it is now. The TimeMachine ring answers that
//! question; without it every verification would falsely diagnose drift.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::camera::Frame;
use crate::tracker::Tracker;
use crate::Detector;
use warden_proto::{BBox, Detection};

fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Frames between verification submissions.
    pub interval_frames: u32,
    /// Estimated detector latency in frames at the capture rate.
    pub latency_frames: u32,
    /// Occlusion budget: consecutive no-detection frames tolerated before
    /// tracking is abandoned.
    pub grace_frames: u32,

    pub iou_excellent: f32,
    pub iou_warning: f32,
    pub iou_danger: f32,

    /// TimeMachine ring depth.
    pub history_frames: usize,
    /// Motion window for velocity estimation.
    pub motion_window: usize,
    /// Acceptable frame-id distance when looking up past tracker state.
    pub align_tolerance: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            interval_frames: 30,
            latency_frames: 9,
            grace_frames: 60,
            iou_excellent: 0.5,
            iou_warning: 0.3,
            iou_danger: 0.1,
            history_frames: 50,
            motion_window: 10,
            align_tolerance: 5,
        }
    }
}

/// One tracker output, keyed by pipeline frame id.
#[derive(Debug, Clone, Copy)]
pub struct TmEntry {
    pub frame_id: u64,
    pub ts_unix_ms: i64,
    pub bbox: BBox,
    pub velocity: (f32, f32),
}

/// Bounded ring of recent tracker outputs. Single writer (the perception
/// thread); the verification worker reads a snapshot taken at submission
/// time, never the live ring.
#[derive(Debug)]
pub struct TimeMachine {
    entries: VecDeque<TmEntry>,
    capacity: usize,
}

impl TimeMachine {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one entry. Out-of-order frame ids are dropped; the ring is
    /// strictly monotonic.
    pub fn push(&mut self, entry: TmEntry) {
        if let Some(last) = self.entries.back() {
            if entry.frame_id <= last.frame_id {
                return;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<TmEntry> {
        self.entries.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Where the tracker was at `target` frame id, from a ring snapshot. Takes
/// the nearest entry within `tolerance`; when the nearest entry is older than
/// the target it is advanced by its stored velocity.
pub fn bbox_at(entries: &[TmEntry], target: u64, tolerance: u64) -> Option<BBox> {
    let nearest = entries
        .iter()
        .min_by_key(|e| e.frame_id.abs_diff(target))?;
    if nearest.frame_id.abs_diff(target) > tolerance {
        return None;
    }
    if nearest.frame_id < target {
        let ahead = (target - nearest.frame_id) as f32;
        Some(
            nearest
                .bbox
                .shifted(nearest.velocity.0 * ahead, nearest.velocity.1 * ahead),
        )
    } else {
        Some(nearest.bbox)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Excellent,
    Warning,
    Danger,
    Critical,
    NoDetection,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyAction {
    /// Tracker is accurate; reseed from the detector box to absorb small drift.
    Reseed(BBox),
    Continue,
    WarnPilot,
    /// Tracker is wrong; reinitialize from the detector box.
    Reinit(BBox),
    StopTracking,
}

#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub frame_id: u64,
    pub status: VerifyStatus,
    pub iou: f32,
    pub action: VerifyAction,
}

/// Work handed to the verification worker: a frame copy, the tracker's
/// position at submission, and a snapshot of the ring.
struct WorkItem {
    frame: Frame,
    frame_id: u64,
    tracker_bbox: BBox,
    velocity: (f32, f32),
    history: Vec<TmEntry>,
    /// First submission for a newly acquired target; resets the worker's
    /// grace counter.
    fresh_track: bool,
}

/// Pure verdict computation, shared by the worker and the tests.
fn evaluate(
    item: &WorkItem,
    detections: &[Detection],
    cfg: &VerifyConfig,
    grace_frames: &mut u32,
) -> Verdict {
    if detections.is_empty() {
        // One verification covers interval_frames of wall clock.
        *grace_frames += cfg.interval_frames;
        let action = if *grace_frames > cfg.grace_frames {
            VerifyAction::StopTracking
        } else {
            VerifyAction::Continue
        };
        return Verdict {
            frame_id: item.frame_id,
            status: VerifyStatus::NoDetection,
            iou: 0.0,
            action,
        };
    }
    *grace_frames = 0;

    // The detector processed a frame from ~latency_frames ago; compare against
    // the tracker's position back then.
    let detector_frame_id = item.frame_id.saturating_sub(cfg.latency_frames as u64);
    let aligned = bbox_at(&item.history, detector_frame_id, cfg.align_tolerance)
        .unwrap_or(item.tracker_bbox);

    let mut best: Option<&Detection> = None;
    let mut best_iou = 0.0f32;
    for det in detections {
        let iou = aligned.iou(&det.bbox);
        let better = iou > best_iou
            || (iou == best_iou
                && best.map(|b| det.confidence > b.confidence).unwrap_or(true));
        if better {
            best_iou = iou;
            best = Some(det);
        }
    }
    let best = best.unwrap_or(&detections[0]);
    let mut reseed_bbox = best.bbox;

    // Motion-compensated second pass: project the detection forward to "now"
    // and compare against the tracker's current box.
    if best_iou < cfg.iou_excellent {
        let ahead = cfg.latency_frames as f32;
        let predicted = best
            .bbox
            .shifted(item.velocity.0 * ahead, item.velocity.1 * ahead);
        let predicted_iou = item.tracker_bbox.iou(&predicted);
        if predicted_iou > best_iou {
            debug!(best_iou, predicted_iou, "motion prediction improved IoU");
            best_iou = predicted_iou;
            reseed_bbox = predicted;
        }
    }

    let (status, action) = if best_iou > cfg.iou_excellent {
        (VerifyStatus::Excellent, VerifyAction::Reseed(reseed_bbox))
    } else if best_iou > cfg.iou_warning {
        (VerifyStatus::Warning, VerifyAction::Continue)
    } else if best_iou > cfg.iou_danger {
        (VerifyStatus::Danger, VerifyAction::WarnPilot)
    } else {
        (VerifyStatus::Critical, VerifyAction::Reinit(reseed_bbox))
    };

    Verdict {
        frame_id: item.frame_id,
        status,
        iou: best_iou,
        action,
    }
}

/// Pilot-relevant events surfaced by the hybrid system; drained by the
/// perception stage.
#[derive(Debug, Clone)]
pub enum TrackAlert {
    Drift { iou: f32 },
    Stopped { reason: String },
}

/// Tracker + verifier facade used by the adaptive detector. All methods run
/// on the perception thread; the verification worker is internal.
pub struct HybridTracker {
    cfg: VerifyConfig,
    tracker: Box<dyn Tracker>,

    active: bool,
    confidence: f32,
    current_bbox: Option<BBox>,
    pending_reseed: Option<(BBox, bool)>, // (bbox, full_reinit)
    frames_since_verify: u32,
    fresh_track: bool,

    motion: VecDeque<(u64, BBox)>,
    velocity: (f32, f32),
    history: TimeMachine,

    alerts: Vec<TrackAlert>,

    work_tx: Sender<WorkItem>,
    /// Producer-side handle used only to shed a stale queued submission.
    work_rx_drain: Receiver<WorkItem>,
    verdict_rx: Receiver<Verdict>,
    in_flight: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl HybridTracker {
    /// Spawn the verification worker around the given detector.
    pub fn spawn(tracker: Box<dyn Tracker>, mut detector: Box<dyn Detector>, cfg: VerifyConfig) -> Self {
        // Capacity 2: non-blocking put, older submissions are discarded.
        let (work_tx, work_rx) = bounded::<WorkItem>(2);
        let work_rx_drain = work_rx.clone();
        let (verdict_tx, verdict_rx) = bounded::<Verdict>(8);
        let in_flight = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let cfg = cfg.clone();
            let in_flight = in_flight.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                info!("verification worker started");
                let mut grace_frames = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let item = match work_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(item) => item,
                        Err(_) => continue,
                    };
                    if item.fresh_track {
                        grace_frames = 0;
                    }
                    let verdict = match detector.detect(&item.frame) {
                        Ok(dets) => evaluate(&item, &dets, &cfg, &mut grace_frames),
                        Err(e) => {
                            // An errored verification counts like no-detection.
                            warn!("verification detect failed: {:#}", e);
                            grace_frames += cfg.interval_frames;
                            Verdict {
                                frame_id: item.frame_id,
                                status: VerifyStatus::Errored,
                                iou: 0.0,
                                action: if grace_frames > cfg.grace_frames {
                                    VerifyAction::StopTracking
                                } else {
                                    VerifyAction::Continue
                                },
                            }
                        }
                    };
                    let _ = verdict_tx.try_send(verdict);
                    in_flight.store(false, Ordering::Release);
                }
                info!("verification worker stopped");
            })
        };

        let history = TimeMachine::new(cfg.history_frames);
        Self {
            cfg,
            tracker,
            active: false,
            confidence: 0.0,
            current_bbox: None,
            pending_reseed: None,
            frames_since_verify: 0,
            fresh_track: true,
            motion: VecDeque::new(),
            velocity: (0.0, 0.0),
            history,
            alerts: Vec::new(),
            work_tx,
            work_rx_drain,
            verdict_rx,
            in_flight,
            stop,
            worker: Some(worker),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.active
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn current_bbox(&self) -> Option<BBox> {
        self.current_bbox
    }

    pub fn take_alerts(&mut self) -> Vec<TrackAlert> {
        std::mem::take(&mut self.alerts)
    }

    pub fn start_tracking(&mut self, frame: &Frame, bbox: BBox, frame_id: u64) -> Result<()> {
        self.tracker.init(frame, bbox)?;
        self.active = true;
        self.confidence = 1.0;
        self.current_bbox = Some(bbox);
        self.pending_reseed = None;
        self.frames_since_verify = 0;
        self.fresh_track = true;
        self.motion.clear();
        self.velocity = (0.0, 0.0);
        self.history = TimeMachine::new(self.cfg.history_frames);
        self.record(frame_id, bbox);
        // stale verdicts from a previous target are meaningless
        while self.verdict_rx.try_recv().is_ok() {}
        info!(?bbox, frame_id, "hybrid tracking started");
        Ok(())
    }

    pub fn stop_tracking(&mut self) {
        if self.active {
            info!("hybrid tracking stopped");
        }
        self.active = false;
        self.confidence = 0.0;
        self.current_bbox = None;
        self.pending_reseed = None;
        self.motion.clear();
        self.history.clear();
    }

    /// Per-frame step: apply finished verifications, advance the fast
    /// tracker, record history, and maybe hand a frame to the worker.
    /// Never blocks on the detector.
    pub fn update(&mut self, frame: &Frame, frame_id: u64) -> Option<BBox> {
        self.drain_verdicts();
        if !self.active {
            return None;
        }

        if let Some((bbox, full)) = self.pending_reseed.take() {
            if let Err(e) = self.tracker.init(frame, bbox) {
                if full {
                    // CRITICAL reinit failed: give up on this target
                    warn!("tracker reinit failed: {:#}", e);
                    self.alerts.push(TrackAlert::Stopped {
                        reason: "reinit failed".into(),
                    });
                    self.stop_tracking();
                    return None;
                }
                debug!("tracker reseed failed, keeping current state: {:#}", e);
            }
        }

        let bbox = match self.tracker.update(frame) {
            Some(b) => b,
            None => {
                warn!("tracker failed, awaiting re-detection");
                self.alerts.push(TrackAlert::Stopped {
                    reason: "tracker lost target".into(),
                });
                self.stop_tracking();
                return None;
            }
        };
        self.current_bbox = Some(bbox);
        self.record(frame_id, bbox);

        self.frames_since_verify += 1;
        if self.frames_since_verify >= self.cfg.interval_frames
            && !self.in_flight.load(Ordering::Acquire)
        {
            self.submit(frame, bbox, frame_id);
            self.frames_since_verify = 0;
        }

        Some(bbox)
    }

    fn record(&mut self, frame_id: u64, bbox: BBox) {
        self.motion.push_back((frame_id, bbox));
        while self.motion.len() > self.cfg.motion_window {
            self.motion.pop_front();
        }
        if self.motion.len() >= 2 {
            let (first_id, first) = self.motion.front().copied().unwrap_or((frame_id, bbox));
            let span = frame_id.saturating_sub(first_id).max(1) as f32;
            let (cx, cy) = bbox.center();
            let (fx, fy) = first.center();
            self.velocity = ((cx - fx) / span, (cy - fy) / span);
        }
        self.history.push(TmEntry {
            frame_id,
            ts_unix_ms: unix_ms(),
            bbox,
            velocity: self.velocity,
        });
    }

    fn submit(&mut self, frame: &Frame, bbox: BBox, frame_id: u64) {
        let item = WorkItem {
            frame: frame.clone(),
            frame_id,
            tracker_bbox: bbox,
            velocity: self.velocity,
            history: self.history.snapshot(),
            fresh_track: self.fresh_track,
        };
        // never block: a full queue sheds its older submission first
        let item = match self.work_tx.try_send(item) {
            Ok(()) => {
                self.fresh_track = false;
                self.in_flight.store(true, Ordering::Release);
                return;
            }
            Err(crossbeam_channel::TrySendError::Full(item)) => item,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
        };
        let _ = self.work_rx_drain.try_recv();
        if self.work_tx.try_send(item).is_ok() {
            self.fresh_track = false;
            self.in_flight.store(true, Ordering::Release);
        } else {
            debug!("verification queue full, submission skipped");
        }
    }

    fn drain_verdicts(&mut self) {
        while let Ok(verdict) = self.verdict_rx.try_recv() {
            self.apply_verdict(verdict);
            if !self.active {
                break;
            }
        }
    }

    fn apply_verdict(&mut self, v: Verdict) {
        match v.status {
            VerifyStatus::Excellent => {
                debug!(iou = v.iou, "verification: tracker accurate");
                self.confidence = (self.confidence + 0.1).min(1.0);
                if let VerifyAction::Reseed(bbox) = v.action {
                    self.pending_reseed = Some((bbox, false));
                }
            }
            VerifyStatus::Warning => {
                debug!(iou = v.iou, "verification: tracker drifting");
                self.confidence = (self.confidence - 0.05).max(0.3);
            }
            VerifyStatus::Danger => {
                warn!(iou = v.iou, "verification: tracker may be wrong");
                self.confidence = (self.confidence - 0.2).max(0.1);
                self.alerts.push(TrackAlert::Drift { iou: v.iou });
            }
            VerifyStatus::Critical => {
                warn!(iou = v.iou, "verification: tracker wrong, reinitializing");
                self.confidence = 0.5;
                match v.action {
                    VerifyAction::Reinit(bbox) => {
                        self.pending_reseed = Some((bbox, true));
                    }
                    VerifyAction::StopTracking => {
                        self.alerts.push(TrackAlert::Stopped {
                            reason: "verification critical".into(),
                        });
                        self.stop_tracking();
                    }
                    _ => {}
                }
            }
            VerifyStatus::NoDetection | VerifyStatus::Errored => {
                if v.action == VerifyAction::StopTracking {
                    self.alerts.push(TrackAlert::Stopped {
                        reason: "target lost beyond grace period".into(),
                    });
                    self.stop_tracking();
                }
            }
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HybridTracker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
