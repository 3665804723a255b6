//! The three-stage pipeline: capture+telemetry, perception, uplink. Stages
//! are OS threads joined by bounded queues; no stage ever waits on another
//! beyond its queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::Deserialize;
use tracing::{debug, info, warn};

use warden_nav::geolocate::{target_geolocation, CameraMount};
use warden_proto::modes::{DetectRate, MissionMode};
use warden_proto::uplink::{DetectionReport, TargetReport, TelemetryReport, UploadItem};
use warden_proto::{PilotMessenger, Severity, SnapshotSource, TelemetrySnapshot};
use warden_uplink::UplinkClient;
use warden_vision::adaptive::AdaptiveDetector;
use warden_vision::camera::{Frame, FrameSource};
use warden_vision::hybrid::TrackAlert;

use crate::queue::{LossyQueue, RtQueue};
use crate::supervise::{StageSupervisor, StopFlag};

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub frame_queue_cap: usize,
    pub upload_queue_cap: usize,
    /// Telemetry report cadence on the upload queue.
    pub telemetry_period_ms: u64,
    /// Perf summary every N captured frames.
    pub perf_every_frames: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_cap: 2,
            upload_queue_cap: 50,
            telemetry_period_ms: 1000,
            perf_every_frames: 300,
        }
    }
}

/// One capture event: frame plus the telemetry read in the same iteration.
/// The pair is immutable once formed.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub frame_id: u64,
    pub ts_unix_ms: i64,
    pub frame: Frame,
    pub telemetry: TelemetrySnapshot,
}

impl FramePacket {
    /// Milliseconds between frame capture and the telemetry read. Bounded by
    /// a single capture iteration.
    pub fn capture_skew_ms(&self) -> i64 {
        self.telemetry.captured_unix_ms - self.frame.ts_unix_ms
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_processed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub uploads_sent: AtomicU64,
    pub uploads_rejected: AtomicU64,
}

/// Everything the pipeline takes ownership of at start().
pub struct PipelineDeps {
    pub frame_source: Option<Box<dyn FrameSource>>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub perception: Option<AdaptiveDetector>,
    pub mount: CameraMount,
    pub ground_alt_msl: f64,
    pub uplink: Option<UplinkClient>,
    /// Pilot mode requests decoded from RC, drained by the perception stage.
    pub mode_rx: Option<Receiver<(MissionMode, DetectRate, bool)>>,
    /// Drift warnings go to the pilot through this narrow capability.
    pub messenger: Option<Arc<dyn PilotMessenger>>,
}

pub struct Pipeline {
    cfg: PipelineConfig,
    deps: PipelineDeps,
}

pub struct RunningPipeline {
    stop: StopFlag,
    failed: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    handles: Vec<(String, JoinHandle<()>, Receiver<()>)>,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig, deps: PipelineDeps) -> Self {
        Self { cfg, deps }
    }

    /// Spawn the three stages. NEW -> RUNNING.
    pub fn start(self) -> RunningPipeline {
        let stop = StopFlag::new();
        let failed = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PipelineStats::default());

        let frame_q: RtQueue<FramePacket> = RtQueue::new(self.cfg.frame_queue_cap);
        let upload_q: LossyQueue<UploadItem> = LossyQueue::new(self.cfg.upload_queue_cap);

        let PipelineDeps {
            frame_source,
            snapshots,
            perception,
            mount,
            ground_alt_msl,
            uplink,
            mode_rx,
            messenger,
        } = self.deps;

        let mut handles = Vec::new();
        let mut spawn_stage = |name: &str, f: Box<dyn FnOnce() + Send>| {
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
            let handle = std::thread::spawn(move || {
                f();
                let _ = done_tx.send(());
            });
            handles.push((name.to_string(), handle, done_rx));
        };

        {
            let (cfg, stop, failed, stats) = (
                self.cfg.clone(),
                stop.clone(),
                failed.clone(),
                stats.clone(),
            );
            let (frame_q, upload_q) = (frame_q.clone(), upload_q.clone());
            spawn_stage(
                "capture",
                Box::new(move || {
                    capture_stage(cfg, frame_source, snapshots, frame_q, upload_q, stop, failed, stats)
                }),
            );
        }

        {
            let (stop, failed, stats) = (stop.clone(), failed.clone(), stats.clone());
            let (frame_q, upload_q) = (frame_q.clone(), upload_q.clone());
            spawn_stage(
                "perception",
                Box::new(move || {
                    perception_stage(
                        perception,
                        mount,
                        ground_alt_msl,
                        mode_rx,
                        messenger,
                        frame_q,
                        upload_q,
                        stop,
                        failed,
                        stats,
                    )
                }),
            );
        }

        {
            let (stop, failed, stats) = (stop.clone(), failed.clone(), stats.clone());
            spawn_stage(
                "uplink",
                Box::new(move || uplink_stage(uplink, upload_q, stop, failed, stats)),
            );
        }

        info!("pipeline running (3 stages)");
        RunningPipeline {
            stop,
            failed,
            stats,
            handles,
        }
    }
}

impl RunningPipeline {
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Signal stop and join every stage with a per-thread timeout.
    pub fn stop(self, join_timeout: Duration) {
        self.stop.stop();
        for (name, handle, done_rx) in self.handles {
            match done_rx.recv_timeout(join_timeout) {
                Ok(()) => {
                    let _ = handle.join();
                    info!(stage = name.as_str(), "stage joined");
                }
                Err(_) => {
                    warn!(stage = name.as_str(), "stage did not exit in time, detaching");
                }
            }
        }
        info!("pipeline stopped");
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_stage(
    cfg: PipelineConfig,
    mut source: Option<Box<dyn FrameSource>>,
    snapshots: Arc<dyn SnapshotSource>,
    frame_q: RtQueue<FramePacket>,
    upload_q: LossyQueue<UploadItem>,
    stop: StopFlag,
    failed: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) {
    let mut frame_id: u64 = 0;
    let mut last_telemetry: Option<Instant> = None;
    let telemetry_period = Duration::from_millis(cfg.telemetry_period_ms);
    let mut perf_mark = (Instant::now(), 0u64);

    let sup = StageSupervisor::default();
    sup.run(
        "capture",
        &stop,
        || {
            // telemetry report at its own cadence, even without a camera
            let telemetry_due = last_telemetry
                .map(|t| t.elapsed() >= telemetry_period)
                .unwrap_or(true);
            if telemetry_due {
                last_telemetry = Some(Instant::now());
                let snapshot = snapshots.snapshot();
                let report = UploadItem::Telemetry(TelemetryReport {
                    ts_unix_ms: snapshot.captured_unix_ms,
                    snapshot,
                });
                if !upload_q.push(report) {
                    warn!("upload queue full, dropping telemetry report");
                    stats.uploads_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }

            let Some(src) = source.as_mut() else {
                std::thread::sleep(Duration::from_millis(100));
                return Ok(());
            };
            let Some(frame) = src.next_frame()? else {
                // driver had nothing; retry shortly
                std::thread::sleep(Duration::from_millis(1));
                return Ok(());
            };

            // telemetry is read in the same iteration as the capture and the
            // pair never separates afterwards
            let telemetry = snapshots.snapshot();
            frame_id += 1;
            let packet = FramePacket {
                frame_id,
                ts_unix_ms: frame.ts_unix_ms,
                frame,
                telemetry,
            };
            let skew = packet.capture_skew_ms();
            if !(0..=100).contains(&skew) {
                debug!(skew_ms = skew, "capture/telemetry skew outside target");
            }

            if frame_q.push(packet) {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            stats.frames_captured.fetch_add(1, Ordering::Relaxed);

            if frame_id % cfg.perf_every_frames == 0 {
                let (t0, f0) = perf_mark;
                let fps = (frame_id - f0) as f64 / t0.elapsed().as_secs_f64().max(1e-6);
                info!(
                    frames = frame_id,
                    fps = format!("{:.1}", fps),
                    queue = frame_q.len(),
                    dropped = frame_q.dropped(),
                    "capture stats"
                );
                perf_mark = (Instant::now(), frame_id);
            }
            Ok(())
        },
        || {
            failed.store(true, Ordering::Relaxed);
            stop.stop();
        },
    );
}

#[allow(clippy::too_many_arguments)]
fn perception_stage(
    mut perception: Option<AdaptiveDetector>,
    mount: CameraMount,
    ground_alt_msl: f64,
    mode_rx: Option<Receiver<(MissionMode, DetectRate, bool)>>,
    messenger: Option<Arc<dyn PilotMessenger>>,
    frame_q: RtQueue<FramePacket>,
    upload_q: LossyQueue<UploadItem>,
    stop: StopFlag,
    failed: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) {
    let sup = StageSupervisor::default();
    sup.run(
        "perception",
        &stop,
        || {
            let Some(packet) = frame_q.pop(Duration::from_secs(1)) else {
                return Ok(());
            };
            let Some(adaptive) = perception.as_mut() else {
                // no detection backend linked in: consume and count only
                stats.frames_processed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };

            if let Some(rx) = &mode_rx {
                while let Ok((mode, rate, emergency)) = rx.try_recv() {
                    adaptive.apply_mode_request(mode, rate, emergency);
                }
            }

            let detections = adaptive.process_frame(&packet.frame, packet.frame_id);
            stats.frames_processed.fetch_add(1, Ordering::Relaxed);

            for alert in adaptive.take_alerts() {
                match alert {
                    TrackAlert::Drift { iou } => {
                        if let Some(m) = &messenger {
                            m.status_text(&format!("TRACK DRIFT iou {:.2}", iou), Severity::Warning);
                        }
                    }
                    TrackAlert::Stopped { reason } => {
                        debug!(reason = reason.as_str(), "tracking stopped");
                    }
                }
            }

            if detections.is_empty() {
                return Ok(());
            }

            let report = DetectionReport {
                ts_unix_ms: packet.ts_unix_ms,
                frame_id: packet.frame_id,
                mode: adaptive.mode().as_str().to_string(),
                detections: detections.clone(),
            };
            if !upload_q.push(UploadItem::Detections(report)) {
                warn!("upload queue full, dropping detection report");
                stats.uploads_rejected.fetch_add(1, Ordering::Relaxed);
            }

            // geolocate the primary detection against the paired snapshot
            let primary = &detections[0];
            if let Some(point) = target_geolocation(
                primary.bbox,
                packet.frame.width,
                packet.frame.height,
                &packet.telemetry,
                &mount,
                ground_alt_msl,
            ) {
                let target = TargetReport {
                    ts_unix_ms: packet.ts_unix_ms,
                    frame_id: packet.frame_id,
                    class_name: primary.class_name.clone(),
                    confidence: primary.confidence,
                    lat: point.lat,
                    lon: point.lon,
                };
                info!(
                    class = target.class_name.as_str(),
                    lat = target.lat,
                    lon = target.lon,
                    "target geolocated"
                );
                if !upload_q.push(UploadItem::Target(target)) {
                    warn!("upload queue full, dropping target report");
                    stats.uploads_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        },
        || {
            failed.store(true, Ordering::Relaxed);
            stop.stop();
        },
    );

    if let Some(adaptive) = perception.as_mut() {
        adaptive.shutdown();
    }
}

fn uplink_stage(
    mut uplink: Option<UplinkClient>,
    upload_q: LossyQueue<UploadItem>,
    stop: StopFlag,
    failed: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) {
    let sup = StageSupervisor::default();
    sup.run(
        "uplink",
        &stop,
        || {
            let Some(item) = upload_q.pop(Duration::from_secs(1)) else {
                return Ok(());
            };
            let Some(client) = uplink.as_mut() else {
                return Ok(());
            };
            match client.send(&item) {
                Ok(()) => {
                    stats.uploads_sent.fetch_add(1, Ordering::Relaxed);
                    // link is up: opportunistically drain the spool
                    if let Err(e) = client.flush_spool() {
                        debug!("spool flush postponed: {:#}", e);
                    }
                }
                Err(e) => {
                    // best-effort by contract; the client already spooled it
                    debug!("uplink send failed: {:#}", e);
                }
            }
            Ok(())
        },
        || {
            failed.store(true, Ordering::Relaxed);
            stop.stop();
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::BatteryTelemetry;

    struct StubSnapshots;

    impl SnapshotSource for StubSnapshots {
        fn snapshot(&self) -> TelemetrySnapshot {
            TelemetrySnapshot {
                captured_unix_ms: (time::OffsetDateTime::now_utc().unix_timestamp_nanos()
                    / 1_000_000) as i64,
                lat: 21.03,
                lon: 105.81,
                alt_m: 80.0,
                roll: 0.0,
                pitch: 0.0,
                yaw: 0.0,
                ground_speed: 15.0,
                heading_deg: 90.0,
                battery: BatteryTelemetry::default(),
                fix_type: 3,
                sats: 12,
                hdop: 0.8,
                stale: false,
            }
        }
    }

    struct SyntheticCamera {
        frames_left: u32,
    }

    impl FrameSource for SyntheticCamera {
        fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
            if self.frames_left == 0 {
                std::thread::sleep(Duration::from_millis(5));
                return Ok(None);
            }
            self.frames_left -= 1;
            Ok(Some(Frame::from_bgr(64, 48, vec![0; 64 * 48 * 3])))
        }
    }

    #[test]
    fn pipeline_runs_and_stops_cleanly() {
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            PipelineDeps {
                frame_source: Some(Box::new(SyntheticCamera { frames_left: 100 })),
                snapshots: Arc::new(StubSnapshots),
                perception: None,
                mount: CameraMount::default(),
                ground_alt_msl: 0.0,
                uplink: None,
                mode_rx: None,
                messenger: None,
            },
        );
        let running = pipeline.start();
        std::thread::sleep(Duration::from_millis(300));

        let captured = running.stats().frames_captured.load(Ordering::Relaxed);
        let processed = running.stats().frames_processed.load(Ordering::Relaxed);
        assert!(captured > 0, "capture stage must have produced frames");
        assert!(processed > 0, "perception stage must have consumed frames");
        assert!(!running.failed());

        running.stop(Duration::from_secs(2));
    }

    #[test]
    fn packet_pairs_telemetry_within_the_iteration() {
        let snapshots = StubSnapshots;
        let frame = Frame::from_bgr(64, 48, vec![0; 64 * 48 * 3]);
        let telemetry = snapshots.snapshot();
        let packet = FramePacket {
            frame_id: 1,
            ts_unix_ms: frame.ts_unix_ms,
            frame,
            telemetry,
        };
        let skew = packet.capture_skew_ms();
        assert!((0..=100).contains(&skew), "skew {} ms", skew);
    }
}
