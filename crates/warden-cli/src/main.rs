use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use warden_fc::autodetect::{autodetect_fc, default_candidate_bauds, default_candidate_devs};
use warden_fc::gateway::CommandGateway;
use warden_fc::link::{FcEvent, FcLink};
use warden_fc::rc::{RcMapConfig, RcSwitches};
use warden_fc::reader::{spawn_reader, EventTaps};
use warden_fc::telemetry::TelemetryCell;
use warden_fc::FcConfig;
use warden_nav::geo::GeoPoint;
use warden_nav::geofence::{FenceAction, GeofencingSystem};
use warden_nav::geolocate::CameraMount;
use warden_nav::{doctor as nav_doctor, mission};
use warden_proto::modes::{DetectRate, MissionMode};
use warden_proto::{PilotMessenger, Severity, SnapshotSource, TelemetrySnapshot};
use warden_runtime::pipeline::{Pipeline, PipelineConfig, PipelineDeps};
use warden_runtime::supervise::StopFlag;
use warden_runtime::watchdog::Watchdog;
use warden_safety::battery::{
    emergency_landing_site, BatteryFailsafe, BatteryParams, BatteryState, FailsafeDecision,
    FlightState,
};
use warden_safety::gpsmon::{GpsMonitorConfig, GpsReading, GpsWatch, ImuReading};
use warden_uplink::{UplinkClient, UplinkConfig};
use warden_vision::adaptive::AdaptiveDetector;
use warden_vision::camera::{CameraConfig, FrameSource, SubprocessCamera};
use warden_vision::hybrid::{HybridTracker, VerifyConfig};
use warden_vision::modes::ModeController;
use warden_vision::tracker::{KinematicTracker, Tracker};
use warden_vision::{Detector, VisionConfig};

#[derive(Debug, Parser)]
#[command(name = "skywarden", version, about = "SkyWarden - fixed-wing UAV companion supervisor")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and the attached hardware paths.
    Doctor,
    /// Run the companion: pipeline, safety monitors, FC link.
    Run,
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
    Geofence {
        #[command(subcommand)]
        cmd: GeofenceCmd,
    },
    Mission {
        #[command(subcommand)]
        cmd: MissionCmd,
    },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
}

#[derive(Debug, Subcommand)]
enum GeofenceCmd {
    /// Evaluate one position against the configured fences.
    Check {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lon: f64,
        #[arg(long, default_value_t = 50.0)]
        alt: f64,
    },
    /// List the configured fences.
    Show,
}

#[derive(Debug, Subcommand)]
enum MissionCmd {
    /// Parse a QGC WPL 110 file and summarize it.
    Inspect { path: String },
}

// ---- configuration ----

#[derive(Debug, serde::Deserialize)]
struct Config {
    system: Option<SystemCfg>,
    fc: Option<FcConfig>,
    rc: Option<RcMapConfig>,
    camera: Option<CameraConfig>,
    vision: Option<VisionConfig>,
    tracking: Option<TrackingCfg>,
    mount: Option<CameraMount>,
    geofence: GeofenceCfg,
    battery: Option<BatteryCfg>,
    gps_monitor: Option<GpsMonitorCfg>,
    uplink: Option<UplinkConfig>,
    pipeline: Option<PipelineConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct SystemCfg {
    watchdog_timeout_s: Option<u64>,
    ground_alt_msl: Option<f64>,
}

#[derive(Debug, serde::Deserialize)]
struct TrackingCfg {
    /// "kinematic" is built in; visual backends are linked externally.
    tracker: String,
    coast_frames: Option<u32>,
    verify: Option<VerifyConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct GeofenceCfg {
    /// JSON fence file; inline home/max_distance are the fallback.
    file: Option<String>,
    home_lat: Option<f64>,
    home_lon: Option<f64>,
    max_distance_m: Option<f64>,
    warning_distance_m: Option<f64>,
}

#[derive(Debug, serde::Deserialize)]
struct BatteryCfg {
    enable: bool,
    #[serde(flatten)]
    params: BatteryParams,
}

#[derive(Debug, serde::Deserialize)]
struct GpsMonitorCfg {
    enable: bool,
    #[serde(flatten)]
    monitor: GpsMonitorConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

fn build_geofence(cfg: &GeofenceCfg) -> Result<GeofencingSystem> {
    let home = GeoPoint::new(
        cfg.home_lat.context("geofence.home_lat missing")?,
        cfg.home_lon.context("geofence.home_lon missing")?,
    );
    let mut sys = GeofencingSystem::new(home, cfg.max_distance_m.unwrap_or(1000.0));
    if let Some(w) = cfg.warning_distance_m {
        sys.warning_distance_m = w;
    }
    if let Some(file) = &cfg.file {
        sys.load_from_file(file)
            .with_context(|| format!("load geofence file {}", file))?;
    }
    Ok(sys)
}

/// Inference backends are linked by the integrator; the stock build carries
/// none, so enabling vision without one is a setup error.
fn build_detector(cfg: &VisionConfig) -> Result<Box<dyn Detector>> {
    anyhow::bail!(
        "vision backend '{}' not available in this build; link a detector backend",
        cfg.backend
    )
}

fn build_tracker(cfg: &TrackingCfg) -> Result<Box<dyn Tracker>> {
    match cfg.tracker.as_str() {
        "kinematic" => Ok(Box::new(KinematicTracker::new(
            cfg.coast_frames.unwrap_or(90),
        ))),
        other => anyhow::bail!("tracker backend '{}' not available in this build", other),
    }
}

// ---- signal handling (plain threads, no async runtime) ----

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

/// Stand-in snapshot source when the FC link is disabled: always stale, so
/// nothing downstream trusts it.
struct NoFcSnapshots;

impl SnapshotSource for NoFcSnapshots {
    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            captured_unix_ms: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
                as i64,
            lat: 0.0,
            lon: 0.0,
            alt_m: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            ground_speed: 0.0,
            heading_deg: 0.0,
            battery: Default::default(),
            fix_type: 0,
            sats: 0,
            hdop: 99.9,
            stale: true,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("setup failed: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let cfg = load_config(&cli.config)?;
    match cli.cmd {
        Command::Doctor => {
            doctor(&cfg)?;
            Ok(0)
        }
        Command::Run => run(cfg),
        Command::Fc { cmd } => fc_cmd(&cfg, cmd),
        Command::Geofence { cmd } => geofence_cmd(&cfg, cmd),
        Command::Mission { cmd } => mission_cmd(cmd),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let geofence = build_geofence(&cfg.geofence)?;
    nav_doctor::check_geofence(&geofence)?;

    if let Some(gm) = &cfg.gps_monitor {
        if gm.enable {
            nav_doctor::check_gps_thresholds(gm.monitor.min_sats, gm.monitor.max_hdop)?;
        }
    }

    if let Some(b) = &cfg.battery {
        if b.enable {
            anyhow::ensure!(b.params.capacity_mah > 0.0, "battery.capacity_mah invalid");
            anyhow::ensure!(b.params.cells > 0, "battery.cells invalid");
            anyhow::ensure!(
                b.params.cruise_speed_ms > 0.0 && b.params.vertical_speed_ms > 0.0,
                "battery speeds invalid"
            );
        }
    }

    if let Some(fc) = &cfg.fc {
        if fc.enable && !fc.autodetect {
            anyhow::ensure!(
                fc.serial_dev.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
                "fc.serial_dev missing (autodetect=false)"
            );
            anyhow::ensure!(fc.baud.unwrap_or(0) > 0, "fc.baud invalid");
        }
    }

    if let Some(v) = &cfg.vision {
        if v.enable {
            anyhow::ensure!(
                cfg.camera.is_some(),
                "vision enabled but [camera] section missing"
            );
            // surfaces the missing-backend error before flight, not in the air
            build_detector(v)?;
        }
    }

    if let Some(u) = &cfg.uplink {
        if u.enable {
            std::fs::create_dir_all(&u.spool_dir).context("create uplink spool dir")?;
        }
    }

    info!("doctor: OK");
    Ok(())
}

fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<i32> {
    match cmd {
        FcCmd::Autodetect => {
            let fc = cfg.fc.as_ref().context("no [fc] config section")?;
            anyhow::ensure!(fc.enable, "fc.enable=false");
            let res = run_fc_autodetect(fc)?;
            match res.chosen {
                Some((dev, baud)) => println!("CHOSEN: {} @ {}", dev, baud),
                None => println!("CHOSEN: none"),
            }
            for p in res.probes {
                println!(
                    "probe dev={} baud={} hb={} {}ms note={}",
                    p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note
                );
            }
            Ok(0)
        }
    }
}

fn geofence_cmd(cfg: &Config, cmd: GeofenceCmd) -> Result<i32> {
    let mut sys = build_geofence(&cfg.geofence)?;
    match cmd {
        GeofenceCmd::Check { lat, lon, alt } => {
            let check = sys.check_position(GeoPoint::new(lat, lon), alt);
            println!("safe={}", check.safe);
            println!("message={}", check.message);
            if let Some(action) = check.action {
                println!("action={:?}", action);
            }
            if let Some(p) = sys.safe_return_point(GeoPoint::new(lat, lon), alt) {
                println!("safe_return={:.6},{:.6}", p.lat, p.lon);
            }
            Ok(0)
        }
        GeofenceCmd::Show => {
            println!(
                "home={:.6},{:.6} max_distance={}m",
                sys.home().lat,
                sys.home().lon,
                sys.max_distance_m()
            );
            for f in sys.fences() {
                println!(
                    "fence name={} kind={} vertices={} alt={}..{}",
                    f.name,
                    if f.is_exclusion { "exclusion" } else { "inclusion" },
                    f.points.len(),
                    f.altitude_min,
                    f.altitude_max
                );
            }
            Ok(0)
        }
    }
}

fn mission_cmd(cmd: MissionCmd) -> Result<i32> {
    match cmd {
        MissionCmd::Inspect { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("read mission file {}", path))?;
            let plan = mission::parse_wpl(&text)?;
            match plan.home() {
                Some(home) => println!("home={:.6},{:.6} alt={}", home.lat, home.lon, home.alt),
                None => println!("home=<missing seq 0>"),
            }
            println!("waypoints={}", plan.waypoints().count());
            for w in plan.waypoints() {
                println!(
                    "wp seq={} cmd={} lat={:.6} lon={:.6} alt={:.1}",
                    w.seq, w.command, w.lat, w.lon, w.alt
                );
            }
            Ok(0)
        }
    }
}

fn run_fc_autodetect(fc: &FcConfig) -> Result<warden_fc::autodetect::AutodetectResult> {
    let devs = fc.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    let bauds = fc.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    let timeout = Duration::from_millis(fc.heartbeat_timeout_ms.unwrap_or(1500));
    autodetect_fc(
        devs,
        bauds,
        timeout,
        fc.sys_id,
        fc.comp_id,
        fc.target_sys,
        fc.target_comp,
    )
}

fn resolve_fc_port(fc: &FcConfig) -> Result<(String, u32)> {
    if fc.autodetect {
        let res = run_fc_autodetect(fc)?;
        res.chosen.context("fc autodetect failed: no heartbeat found")
    } else {
        let dev = fc
            .serial_dev
            .clone()
            .context("fc.serial_dev missing (autodetect=false)")?;
        let baud = fc.baud.context("fc.baud missing (autodetect=false)")?;
        Ok((dev, baud))
    }
}

fn run(cfg: Config) -> Result<i32> {
    info!("run: starting");
    install_signal_handlers();

    let system = cfg.system.as_ref();
    let watchdog_timeout =
        Duration::from_secs(system.and_then(|s| s.watchdog_timeout_s).unwrap_or(15));
    let ground_alt_msl = system.and_then(|s| s.ground_alt_msl).unwrap_or(0.0);

    let geofence = build_geofence(&cfg.geofence)?;
    nav_doctor::check_geofence(&geofence)?;

    // ---- FC link (fatal when enabled but unreachable) ----
    let reader_stop = Arc::new(AtomicBool::new(false));
    let mut reader_handle = None;
    let mut gateway: Option<Arc<CommandGateway>> = None;
    let mut sensors_rx = None;
    let mut rc_rx = None;

    let snapshots: Arc<dyn SnapshotSource> = if let Some(fc) = cfg.fc.as_ref().filter(|f| f.enable)
    {
        let (dev, baud) = resolve_fc_port(fc)?;
        let link = Arc::new(
            if dev.contains(':') {
                FcLink::open_url(&dev, fc.sys_id, fc.comp_id, fc.target_sys, fc.target_comp)
            } else {
                FcLink::open_serial(&dev, baud, fc.sys_id, fc.comp_id, fc.target_sys, fc.target_comp)
            }
            .context("FC open")?,
        );
        info!(dev = dev.as_str(), baud, "FC link up");

        let cell = Arc::new(TelemetryCell::new(Duration::from_millis(
            fc.stale_after_ms.unwrap_or(1000),
        )));
        let (sensors_tx, srx) = crossbeam_channel::bounded::<FcEvent>(64);
        let (rc_tx, rrx) = crossbeam_channel::bounded::<FcEvent>(8);
        sensors_rx = Some(srx);
        rc_rx = Some(rrx);
        reader_handle = Some(spawn_reader(
            link.clone(),
            cell.clone(),
            EventTaps {
                sensors: Some(sensors_tx),
                rc: Some(rc_tx),
            },
            reader_stop.clone(),
        ));

        let gw = Arc::new(CommandGateway::new(
            link,
            cell.clone(),
            fc.require_heartbeat,
        ));
        gateway = Some(gw);
        cell
    } else {
        warn!("FC link disabled; safety monitors are idle");
        Arc::new(NoFcSnapshots)
    };

    // ---- perception stack ----
    let frame_source: Option<Box<dyn FrameSource>> = match &cfg.camera {
        Some(cam) => Some(Box::new(SubprocessCamera::new(cam.clone())?)),
        None => None,
    };

    let perception: Option<AdaptiveDetector> = match cfg.vision.as_ref().filter(|v| v.enable) {
        Some(vision) => {
            let tracking = cfg.tracking.as_ref().context("[tracking] section missing")?;
            let detector = build_detector(vision)?;
            let verifier_detector = build_detector(vision)?;
            let tracker = build_tracker(tracking)?;
            let hybrid = HybridTracker::spawn(
                tracker,
                verifier_detector,
                tracking.verify.clone().unwrap_or_default(),
            );
            let modes = ModeController::new(HashMap::new());
            Some(AdaptiveDetector::new(detector, hybrid, modes))
        }
        None => None,
    };

    let uplink = match cfg.uplink.as_ref().filter(|u| u.enable) {
        Some(u) => Some(UplinkClient::new(u)?),
        None => None,
    };

    // ---- mode channel: RC decode feeds the perception stage ----
    let (mode_tx, mode_rx) = crossbeam_channel::bounded::<(MissionMode, DetectRate, bool)>(8);

    // ---- safety loop ----
    let safety_stop = StopFlag::new();
    let safety_handle = gateway.as_ref().map(|gw| {
        spawn_safety_loop(
            gw.clone(),
            snapshots.clone(),
            geofence,
            cfg.battery.as_ref().filter(|b| b.enable).map(|b| b.params.clone()),
            cfg.gps_monitor.as_ref().filter(|g| g.enable).map(|g| g.monitor.clone()),
            cfg.rc.clone().unwrap_or_default(),
            sensors_rx.take(),
            rc_rx.take(),
            mode_tx,
            safety_stop.clone(),
        )
    });

    // ---- pipeline ----
    let pipeline = Pipeline::new(
        cfg.pipeline.clone().unwrap_or_default(),
        PipelineDeps {
            frame_source,
            snapshots,
            perception,
            mount: cfg.mount.unwrap_or_default(),
            ground_alt_msl,
            uplink,
            mode_rx: Some(mode_rx),
            messenger: gateway
                .as_ref()
                .map(|g| g.clone() as Arc<dyn PilotMessenger>),
        },
    );
    let running = pipeline.start();

    // Watchdog: kicked from this loop; a stall restarts the companion.
    let watchdog = Watchdog::start(watchdog_timeout, || {
        eprintln!("watchdog timeout - requesting restart");
        std::process::exit(2);
    });

    let mut exit_code = 0;
    while !STOP_REQUESTED.load(Ordering::SeqCst) {
        watchdog.kick();
        if running.failed() {
            error!("pipeline reported repeated stage failures");
            exit_code = 2;
            break;
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    // teardown in reverse order of acquisition
    info!("run: shutting down");
    watchdog.stop();
    running.stop(Duration::from_secs(2));
    safety_stop.stop();
    if let Some(h) = safety_handle {
        let _ = h.join();
    }
    reader_stop.store(true, Ordering::SeqCst);
    if let Some(h) = reader_handle {
        // the reader may be blocked in a serial read; detach if so
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        std::thread::spawn(move || {
            let _ = h.join();
            let _ = tx.send(());
        });
        let _ = rx.recv_timeout(Duration::from_secs(2));
    }

    info!("run: shutdown complete");
    Ok(exit_code)
}

#[allow(clippy::too_many_arguments)]
fn spawn_safety_loop(
    gateway: Arc<CommandGateway>,
    snapshots: Arc<dyn SnapshotSource>,
    mut geofence: GeofencingSystem,
    battery_params: Option<BatteryParams>,
    gps_cfg: Option<GpsMonitorConfig>,
    rc_map: RcMapConfig,
    sensors_rx: Option<crossbeam_channel::Receiver<FcEvent>>,
    rc_rx: Option<crossbeam_channel::Receiver<FcEvent>>,
    mode_tx: crossbeam_channel::Sender<(MissionMode, DetectRate, bool)>,
    stop: StopFlag,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        info!("safety loop started");
        let messenger: Arc<dyn PilotMessenger> = gateway.clone();

        let mut gps_watch = gps_cfg.map(|cfg| {
            let mut watch = GpsWatch::new(cfg, messenger.clone());
            watch.monitor.set_home(geofence.home());
            watch
        });
        let mut battery = battery_params.map(BatteryFailsafe::new);
        let mut last_fence_check = Instant::now();

        while !stop.is_set() {
            // drain sensor events
            if let Some(rx) = &sensors_rx {
                while let Ok(ev) = rx.try_recv() {
                    match ev {
                        FcEvent::Gps {
                            lat,
                            lon,
                            alt_m,
                            fix_type,
                            sats,
                            hdop,
                            ground_speed,
                            heading_deg,
                        } => {
                            if let Some(watch) = gps_watch.as_mut() {
                                let reading = GpsReading {
                                    ts_unix_ms: (time::OffsetDateTime::now_utc()
                                        .unix_timestamp_nanos()
                                        / 1_000_000)
                                        as i64,
                                    lat,
                                    lon,
                                    alt_m,
                                    ground_speed,
                                    heading_deg,
                                    sats,
                                    hdop,
                                    fix_type,
                                };
                                watch.on_reading(reading);
                            }
                        }
                        FcEvent::Imu {
                            accel_x,
                            accel_y,
                            accel_z,
                        } => {
                            if let Some(watch) = gps_watch.as_mut() {
                                watch.on_imu(ImuReading {
                                    ts_unix_ms: (time::OffsetDateTime::now_utc()
                                        .unix_timestamp_nanos()
                                        / 1_000_000)
                                        as i64,
                                    accel_x,
                                    accel_y,
                                    accel_z,
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }

            // forward pilot mode requests to perception
            if let Some(rx) = &rc_rx {
                while let Ok(FcEvent::RcChannels { ch5, ch6, ch7, ch8 }) = rx.try_recv() {
                    let req = rc_map.decode(RcSwitches { ch5, ch6, ch7, ch8 });
                    let _ = mode_tx.try_send((req.mode, req.rate, req.emergency));
                }
            }

            let snapshot = snapshots.snapshot();
            // stale telemetry never drives a safety decision
            if !snapshot.stale {
                if last_fence_check.elapsed() >= Duration::from_millis(500) {
                    last_fence_check = Instant::now();
                    run_fence_check(&mut geofence, &gateway, &snapshot);
                }
                if let Some(fs) = battery.as_mut() {
                    run_battery_check(fs, &geofence, &gateway, &snapshot);
                }
            }

            std::thread::sleep(Duration::from_millis(100));
        }
        info!("safety loop stopped");
    })
}

fn run_fence_check(
    geofence: &mut GeofencingSystem,
    gateway: &Arc<CommandGateway>,
    snapshot: &TelemetrySnapshot,
) {
    let position = GeoPoint::new(snapshot.lat, snapshot.lon);
    let check = geofence.check_position(position, snapshot.alt_m);
    if check.safe || !check.should_alert {
        return;
    }

    error!(message = check.message.as_str(), "fence violation");
    gateway.status_text(&check.message, Severity::Warning);

    match check.action {
        Some(FenceAction::Rth) => {
            let _ = gateway.rth();
        }
        Some(FenceAction::GuidedReturn) => {
            match geofence.safe_return_point(position, snapshot.alt_m) {
                Some(p) => {
                    let _ = gateway.goto(p.lat, p.lon, snapshot.alt_m as f32);
                }
                None => {
                    // no computable safe point: fall back to RTH
                    let _ = gateway.rth();
                }
            }
        }
        Some(FenceAction::Loiter) => {
            let _ = gateway.set_mode("LOITER");
        }
        Some(FenceAction::Land) => {
            let _ = gateway.land();
        }
        Some(FenceAction::Warn) | None => {}
    }
}

fn run_battery_check(
    failsafe: &mut BatteryFailsafe,
    geofence: &GeofencingSystem,
    gateway: &Arc<CommandGateway>,
    snapshot: &TelemetrySnapshot,
) {
    let state = BatteryState {
        voltage: snapshot.battery.voltage_v as f64,
        current: snapshot.battery.current_a as f64,
        remaining_pct: snapshot.battery.remaining_pct,
        consumed_mah: snapshot.battery.consumed_mah as f64,
    };
    let flight = FlightState {
        position: GeoPoint::new(snapshot.lat, snapshot.lon),
        altitude_m: snapshot.alt_m,
        ground_speed: snapshot.ground_speed as f64,
        heading_deg: snapshot.heading_deg as f64,
        home: geofence.home(),
        home_altitude_m: 0.0,
    };

    let Some(decision) = failsafe.check(&state, &flight) else {
        return;
    };
    match decision {
        FailsafeDecision::Ok { .. } => {}
        FailsafeDecision::Warn { margin } => {
            gateway.status_text(
                &format!("BATT margin {:.0}%", margin * 100.0),
                Severity::Warning,
            );
        }
        FailsafeDecision::RthNow { margin } => {
            gateway.status_text(
                &format!("BATT LOW margin {:.0}% RTH", margin * 100.0),
                Severity::Critical,
            );
            let _ = gateway.rth();
        }
        FailsafeDecision::LandNow { reason } => {
            gateway.status_text(&format!("BATT FAILSAFE {}", reason), Severity::Critical);
            match emergency_landing_site(flight.position) {
                Some(site) => {
                    let _ = gateway.goto(site.lat, site.lon, (snapshot.alt_m - 10.0) as f32);
                    let _ = gateway.land();
                }
                None => {
                    let _ = gateway.land();
                }
            }
        }
    }
}
