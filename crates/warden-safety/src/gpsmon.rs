//! GPS-denial monitor. The companion never flies blind: this code detects
//! anomalies by cross-checking each GPS update against history and the IMU,
//! then alerts the pilot. It issues no motion commands.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use warden_nav::geo::{bearing_deg, haversine_m, GeoPoint};
use warden_proto::{PilotMessenger, Severity};

#[derive(Debug, Clone, Copy)]
pub struct GpsReading {
    pub ts_unix_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub ground_speed: f32,
    pub heading_deg: f32,
    pub sats: u8,
    pub hdop: f32,
    pub fix_type: u8,
}

impl GpsReading {
    pub fn is_valid(&self) -> bool {
        self.fix_type >= 3 && self.sats >= 6 && self.hdop < 3.0
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImuReading {
    pub ts_unix_ms: i64,
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsStatus {
    Ok,
    Degraded,
    Lost,
    Recovered,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsMonitorConfig {
    pub max_position_jump_m: f64,
    pub velocity_mismatch_ms: f32,
    pub min_sats: u8,
    pub max_hdop: f32,
    pub sat_drop_threshold: u8,
    /// Exponential decay applied to the anomaly score on every update.
    pub decay: f64,
    pub degraded_score: f64,
    pub lost_score: f64,
    pub consecutive_for_lost: u32,
}

impl Default for GpsMonitorConfig {
    fn default() -> Self {
        Self {
            max_position_jump_m: 50.0,
            velocity_mismatch_ms: 10.0,
            min_sats: 6,
            max_hdop: 3.0,
            sat_drop_threshold: 4,
            decay: 0.85,
            degraded_score: 20.0,
            lost_score: 50.0,
            consecutive_for_lost: 3,
        }
    }
}

const GPS_HISTORY: usize = 100;
const IMU_HISTORY: usize = 500;

/// Anomaly scoring over bounded GPS/IMU rings. Single writer; readers get
/// values, never iterators into the rings.
pub struct GpsDenialMonitor {
    cfg: GpsMonitorConfig,
    home: Option<GeoPoint>,

    gps_history: VecDeque<GpsReading>,
    imu_history: VecDeque<ImuReading>,

    score: f64,
    consecutive_bad: u32,
    status: GpsStatus,
    was_lost: bool,
    lost_since_ms: Option<i64>,
    last_valid: Option<GpsReading>,
}

impl GpsDenialMonitor {
    pub fn new(cfg: GpsMonitorConfig) -> Self {
        Self {
            cfg,
            home: None,
            gps_history: VecDeque::with_capacity(GPS_HISTORY),
            imu_history: VecDeque::with_capacity(IMU_HISTORY),
            score: 0.0,
            consecutive_bad: 0,
            status: GpsStatus::Ok,
            was_lost: false,
            lost_since_ms: None,
            last_valid: None,
        }
    }

    pub fn set_home(&mut self, home: GeoPoint) {
        info!(lat = home.lat, lon = home.lon, "gps monitor home set");
        self.home = Some(home);
    }

    pub fn status(&self) -> GpsStatus {
        self.status
    }

    pub fn anomaly_score(&self) -> f64 {
        self.score
    }

    pub fn update_imu(&mut self, reading: ImuReading) {
        if self.imu_history.len() == IMU_HISTORY {
            self.imu_history.pop_front();
        }
        self.imu_history.push_back(reading);
    }

    /// Score one GPS update and advance the state machine.
    pub fn update(&mut self, gps: GpsReading) -> (GpsStatus, String) {
        let mut anomalies: Vec<String> = Vec::new();
        let mut delta = 0.0;

        if let Some(prev) = self.gps_history.back().copied() {
            let dt = (gps.ts_unix_ms - prev.ts_unix_ms) as f64 / 1000.0;
            if dt > 0.0 && dt < 5.0 {
                // position jump beyond what the previous speed explains
                let jump = haversine_m(prev.position(), gps.position());
                let expected = (prev.ground_speed as f64 * dt * 3.0).max(self.cfg.max_position_jump_m);
                if jump > expected {
                    anomalies.push(format!("position jump {:.0}m", jump));
                    delta += 30.0;
                }

                // GPS speed vs IMU-propagated speed
                if let Some(imu_speed) = self.imu_speed_estimate(prev.ground_speed, dt) {
                    let mismatch = (gps.ground_speed - imu_speed).abs();
                    if mismatch > self.cfg.velocity_mismatch_ms {
                        anomalies.push(format!(
                            "velocity mismatch: gps={:.1} imu={:.1}",
                            gps.ground_speed, imu_speed
                        ));
                        delta += 20.0;
                    }
                }

                // satellite count collapse
                if prev.sats.saturating_sub(gps.sats) >= self.cfg.sat_drop_threshold {
                    anomalies.push(format!("satellites {}->{}", prev.sats, gps.sats));
                    delta += 25.0;
                }

                // HDOP crossing the quality threshold
                if gps.hdop > self.cfg.max_hdop && prev.hdop <= self.cfg.max_hdop {
                    anomalies.push(format!("hdop {:.1}", gps.hdop));
                    delta += 15.0;
                }
            }
        }

        if gps.sats < self.cfg.min_sats {
            anomalies.push(format!("low satellites: {}", gps.sats));
            delta += 10.0;
        }
        if gps.fix_type < 3 {
            anomalies.push("no 3D fix".into());
            delta += 20.0;
        }

        self.score = (self.score * self.cfg.decay + delta).max(0.0);

        if self.gps_history.len() == GPS_HISTORY {
            self.gps_history.pop_front();
        }
        self.gps_history.push_back(gps);

        // only anomalous updates count toward confirmation
        if delta > 0.0 {
            self.consecutive_bad += 1;
        } else {
            self.consecutive_bad = 0;
        }

        if self.score >= self.cfg.lost_score
            && self.consecutive_bad >= self.cfg.consecutive_for_lost
        {
            if self.status != GpsStatus::Lost {
                self.lost_since_ms = Some(gps.ts_unix_ms);
            }
            self.status = GpsStatus::Lost;
            self.was_lost = true;
        } else if self.score >= self.cfg.degraded_score {
            // suspected or degraded; a confirmed loss holds until the score
            // clears entirely
            if self.status != GpsStatus::Lost {
                self.status = GpsStatus::Degraded;
            }
        } else {
            if self.was_lost {
                self.status = GpsStatus::Recovered;
                self.was_lost = false;
                self.lost_since_ms = None;
            } else {
                self.status = GpsStatus::Ok;
            }
            if gps.is_valid() {
                self.last_valid = Some(gps);
            }
        }

        let message = if !anomalies.is_empty() {
            anomalies.join("; ")
        } else {
            match self.status {
                GpsStatus::Ok => format!("GPS OK - {} sats, HDOP {:.1}", gps.sats, gps.hdop),
                GpsStatus::Recovered => "GPS recovered".into(),
                _ => format!("score {:.0}", self.score),
            }
        };
        (self.status, message)
    }

    fn imu_speed_estimate(&self, prev_speed: f32, dt: f64) -> Option<f32> {
        if self.imu_history.len() < 2 {
            return None;
        }
        let recent: Vec<&ImuReading> = self.imu_history.iter().rev().take(10).collect();
        let n = recent.len() as f32;
        let ax = recent.iter().map(|r| r.accel_x).sum::<f32>() / n;
        let ay = recent.iter().map(|r| r.accel_y).sum::<f32>() / n;
        let horiz = (ax * ax + ay * ay).sqrt();
        Some(prev_speed + horiz * dt as f32)
    }

    /// OSD overlay helpers, from the last fix the monitor still trusts.
    pub fn heading_to_home(&self) -> Option<f64> {
        let home = self.home?;
        let last = self.last_valid?;
        Some(bearing_deg(last.position(), home))
    }

    pub fn distance_to_home(&self) -> Option<f64> {
        let home = self.home?;
        let last = self.last_valid?;
        Some(haversine_m(last.position(), home))
    }

    pub fn time_lost_s(&self, now_ms: i64) -> Option<f64> {
        self.lost_since_ms.map(|t| (now_ms - t) as f64 / 1000.0)
    }
}

/// Rate-limited pilot alerting, one cadence per alert kind.
pub struct PilotAlerter {
    messenger: Arc<dyn PilotMessenger>,
    last_alert: HashMap<&'static str, Instant>,
    interval: Duration,
}

impl PilotAlerter {
    pub fn new(messenger: Arc<dyn PilotMessenger>) -> Self {
        Self {
            messenger,
            last_alert: HashMap::new(),
            interval: Duration::from_secs(5),
        }
    }

    fn permitted(&mut self, kind: &'static str) -> bool {
        let now = Instant::now();
        if let Some(t) = self.last_alert.get(kind) {
            if now.duration_since(*t) < self.interval {
                return false;
            }
        }
        self.last_alert.insert(kind, now);
        true
    }

    pub fn gps_lost(&mut self, heading_home: Option<f64>, distance_home: Option<f64>) {
        if !self.permitted("gps_lost") {
            return;
        }
        let mut msg = "GPS LOST! Fly manual".to_string();
        if let Some(h) = heading_home {
            msg.push_str(&format!(" HOME {:.0}deg", h));
        }
        if let Some(d) = distance_home {
            msg.push_str(&format!(" {:.1}km", d / 1000.0));
        }
        self.messenger.status_text(&msg, Severity::Critical);
        self.messenger.suggest_mode("FBWA");
    }

    pub fn gps_degraded(&mut self, score: f64) {
        if !self.permitted("gps_degraded") {
            return;
        }
        self.messenger
            .status_text(&format!("GPS DEGRADED score {:.0}", score), Severity::Warning);
    }

    pub fn gps_recovered(&mut self) {
        // one-shot by state machine design, no cadence needed
        self.messenger
            .status_text("GPS RECOVERED - RTL available", Severity::Info);
    }
}

/// Monitor + alerter glued to the status transitions. This is the unit the
/// safety loop drives; it emits pilot messages and nothing else.
pub struct GpsWatch {
    pub monitor: GpsDenialMonitor,
    alerter: PilotAlerter,
}

impl GpsWatch {
    pub fn new(cfg: GpsMonitorConfig, messenger: Arc<dyn PilotMessenger>) -> Self {
        Self {
            monitor: GpsDenialMonitor::new(cfg),
            alerter: PilotAlerter::new(messenger),
        }
    }

    pub fn on_imu(&mut self, imu: ImuReading) {
        self.monitor.update_imu(imu);
    }

    pub fn on_reading(&mut self, gps: GpsReading) -> GpsStatus {
        let prev = self.monitor.status();
        let (status, message) = self.monitor.update(gps);
        if status != prev {
            warn!(?prev, ?status, message = message.as_str(), "gps status change");
            match status {
                GpsStatus::Lost => {
                    self.alerter.gps_lost(
                        self.monitor.heading_to_home(),
                        self.monitor.distance_to_home(),
                    );
                }
                GpsStatus::Degraded => self.alerter.gps_degraded(self.monitor.anomaly_score()),
                GpsStatus::Recovered => self.alerter.gps_recovered(),
                GpsStatus::Ok => {}
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMessenger {
        texts: Mutex<Vec<(String, Severity)>>,
        modes: Mutex<Vec<String>>,
    }

    impl PilotMessenger for FakeMessenger {
        fn status_text(&self, msg: &str, severity: Severity) {
            self.texts.lock().unwrap().push((msg.to_string(), severity));
        }
        fn suggest_mode(&self, mode: &str) {
            self.modes.lock().unwrap().push(mode.to_string());
        }
    }

    fn good(ts_s: i64, lat: f64) -> GpsReading {
        GpsReading {
            ts_unix_ms: ts_s * 1000,
            lat,
            lon: 105.8,
            alt_m: 80.0,
            ground_speed: 15.0,
            heading_deg: 90.0,
            sats: 12,
            hdop: 0.8,
            fix_type: 3,
        }
    }

    /// ~120 m jump north of the previous position with degraded reception.
    fn jammed(ts_s: i64, prev_lat: f64) -> GpsReading {
        GpsReading {
            ts_unix_ms: ts_s * 1000,
            lat: prev_lat + 120.0 / 111_000.0,
            lon: 105.8,
            alt_m: 80.0,
            ground_speed: 15.0,
            heading_deg: 90.0,
            sats: 5,
            hdop: 4.0,
            fix_type: 2,
        }
    }

    #[test]
    fn good_readings_keep_score_at_zero() {
        let mut mon = GpsDenialMonitor::new(GpsMonitorConfig::default());
        let mut last = 0.0;
        for i in 0..10 {
            // ~15 m/s eastward drift is consistent with ground speed
            let (status, _) = mon.update(good(i, 21.03));
            assert_eq!(status, GpsStatus::Ok);
            assert!(mon.anomaly_score() <= last || mon.anomaly_score() == 0.0);
            last = mon.anomaly_score();
        }
        assert_eq!(mon.anomaly_score(), 0.0);
    }

    #[test]
    fn score_only_decays_on_clean_readings() {
        let mut mon = GpsDenialMonitor::new(GpsMonitorConfig::default());
        for i in 0..5 {
            mon.update(good(i, 21.03));
        }
        let jam_lat = 21.03;
        mon.update(jammed(5, jam_lat));
        let settled_lat = jam_lat + 120.0 / 111_000.0;
        let spiked = mon.anomaly_score();
        assert!(spiked >= 50.0, "score after jam onset: {}", spiked);

        // clean readings from the new position: the score must never rise
        let mut prev = spiked;
        for i in 6..20 {
            mon.update(good(i, settled_lat));
            assert!(mon.anomaly_score() <= prev);
            prev = mon.anomaly_score();
        }
        assert_eq!(mon.status(), GpsStatus::Ok);
    }

    #[test]
    fn lost_requires_three_consecutive_bad_updates() {
        let mut mon = GpsDenialMonitor::new(GpsMonitorConfig::default());
        for i in 0..10 {
            mon.update(good(i, 21.03));
        }
        let mut lat = 21.03;
        let (s1, _) = mon.update(jammed(10, lat));
        lat += 120.0 / 111_000.0;
        assert_ne!(s1, GpsStatus::Lost);
        let (s2, _) = mon.update(jammed(11, lat));
        lat += 120.0 / 111_000.0;
        assert_ne!(s2, GpsStatus::Lost);
        let (s3, _) = mon.update(jammed(12, lat));
        assert_eq!(s3, GpsStatus::Lost);
    }

    #[test]
    fn gps_lost_emits_one_critical_with_bearing_and_no_commands() {
        let messenger = Arc::new(FakeMessenger::default());
        let mut watch = GpsWatch::new(GpsMonitorConfig::default(), messenger.clone());
        watch.monitor.set_home(GeoPoint::new(21.028511, 105.804817));

        for i in 0..10 {
            watch.on_reading(good(i, 21.03));
        }
        let mut lat = 21.03;
        for i in 10..13 {
            watch.on_reading(jammed(i, lat));
            lat += 120.0 / 111_000.0;
        }
        assert_eq!(watch.monitor.status(), GpsStatus::Lost);

        let texts = messenger.texts.lock().unwrap();
        let criticals: Vec<_> = texts
            .iter()
            .filter(|(_, sev)| *sev == Severity::Critical)
            .collect();
        assert_eq!(criticals.len(), 1, "exactly one critical alert: {:?}", *texts);
        assert!(criticals[0].0.contains("GPS LOST"));
        assert!(criticals[0].0.contains("HOME"), "bearing in {:?}", criticals[0].0);
        // advisory only: a mode suggestion, never an FC motion command
        assert_eq!(*messenger.modes.lock().unwrap(), vec!["FBWA".to_string()]);
    }

    #[test]
    fn recovery_emits_one_shot_info() {
        let messenger = Arc::new(FakeMessenger::default());
        let mut watch = GpsWatch::new(GpsMonitorConfig::default(), messenger.clone());
        watch.monitor.set_home(GeoPoint::new(21.0285, 105.8048));

        for i in 0..10 {
            watch.on_reading(good(i, 21.03));
        }
        let mut lat = 21.03;
        for i in 10..13 {
            watch.on_reading(jammed(i, lat));
            lat += 120.0 / 111_000.0;
        }
        assert_eq!(watch.monitor.status(), GpsStatus::Lost);

        // clean readings from the settled position decay the score back
        for i in 13..40 {
            watch.on_reading(good(i, lat));
        }
        assert_eq!(watch.monitor.status(), GpsStatus::Ok);

        let texts = messenger.texts.lock().unwrap();
        let recoveries: Vec<_> = texts
            .iter()
            .filter(|(m, _)| m.contains("RECOVERED"))
            .collect();
        assert_eq!(recoveries.len(), 1);
    }

    #[test]
    fn heading_and_distance_to_home_use_last_valid_fix() {
        let mut mon = GpsDenialMonitor::new(GpsMonitorConfig::default());
        mon.set_home(GeoPoint::new(21.0, 105.8));
        // aircraft due north of home
        mon.update(good(0, 21.01));
        mon.update(good(1, 21.01));
        let heading = mon.heading_to_home().unwrap();
        assert!((heading - 180.0).abs() < 1.0, "heading {}", heading);
        let dist = mon.distance_to_home().unwrap();
        assert!((dist - 1112.0).abs() < 20.0, "distance {}", dist);
    }
}
