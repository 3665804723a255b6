use std::sync::Mutex;
use std::time::{Duration, Instant};

use warden_proto::{BatteryTelemetry, SnapshotSource, TelemetrySnapshot};

use crate::link::FcEvent;

fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Default)]
struct Inner {
    lat: f64,
    lon: f64,
    alt_m: f64,
    fix_type: u8,
    sats: u8,
    hdop: f32,

    roll: f32,
    pitch: f32,
    yaw: f32,

    ground_speed: f32,
    heading_deg: f32,

    battery: BatteryTelemetry,

    gps_at: Option<Instant>,
    attitude_at: Option<Instant>,
    battery_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
}

/// Single-writer telemetry cell: the FC reader thread applies events, every
/// other component reads consistent copies through `snapshot()`. All fields of
/// a snapshot come from one lock acquisition; the snapshot is immutable after
/// that.
pub struct TelemetryCell {
    inner: Mutex<Inner>,
    stale_after: Duration,
}

impl TelemetryCell {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stale_after,
        }
    }

    /// Apply one decoded FC event. Called only from the reader thread.
    pub fn apply(&self, ev: &FcEvent) {
        let now = Instant::now();
        let mut st = self.inner.lock().unwrap();
        match ev {
            FcEvent::Heartbeat => st.heartbeat_at = Some(now),
            FcEvent::Attitude { roll, pitch, yaw } => {
                st.roll = *roll;
                st.pitch = *pitch;
                st.yaw = *yaw;
                st.attitude_at = Some(now);
            }
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
                st.lat = *lat;
                st.lon = *lon;
                st.alt_m = *alt_m;
                st.fix_type = *fix_type;
                st.sats = *sats;
                st.hdop = *hdop;
                st.ground_speed = *ground_speed;
                st.heading_deg = *heading_deg;
                st.gps_at = Some(now);
            }
            FcEvent::VfrHud {
                ground_speed,
                heading_deg,
                ..
            } => {
                st.ground_speed = *ground_speed;
                st.heading_deg = *heading_deg;
            }
            FcEvent::SysStatus {
                voltage_v,
                current_a,
                remaining_pct,
            } => {
                if let Some(v) = voltage_v {
                    st.battery.voltage_v = *v;
                }
                if let Some(a) = current_a {
                    st.battery.current_a = *a;
                    // Coulomb counting at the cell's own cadence is left to the
                    // FC; we accumulate nothing here.
                }
                if let Some(p) = remaining_pct {
                    st.battery.remaining_pct = *p;
                }
                st.battery_at = Some(now);
            }
            _ => {}
        }
    }

    /// Record consumed capacity reported out-of-band (BATTERY_STATUS or an
    /// integrator in the caller).
    pub fn set_consumed_mah(&self, mah: f32) {
        self.inner.lock().unwrap().battery.consumed_mah = mah;
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.inner.lock().unwrap().heartbeat_at.map(|t| t.elapsed())
    }

    fn fresh(&self, at: Option<Instant>) -> bool {
        at.map(|t| t.elapsed() <= self.stale_after).unwrap_or(false)
    }
}

impl SnapshotSource for TelemetryCell {
    fn snapshot(&self) -> TelemetrySnapshot {
        let st = self.inner.lock().unwrap();
        let stale = !(self.fresh(st.gps_at) && self.fresh(st.attitude_at));
        TelemetrySnapshot {
            captured_unix_ms: unix_ms(),
            lat: st.lat,
            lon: st.lon,
            alt_m: st.alt_m,
            roll: st.roll,
            pitch: st.pitch,
            yaw: st.yaw,
            ground_speed: st.ground_speed,
            heading_deg: st.heading_deg,
            battery: st.battery,
            fix_type: st.fix_type,
            sats: st.sats,
            hdop: st.hdop,
            stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_stale_until_fed() {
        let cell = TelemetryCell::new(Duration::from_secs(1));
        assert!(cell.snapshot().stale);

        cell.apply(&FcEvent::Gps {
            lat: 21.0,
            lon: 105.0,
            alt_m: 50.0,
            fix_type: 3,
            sats: 12,
            hdop: 0.8,
            ground_speed: 15.0,
            heading_deg: 90.0,
        });
        // attitude still missing
        assert!(cell.snapshot().stale);

        cell.apply(&FcEvent::Attitude {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        let snap = cell.snapshot();
        assert!(!snap.stale);
        assert_eq!(snap.sats, 12);
        assert!((snap.lat - 21.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_goes_stale_after_window() {
        let cell = TelemetryCell::new(Duration::from_millis(0));
        cell.apply(&FcEvent::Gps {
            lat: 0.0,
            lon: 0.0,
            alt_m: 0.0,
            fix_type: 3,
            sats: 10,
            hdop: 1.0,
            ground_speed: 0.0,
            heading_deg: 0.0,
        });
        cell.apply(&FcEvent::Attitude {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(cell.snapshot().stale);
    }
}
