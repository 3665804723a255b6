use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::link::{FcEvent, FcLink};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyACM0".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

/// Probe each device/baud pair for a MAVLink heartbeat and return the first
/// that answers.
pub fn autodetect_fc(
    candidate_devs: Vec<String>,
    candidate_bauds: Vec<u32>,
    heartbeat_timeout: Duration,
    sys_id: u8,
    comp_id: u8,
    target_sys: u8,
    target_comp: u8,
) -> Result<AutodetectResult> {
    let mut probes = Vec::new();

    for dev in candidate_devs {
        for baud in &candidate_bauds {
            let start = Instant::now();
            let mut hb_seen = false;
            let mut note;

            match FcLink::open_serial(&dev, *baud, sys_id, comp_id, target_sys, target_comp) {
                Ok(link) => {
                    while start.elapsed() < heartbeat_timeout {
                        if matches!(link.recv_event(), Some(FcEvent::Heartbeat)) {
                            hb_seen = true;
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(25));
                    }
                    note = if hb_seen { "heartbeat".into() } else { "no heartbeat".into() };
                    if hb_seen {
                        probes.push(ProbeResult {
                            dev: dev.clone(),
                            baud: *baud,
                            hb_seen: true,
                            elapsed_ms: start.elapsed().as_millis() as u64,
                            note,
                        });
                        info!("fc autodetect: OK {} @ {}", dev, baud);
                        return Ok(AutodetectResult {
                            chosen: Some((dev, *baud)),
                            probes,
                        });
                    }
                }
                Err(e) => {
                    note = format!("open failed: {}", e);
                    warn!("fc autodetect probe failed dev={} baud={} err={:#}", dev, baud, e);
                }
            }

            probes.push(ProbeResult {
                dev: dev.clone(),
                baud: *baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
        }
    }

    Ok(AutodetectResult {
        chosen: None,
        probes,
    })
}
