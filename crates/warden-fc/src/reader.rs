use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use mavlink::common::MavResult;
use tracing::{debug, info, warn};

use crate::link::{FcEvent, FcLink};
use crate::telemetry::TelemetryCell;

/// Channels the reader fans events out to. All sends are non-blocking; a full
/// consumer just misses that update.
pub struct EventTaps {
    /// GPS and IMU events for the GPS-denial monitor.
    pub sensors: Option<Sender<FcEvent>>,
    /// RC switch events for the mode controller.
    pub rc: Option<Sender<FcEvent>>,
}

/// Spawn the dedicated FC reader thread: the only place that calls recv on
/// the link. Updates the telemetry cell and forwards selected events.
/// Also sends the companion heartbeat at 1 Hz.
pub fn spawn_reader(
    link: Arc<FcLink>,
    cell: Arc<TelemetryCell>,
    taps: EventTaps,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        info!("fc reader started");
            let hb_interval = Duration::from_secs(1);
        let mut last_hb = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            if last_hb.elapsed() >= hb_interval {
                if let Err(e) = link.send_heartbeat() {
                    debug!("companion heartbeat send failed: {:#}", e);
                }
                last_hb = Instant::now();
            }

            let Some(ev) = link.recv_event() else {
                // read error or uninteresting message
                std::thread::sleep(Duration::from_millis(10));
                continue;
            };

            cell.apply(&ev);

            match &ev {
                FcEvent::Gps { .. } | FcEvent::Imu { .. } => {
                    if let Some(tx) = &taps.sensors {
                        let _ = tx.try_send(ev.clone());
                    }
                }
                FcEvent::RcChannels { .. } => {
                    if let Some(tx) = &taps.rc {
                        let _ = tx.try_send(ev.clone());
                    }
                }
                FcEvent::CommandAck { command, result } => {
                    if *result == MavResult::MAV_RESULT_ACCEPTED {
                        info!(command = *command, "FC accepted command");
                    } else {
                        warn!(command = *command, ?result, "FC rejected command");
                    }
                }
                FcEvent::StatusText(text) => {
                    info!(text = text.as_str(), "FC status");
                }
                _ => {}
            }
        }
        info!("fc reader stopped");
    })
}
