use anyhow::{Context, Result};
use mavlink::{
    common::{
        MavMessage, MavResult, HEARTBEAT_DATA, MavAutopilot, MavModeFlag, MavState, MavType,
    },
    MavConnection, MavHeader,
};
use std::sync::Mutex;

/// One incoming FC message, decoded into the variants the core consumes.
/// Everything else is dropped at the link.
#[derive(Debug, Clone)]
pub enum FcEvent {
    Heartbeat,
    Attitude {
        roll: f32,
        pitch: f32,
        yaw: f32,
    },
    Gps {
        lat: f64,
        lon: f64,
        alt_m: f64,
        fix_type: u8,
        sats: u8,
        hdop: f32,
        ground_speed: f32,
        heading_deg: f32,
    },
    SysStatus {
        voltage_v: Option<f32>,
        current_a: Option<f32>,
        remaining_pct: Option<i8>,
    },
    VfrHud {
        ground_speed: f32,
        heading_deg: f32,
        alt_m: f32,
    },
    Imu {
        accel_x: f32,
        accel_y: f32,
        accel_z: f32,
    },
    RcChannels {
        ch5: u16,
        ch6: u16,
        ch7: u16,
        ch8: u16,
    },
    CommandAck {
        command: u32,
        result: MavResult,
    },
    StatusText(String),
}

/// The FC link. Owned by the command gateway; the reader thread and command
/// writers share it behind an `Arc`. The mavlink connection is internally
/// synchronized, only the outgoing sequence counter needs our own lock.
pub struct FcLink {
    conn: Box<dyn MavConnection<MavMessage> + Sync + Send>,
    hdr: Mutex<MavHeader>,
    target_sys: u8,
    target_comp: u8,
}

impl FcLink {
    /// Open a serial device at the given baud rate.
    pub fn open_serial(dev: &str, baud: u32, sys_id: u8, comp_id: u8, target_sys: u8, target_comp: u8) -> Result<Self> {
        let url = format!("serial:{}:{}", dev, baud);
        Self::open_url(&url, sys_id, comp_id, target_sys, target_comp)
    }

    /// Open any mavlink connection URL ("serial:...", "tcpout:...", "udpin:...").
    pub fn open_url(url: &str, sys_id: u8, comp_id: u8, target_sys: u8, target_comp: u8) -> Result<Self> {
        let conn = mavlink::connect::<MavMessage>(url)
            .with_context(|| format!("mavlink connect {}", url))?;
        Ok(Self {
            conn,
            hdr: Mutex::new(MavHeader {
                system_id: sys_id,
                component_id: comp_id,
                sequence: 0,
            }),
            target_sys,
            target_comp,
        })
    }

    pub fn target(&self) -> (u8, u8) {
        (self.target_sys, self.target_comp)
    }

    /// Best-effort receive: returns Ok(None) on a read error or an
    /// uninteresting message. The serial backend blocks on reads, so this is
    /// only ever called from the dedicated reader thread.
    pub fn recv_event(&self) -> Option<FcEvent> {
        match self.conn.recv() {
            Ok((_hdr, msg)) => decode(msg),
            Err(_) => None,
        }
    }

    pub fn send(&self, msg: MavMessage) -> Result<()> {
        let hdr = {
            let mut h = self.hdr.lock().unwrap();
            h.sequence = h.sequence.wrapping_add(1);
            *h
        };
        self.conn.send(&hdr, &msg).context("mavlink send")?;
        Ok(())
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(MavMessage::HEARTBEAT(hb))
    }
}

fn decode(msg: MavMessage) -> Option<FcEvent> {
    match msg {
        MavMessage::HEARTBEAT(_) => Some(FcEvent::Heartbeat),
        MavMessage::ATTITUDE(a) => Some(FcEvent::Attitude {
            roll: a.roll,
            pitch: a.pitch,
            yaw: a.yaw,
        }),
        MavMessage::GPS_RAW_INT(g) => Some(FcEvent::Gps {
            lat: g.lat as f64 / 1e7,
            lon: g.lon as f64 / 1e7,
            alt_m: g.alt as f64 / 1000.0,
            fix_type: g.fix_type as u8,
            sats: g.satellites_visible,
            // eph is HDOP * 100; u16::MAX means unknown
            hdop: if g.eph == u16::MAX { 99.9 } else { g.eph as f32 / 100.0 },
            // vel in cm/s, cog in centidegrees; u16::MAX means unknown
            ground_speed: if g.vel == u16::MAX { 0.0 } else { g.vel as f32 / 100.0 },
            heading_deg: if g.cog == u16::MAX { 0.0 } else { g.cog as f32 / 100.0 },
        }),
        MavMessage::SYS_STATUS(s) => Some(FcEvent::SysStatus {
            voltage_v: (s.voltage_battery != u16::MAX).then(|| s.voltage_battery as f32 / 1000.0),
            current_a: (s.current_battery != -1).then(|| s.current_battery as f32 / 100.0),
            remaining_pct: (0..=100).contains(&s.battery_remaining).then_some(s.battery_remaining),
        }),
        MavMessage::VFR_HUD(v) => Some(FcEvent::VfrHud {
            ground_speed: v.groundspeed,
            heading_deg: v.heading as f32,
            alt_m: v.alt,
        }),
        MavMessage::SCALED_IMU(i) => Some(FcEvent::Imu {
            // mG to m/s^2
            accel_x: i.xacc as f32 * 9.80665 / 1000.0,
            accel_y: i.yacc as f32 * 9.80665 / 1000.0,
            accel_z: i.zacc as f32 * 9.80665 / 1000.0,
        }),
        MavMessage::RC_CHANNELS(rc) => Some(FcEvent::RcChannels {
            ch5: rc.chan5_raw,
            ch6: rc.chan6_raw,
            ch7: rc.chan7_raw,
            ch8: rc.chan8_raw,
        }),
        MavMessage::COMMAND_ACK(ack) => Some(FcEvent::CommandAck {
            command: ack.command as u32,
            result: ack.result,
        }),
        MavMessage::STATUSTEXT(st) => {
            let end = st.text.iter().position(|&b| b == 0).unwrap_or(st.text.len());
            Some(FcEvent::StatusText(
                String::from_utf8_lossy(&st.text[..end]).into_owned(),
            ))
        }
        _ => None,
    }
}
