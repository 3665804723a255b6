use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavModeFlag, MavSeverity, COMMAND_LONG_DATA, MISSION_ITEM_DATA,
    SET_MODE_DATA, STATUSTEXT_DATA,
};
use tracing::{info, warn};

use warden_proto::{PilotMessenger, Severity};

use crate::link::FcLink;
use crate::ratelimit::{CommandKind, CommandRateLimit};
use crate::telemetry::TelemetryCell;

/// Outcome of a write. "Queued" only means the message left the companion;
/// acceptance is observed separately via COMMAND_ACK on the read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    RateLimited,
}

/// The one surface through which the core affects flight. Owns the FC link;
/// every write is rate limited and advisory (the FC may reject).
pub struct CommandGateway {
    link: Arc<FcLink>,
    cell: Arc<TelemetryCell>,
    limiter: Mutex<CommandRateLimit>,
    require_heartbeat: bool,
}

impl CommandGateway {
    pub fn new(link: Arc<FcLink>, cell: Arc<TelemetryCell>, require_heartbeat: bool) -> Self {
        Self {
            link,
            cell,
            limiter: Mutex::new(CommandRateLimit::new()),
            require_heartbeat,
        }
    }

    pub fn link(&self) -> Arc<FcLink> {
        self.link.clone()
    }

    // ---- read side ----

    pub fn snapshot(&self) -> warden_proto::TelemetrySnapshot {
        use warden_proto::SnapshotSource;
        self.cell.snapshot()
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.cell.heartbeat_age()
    }

    // ---- write side ----

    pub fn arm(&self) -> Result<Dispatch> {
        self.command(CommandKind::Arm, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    pub fn disarm(&self) -> Result<Dispatch> {
        self.command(CommandKind::Disarm, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    pub fn takeoff(&self, alt_m: f32) -> Result<Dispatch> {
        // param1: minimum pitch for fixed wing
        self.command(CommandKind::Takeoff, MavCmd::MAV_CMD_NAV_TAKEOFF, [15.0, 0.0, 0.0, 0.0, 0.0, 0.0, alt_m])
    }

    pub fn land(&self) -> Result<Dispatch> {
        self.command(CommandKind::Land, MavCmd::MAV_CMD_NAV_LAND, [0.0; 7])
    }

    pub fn rth(&self) -> Result<Dispatch> {
        self.command(CommandKind::Rth, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7])
    }

    /// Set a named ArduPlane flight mode.
    pub fn set_mode(&self, name: &str) -> Result<Dispatch> {
        let Some(mode_id) = plane_mode_id(name) else {
            anyhow::bail!("unknown flight mode: {}", name);
        };
        if !self.limiter.lock().unwrap().allow(CommandKind::SetMode) {
            return Ok(Dispatch::RateLimited);
        }
        self.check_heartbeat()?;
        let (target_sys, _) = self.link.target();
        self.link.send(MavMessage::SET_MODE(SET_MODE_DATA {
            custom_mode: mode_id,
            target_system: target_sys,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        }))?;
        info!(mode = name, "FC: set_mode");
        Ok(Dispatch::Queued)
    }

    /// Guided waypoint: fly to the given position.
    pub fn goto(&self, lat: f64, lon: f64, alt_m: f32) -> Result<Dispatch> {
        if !self.limiter.lock().unwrap().allow(CommandKind::Goto) {
            return Ok(Dispatch::RateLimited);
        }
        self.check_heartbeat()?;
        let (target_sys, target_comp) = self.link.target();
        self.link.send(MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: lat as f32,
            y: lon as f32,
            z: alt_m,
            seq: 0,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT.into(),
            target_system: target_sys,
            target_component: target_comp,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            current: 2, // guided-mode waypoint
            autocontinue: 1,
        }))?;
        info!(lat, lon, alt_m, "FC: guided waypoint");
        Ok(Dispatch::Queued)
    }

    pub fn set_heading(&self, heading_deg: f32) -> Result<Dispatch> {
        if !self.limiter.lock().unwrap().allow(CommandKind::SetHeading) {
            return Ok(Dispatch::RateLimited);
        }
        self.command_unlimited(
            MavCmd::MAV_CMD_CONDITION_YAW,
            [heading_deg, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn set_altitude(&self, alt_m: f32) -> Result<Dispatch> {
        if !self.limiter.lock().unwrap().allow(CommandKind::SetAltitude) {
            return Ok(Dispatch::RateLimited);
        }
        self.command_unlimited(
            MavCmd::MAV_CMD_NAV_CONTINUE_AND_CHANGE_ALT,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, alt_m],
        )
    }

    /// Pilot-visible text. Truncated to the 50-byte STATUSTEXT limit and rate
    /// limited per severity.
    pub fn send_status_text(&self, msg: &str, severity: Severity) -> Result<Dispatch> {
        if !self.limiter.lock().unwrap().allow(CommandKind::StatusText(severity)) {
            return Ok(Dispatch::RateLimited);
        }
        let mut text = [0u8; 50];
        for (i, b) in msg.bytes().take(50).enumerate() {
            text[i] = b;
        }
        self.link.send(MavMessage::STATUSTEXT(STATUSTEXT_DATA {
            severity: mav_severity(severity),
            text,
        }))?;
        Ok(Dispatch::Queued)
    }

    fn command(&self, kind: CommandKind, cmd: MavCmd, params: [f32; 7]) -> Result<Dispatch> {
        if !self.limiter.lock().unwrap().allow(kind) {
            warn!(?kind, "FC command rate-limited");
            return Ok(Dispatch::RateLimited);
        }
        self.check_heartbeat()?;
        self.command_unlimited(cmd, params)
    }

    fn command_unlimited(&self, cmd: MavCmd, params: [f32; 7]) -> Result<Dispatch> {
        let (target_sys, target_comp) = self.link.target();
        self.link.send(MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target_sys,
            target_component: target_comp,
            command: cmd.into(),
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        }))?;
        info!(command = ?cmd, "FC: command queued");
        Ok(Dispatch::Queued)
    }

    fn check_heartbeat(&self) -> Result<()> {
        if self.require_heartbeat && self.cell.heartbeat_age().is_none() {
            anyhow::bail!("refusing FC command: no heartbeat seen yet");
        }
        Ok(())
    }
}

impl PilotMessenger for CommandGateway {
    fn status_text(&self, msg: &str, severity: Severity) {
        if let Err(e) = self.send_status_text(msg, severity) {
            warn!("statustext send failed: {:#}", e);
        }
    }

    fn suggest_mode(&self, mode: &str) {
        // A suggestion, not a command: shown to the pilot, never forced.
        if let Err(e) = self.send_status_text(&format!("SUGGEST MODE {}", mode), Severity::Warning)
        {
            warn!("mode suggestion send failed: {:#}", e);
        }
    }
}

fn mav_severity(s: Severity) -> MavSeverity {
    match s {
        Severity::Critical => MavSeverity::MAV_SEVERITY_CRITICAL,
        Severity::Warning => MavSeverity::MAV_SEVERITY_WARNING,
        Severity::Notice => MavSeverity::MAV_SEVERITY_NOTICE,
        Severity::Info => MavSeverity::MAV_SEVERITY_INFO,
    }
}

/// ArduPlane custom mode numbers for the modes the companion ever names.
fn plane_mode_id(name: &str) -> Option<u32> {
    let id = match name.to_ascii_uppercase().as_str() {
        "MANUAL" => 0,
        "CIRCLE" => 1,
        "STABILIZE" => 2,
        "FBWA" => 5,
        "FBWB" => 6,
        "CRUISE" => 7,
        "AUTO" => 10,
        "RTL" => 11,
        "LOITER" => 12,
        "GUIDED" => 15,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_mode_ids() {
        assert_eq!(plane_mode_id("fbwa"), Some(5));
        assert_eq!(plane_mode_id("GUIDED"), Some(15));
        assert_eq!(plane_mode_id("WARP"), None);
    }

    #[test]
    fn severity_wire_values() {
        assert_eq!(Severity::Critical.wire_value(), 2);
        assert_eq!(Severity::Warning.wire_value(), 3);
        assert_eq!(Severity::Info.wire_value(), 6);
    }
}
