use serde::Deserialize;

use warden_proto::modes::{DetectRate, MissionMode};

/// Three-position switch decode from raw PWM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPos {
    Low,
    Middle,
    High,
}

/// RC decode thresholds and the position→mode assignment. The mapping is
/// pilot-configurable; defaults match the stock transmitter layout
/// (ch5 primary mode, ch7 detection frequency, ch8 emergency override).
#[derive(Debug, Clone, Deserialize)]
pub struct RcMapConfig {
    #[serde(default = "default_low")]
    pub low_below: u16,
    #[serde(default = "default_high")]
    pub high_above: u16,

    #[serde(default = "default_mode_low")]
    pub mode_low: MissionMode,
    #[serde(default = "default_mode_middle")]
    pub mode_middle: MissionMode,
    #[serde(default = "default_mode_high")]
    pub mode_high: MissionMode,
}

fn default_low() -> u16 {
    1300
}
fn default_high() -> u16 {
    1700
}
fn default_mode_low() -> MissionMode {
    MissionMode::SearchRescue
}
fn default_mode_middle() -> MissionMode {
    MissionMode::Reconnaissance
}
fn default_mode_high() -> MissionMode {
    MissionMode::PeopleCounting
}

impl Default for RcMapConfig {
    fn default() -> Self {
        Self {
            low_below: default_low(),
            high_above: default_high(),
            mode_low: default_mode_low(),
            mode_middle: default_mode_middle(),
            mode_high: default_mode_high(),
        }
    }
}

/// Raw switch channels as received in RC_CHANNELS.
#[derive(Debug, Clone, Copy)]
pub struct RcSwitches {
    pub ch5: u16,
    pub ch6: u16,
    pub ch7: u16,
    pub ch8: u16,
}

/// What the pilot is asking perception to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    pub mode: MissionMode,
    pub rate: DetectRate,
    pub emergency: bool,
}

impl RcMapConfig {
    pub fn position(&self, pwm: u16) -> SwitchPos {
        if pwm < self.low_below {
            SwitchPos::Low
        } else if pwm > self.high_above {
            SwitchPos::High
        } else {
            SwitchPos::Middle
        }
    }

    pub fn decode(&self, sw: RcSwitches) -> ModeRequest {
        let mode = match self.position(sw.ch5) {
            SwitchPos::Low => self.mode_low,
            SwitchPos::Middle => self.mode_middle,
            SwitchPos::High => self.mode_high,
        };
        let rate = match self.position(sw.ch7) {
            SwitchPos::Low => DetectRate::Low,
            SwitchPos::Middle => DetectRate::Medium,
            SwitchPos::High => DetectRate::High,
        };
        let emergency = self.position(sw.ch8) == SwitchPos::High;
        ModeRequest {
            mode,
            rate,
            emergency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sw(ch5: u16, ch7: u16, ch8: u16) -> RcSwitches {
        RcSwitches {
            ch5,
            ch6: 1500,
            ch7,
            ch8,
        }
    }

    #[test]
    fn default_mapping_matches_transmitter_layout() {
        let map = RcMapConfig::default();

        let req = map.decode(sw(1000, 1500, 1500));
        assert_eq!(req.mode, MissionMode::SearchRescue);
        assert_eq!(req.rate, DetectRate::Medium);
        assert!(!req.emergency);

        let req = map.decode(sw(2000, 1000, 1500));
        assert_eq!(req.mode, MissionMode::PeopleCounting);
        assert_eq!(req.rate, DetectRate::Low);

        let req = map.decode(sw(1500, 2000, 2000));
        assert_eq!(req.mode, MissionMode::Reconnaissance);
        assert_eq!(req.rate, DetectRate::High);
        assert!(req.emergency);
    }

    #[test]
    fn boundary_pwm_is_middle() {
        let map = RcMapConfig::default();
        assert_eq!(map.position(1300), SwitchPos::Middle);
        assert_eq!(map.position(1700), SwitchPos::Middle);
        assert_eq!(map.position(1299), SwitchPos::Low);
        assert_eq!(map.position(1701), SwitchPos::High);
    }
}
