use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use tracing::{info, warn};

use warden_proto::modes::{DetectRate, MissionMode};

/// Per-mode detection profile. The table carries the stock defaults; any
/// entry can be overridden from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModeProfile {
    pub target_classes: Vec<String>,
    pub confidence_threshold: f32,
    pub detect_rate: DetectRate,
}

pub fn default_profiles() -> HashMap<MissionMode, ModeProfile> {
    let mut map = HashMap::new();
    map.insert(
        MissionMode::SearchRescue,
        ModeProfile {
            target_classes: vec!["person".into(), "boat".into(), "vehicle".into()],
            confidence_threshold: 0.7,
            detect_rate: DetectRate::High,
        },
    );
    map.insert(
        MissionMode::PeopleCounting,
        ModeProfile {
            target_classes: vec!["person".into()],
            confidence_threshold: 0.6,
            detect_rate: DetectRate::Low,
        },
    );
    map.insert(
        MissionMode::VehicleCounting,
        ModeProfile {
            target_classes: vec![
                "car".into(),
                "truck".into(),
                "bus".into(),
                "motorcycle".into(),
            ],
            confidence_threshold: 0.6,
            detect_rate: DetectRate::Low,
        },
    );
    map.insert(
        MissionMode::Reconnaissance,
        ModeProfile {
            target_classes: vec!["person".into(), "vehicle".into(), "building".into()],
            confidence_threshold: 0.5,
            detect_rate: DetectRate::Medium,
        },
    );
    map.insert(
        MissionMode::Manual,
        ModeProfile {
            target_classes: vec![],
            confidence_threshold: 0.0,
            detect_rate: DetectRate::Low,
        },
    );
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub from: MissionMode,
    pub to: MissionMode,
    /// Tracking state is cleared on every applied transition.
    pub reset_tracking: bool,
}

/// Mode state machine fed by RC switch requests. Transitions are deferred
/// while a critical operation (e.g. an active rescue track) is flagged;
/// EMERGENCY keeps the last non-emergency profile at high cadence.
pub struct ModeController {
    profiles: HashMap<MissionMode, ModeProfile>,
    current: MissionMode,
    previous: Option<MissionMode>,
    last_non_emergency: MissionMode,
    rate: DetectRate,
    critical_ops: BTreeSet<String>,
    deferred: Option<(MissionMode, DetectRate)>,
}

impl ModeController {
    pub fn new(mut overrides: HashMap<MissionMode, ModeProfile>) -> Self {
        let mut profiles = default_profiles();
        for (mode, profile) in overrides.drain() {
            profiles.insert(mode, profile);
        }
        let current = MissionMode::Reconnaissance;
        let rate = profiles
            .get(&current)
            .map(|p| p.detect_rate)
            .unwrap_or(DetectRate::Medium);
        Self {
            profiles,
            current,
            previous: None,
            last_non_emergency: current,
            rate,
            critical_ops: BTreeSet::new(),
            deferred: None,
        }
    }

    pub fn current(&self) -> MissionMode {
        self.current
    }

    pub fn previous(&self) -> Option<MissionMode> {
        self.previous
    }

    /// Effective profile: EMERGENCY inherits the last non-emergency targets
    /// and threshold.
    pub fn profile(&self) -> &ModeProfile {
        let key = if self.current == MissionMode::Emergency {
            self.last_non_emergency
        } else {
            self.current
        };
        self.profiles
            .get(&key)
            .or_else(|| self.profiles.get(&MissionMode::Reconnaissance))
            .expect("reconnaissance profile always present")
    }

    /// Frames between detector passes; None in MANUAL (perception idle).
    pub fn detect_interval(&self) -> Option<u32> {
        match self.current {
            MissionMode::Manual => None,
            MissionMode::Emergency => Some(DetectRate::High.interval_frames()),
            _ => Some(self.rate.interval_frames()),
        }
    }

    /// Apply one RC request; returns the transition if one happened.
    pub fn request(&mut self, mode: MissionMode, rate: DetectRate, emergency: bool) -> Option<ModeChange> {
        let target = if emergency {
            MissionMode::Emergency
        } else {
            mode
        };
        self.rate = rate;

        if target == self.current {
            return None;
        }
        if !self.critical_ops.is_empty() {
            if self.deferred.map(|(m, _)| m) != Some(target) {
                warn!(
                    from = self.current.as_str(),
                    to = target.as_str(),
                    "mode switch deferred: critical operation in progress"
                );
            }
            self.deferred = Some((target, rate));
            return None;
        }
        Some(self.switch(target, rate))
    }

    fn switch(&mut self, to: MissionMode, rate: DetectRate) -> ModeChange {
        let from = self.current;
        info!(from = from.as_str(), to = to.as_str(), "mission mode switch");
        self.previous = Some(from);
        if to != MissionMode::Emergency {
            self.last_non_emergency = to;
        }
        self.current = to;
        self.rate = rate;
        ModeChange {
            from,
            to,
            reset_tracking: true,
        }
    }

    pub fn set_critical(&mut self, key: &str, active: bool) -> Option<ModeChange> {
        if active {
            self.critical_ops.insert(key.to_string());
            None
        } else {
            self.critical_ops.remove(key);
            if self.critical_ops.is_empty() {
                if let Some((mode, rate)) = self.deferred.take() {
                    return Some(self.switch(mode, rate));
                }
            }
            None
        }
    }

    pub fn has_critical(&self) -> bool {
        !self.critical_ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctl() -> ModeController {
        ModeController::new(HashMap::new())
    }

    #[test]
    fn defaults_match_mode_table() {
        let c = ctl();
        assert_eq!(c.current(), MissionMode::Reconnaissance);
        assert_eq!(c.profile().confidence_threshold, 0.5);
        assert_eq!(c.detect_interval(), Some(15));
    }

    #[test]
    fn transition_resets_tracking() {
        let mut c = ctl();
        let change = c
            .request(MissionMode::SearchRescue, DetectRate::High, false)
            .unwrap();
        assert!(change.reset_tracking);
        assert_eq!(c.current(), MissionMode::SearchRescue);
        assert_eq!(c.detect_interval(), Some(5));
    }

    #[test]
    fn critical_operation_defers_transition_until_cleared() {
        let mut c = ctl();
        c.request(MissionMode::SearchRescue, DetectRate::High, false);
        c.set_critical("rescue_track", true);

        assert!(c
            .request(MissionMode::PeopleCounting, DetectRate::Low, false)
            .is_none());
        assert_eq!(c.current(), MissionMode::SearchRescue);

        let change = c.set_critical("rescue_track", false).unwrap();
        assert_eq!(change.to, MissionMode::PeopleCounting);
        assert_eq!(c.current(), MissionMode::PeopleCounting);
    }

    #[test]
    fn emergency_inherits_last_profile_at_high_cadence() {
        let mut c = ctl();
        c.request(MissionMode::PeopleCounting, DetectRate::Low, false);
        c.request(MissionMode::PeopleCounting, DetectRate::Low, true);
        assert_eq!(c.current(), MissionMode::Emergency);
        assert_eq!(c.profile().target_classes, vec!["person".to_string()]);
        assert_eq!(c.detect_interval(), Some(5));
    }

    #[test]
    fn manual_disables_detection() {
        let mut c = ctl();
        c.request(MissionMode::Manual, DetectRate::Medium, false);
        assert_eq!(c.detect_interval(), None);
    }
}
