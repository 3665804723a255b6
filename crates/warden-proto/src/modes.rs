use serde::{Deserialize, Serialize};

/// AI mission mode selected by the pilot over RC switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionMode {
    SearchRescue,
    PeopleCounting,
    VehicleCounting,
    Reconnaissance,
    Manual,
    Emergency,
}

impl MissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionMode::SearchRescue => "search_rescue",
            MissionMode::PeopleCounting => "people_counting",
            MissionMode::VehicleCounting => "vehicle_counting",
            MissionMode::Reconnaissance => "reconnaissance",
            MissionMode::Manual => "manual",
            MissionMode::Emergency => "emergency",
        }
    }
}

/// Detection cadence selected on the frequency switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectRate {
    High,   // detect every 5 frames
    Medium, // every 15
    Low,    // every 30
}

impl DetectRate {
    pub fn interval_frames(self) -> u32 {
        match self {
            DetectRate::High => 5,
            DetectRate::Medium => 15,
            DetectRate::Low => 30,
        }
    }
}
