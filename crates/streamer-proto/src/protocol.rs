use serde::{Deserialize, Serialize};

/// Protocol-agnostic control actions. MQTT tokens and HTTP routes both map
/// onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Toggle between playing and stopped.
    Power,
    NextStream,
    PrevStream,
    VolumeUp,
    VolumeDown,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Power,
        Action::NextStream,
        Action::PrevStream,
        Action::VolumeUp,
        Action::VolumeDown,
    ];

    /// HTTP route serving this action.
    pub fn route(self) -> &'static str {
        match self {
            Action::Power => "/radio/power",
            Action::NextStream => "/radio/stream/next",
            Action::PrevStream => "/radio/stream/prev",
            Action::VolumeUp => "/radio/volume/up",
            Action::VolumeDown => "/radio/volume/down",
        }
    }
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioStatus {
    pub playing: bool,
    /// 1-based station number from the persisted selection.
    pub station: usize,
    pub volume: String,
}
