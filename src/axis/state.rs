use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionPhase {
    Idle,
    Homing,
    BacklashApproach,
    FinalApproach,
    Stopping,
    Error,
}

impl MotionPhase {
    pub fn is_moving_phase(&self) -> bool {
        matches!(
            self,
            MotionPhase::BacklashApproach | MotionPhase::FinalApproach
        )
    }

    /// Idle or Error: nothing is being driven by this controller.
    pub fn is_quiescent(&self) -> bool {
        matches!(self, MotionPhase::Idle | MotionPhase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MotionPhase::Idle => "Idle",
            MotionPhase::Homing => "Homing",
            MotionPhase::BacklashApproach => "BacklashApproach",
            MotionPhase::FinalApproach => "FinalApproach",
            MotionPhase::Stopping => "Stopping",
            MotionPhase::Error => "Error",
        }
    }
}

/// Stop/Pause/Move/Go motion permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpmgMode {
    Stop,
    Pause,
    Move,
    #[default]
    Go,
}

impl SpmgMode {
    pub fn permits_motion(&self) -> bool {
        matches!(self, SpmgMode::Move | SpmgMode::Go)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpmgMode::Stop => "Stop",
            SpmgMode::Pause => "Pause",
            SpmgMode::Move => "Move",
            SpmgMode::Go => "Go",
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(SpmgMode::Stop),
            1 => Some(SpmgMode::Pause),
            2 => Some(SpmgMode::Move),
            3 => Some(SpmgMode::Go),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "stop" => Some(SpmgMode::Stop),
            "pause" => Some(SpmgMode::Pause),
            "move" => Some(SpmgMode::Move),
            "go" => Some(SpmgMode::Go),
            _ => None,
        }
    }
}

/// Which coordinate absorbs a calibration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMode {
    /// The user offset moves; the raw position is left alone.
    Offset,
    /// The user offset is frozen; the board's raw zero moves instead.
    FixOffset,
}
