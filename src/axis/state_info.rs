use std::time::Duration;

use crate::units::{Quantity, Unit};

use super::limit_switches::LimitSwitches;
use super::state::{CalibrationMode, MotionPhase, SpmgMode};

/// Consistent copy of one axis's state, taken between two controller
/// operations. Everything read back to clients is derived from one of these.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisStateInfo {
    pub short_id: String,
    pub unit: Unit,
    pub phase: MotionPhase,
    pub moving: bool,
    pub done_moving: bool,
    pub homed: bool,

    pub raw_position: i64,
    pub dial_position: Quantity,
    pub user_position: Quantity,

    /// Point of the leg currently being driven.
    pub raw_target: Option<i64>,
    /// Final raw point of the active plan.
    pub final_raw_target: Option<i64>,
    pub user_target: Option<Quantity>,

    pub user_offset: Quantity,
    pub negative_user_limit: Quantity,
    pub positive_user_limit: Quantity,

    pub velocity: Quantity,
    pub acceleration_duration: Duration,
    pub backlash_distance: Quantity,
    pub invert_direction: bool,
    pub step_size: f64,
    /// End switch to end switch, measured by the last reference search.
    pub travel_range: Option<Quantity>,

    pub limit_switches: LimitSwitches,
    pub raw_limit_switches: LimitSwitches,

    pub stop_flag: bool,
    pub spmg: SpmgMode,
    pub calibrating: bool,
    pub calibration_mode: CalibrationMode,
    pub last_error: Option<String>,
}

impl AxisStateInfo {
    pub fn dial_target(&self) -> Option<Quantity> {
        self.user_target
            .map(|t| Quantity::new(t.value - self.user_offset.value, self.unit))
    }

    pub fn negative_dial_limit(&self) -> Quantity {
        Quantity::new(
            self.negative_user_limit.value - self.user_offset.value,
            self.unit,
        )
    }

    pub fn positive_dial_limit(&self) -> Quantity {
        Quantity::new(
            self.positive_user_limit.value - self.user_offset.value,
            self.unit,
        )
    }

    /// Target minus actual, user coordinates; zero without a target.
    pub fn user_difference(&self) -> f64 {
        self.user_target
            .map(|t| t.value - self.user_position.value)
            .unwrap_or(0.0)
    }

    /// Target minus actual, raw steps; zero without a target.
    pub fn raw_difference(&self) -> i64 {
        self.final_raw_target
            .map(|t| t - self.raw_position)
            .unwrap_or(0)
    }
}
