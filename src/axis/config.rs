use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::BridgeError,
    units::{Dimension, Quantity, Rate, StepScale, Unit},
};

/// When a move gets the overshoot-and-return leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklashPolicy {
    /// Only when the approach runs against the backlash direction.
    #[default]
    WhenOpposing,
    /// On every move with a non-zero backlash distance.
    Always,
}

/// How a new target arriving during an active backlash leg is planned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectPolicy {
    /// Plan from the current position exactly like any other move.
    #[default]
    Reevaluate,
    /// Always run the full backlash leg again from the current position.
    ReplayFull,
}

/// Board parameter numbers the controller touches directly. Defaults are the
/// TMCL axis parameter numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParameterIds {
    #[serde(default = "default_actual_position")]
    pub actual_position: u16,
    #[serde(default = "default_max_velocity")]
    pub max_velocity: u16,
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: u16,
    /// Distance between the end switches, measured by the last reference search.
    #[serde(default = "default_end_switch_distance")]
    pub end_switch_distance: u16,
}

fn default_actual_position() -> u16 {
    1
}

fn default_max_velocity() -> u16 {
    4
}

fn default_max_acceleration() -> u16 {
    5
}

fn default_end_switch_distance() -> u16 {
    196
}

impl Default for DeviceParameterIds {
    fn default() -> Self {
        Self {
            actual_position: default_actual_position(),
            max_velocity: default_max_velocity(),
            max_acceleration: default_max_acceleration(),
            end_switch_distance: default_end_switch_distance(),
        }
    }
}

/// One `[[axes]]` table as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSettings {
    pub short_id: String,
    pub axis_number: u8,
    #[serde(default)]
    pub description: String,
    pub unit: Unit,
    pub steps_per_unit: StepScale,
    pub max_velocity: Rate,
    pub acceleration_duration: Quantity,
    #[serde(default)]
    pub backlash_distance: Option<Quantity>,
    #[serde(default = "default_backlash_direction")]
    pub backlash_direction: i8,
    #[serde(default)]
    pub backlash_policy: BacklashPolicy,
    #[serde(default)]
    pub redirect_policy: RedirectPolicy,
    #[serde(default)]
    pub invert_axis_direction: bool,
    /// Unset means "follow `invert_axis_direction`".
    #[serde(default)]
    pub swap_limit_switches: Option<bool>,
    #[serde(default)]
    pub invert_limit_values: bool,
    #[serde(default)]
    pub user_offset: Option<Quantity>,
    pub negative_user_limit: Quantity,
    pub positive_user_limit: Quantity,
    #[serde(default = "default_poll_moving")]
    pub poll_interval_moving: Quantity,
    #[serde(default = "default_poll_idle")]
    pub poll_interval_idle: Quantity,
    #[serde(default)]
    pub fixed_offset: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// After a reference search, read the travel range and drive to its middle.
    #[serde(default)]
    pub center_after_homing: bool,
    #[serde(default)]
    pub parameter_ids: DeviceParameterIds,
    /// Parameter number → value, written once when the board connects.
    #[serde(default)]
    pub device_parameters: BTreeMap<String, i64>,
}

fn default_backlash_direction() -> i8 {
    1
}

fn default_poll_moving() -> Quantity {
    Quantity::new(0.1, Unit::Second)
}

fn default_poll_idle() -> Quantity {
    Quantity::new(1.0, Unit::Second)
}

fn default_max_retries() -> u32 {
    3
}

/// Validated, immutable parameters of one axis. Every unit-bearing value,
/// the step scale included, is already expressed in `unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisConfig {
    pub short_id: String,
    pub axis_number: u8,
    pub description: String,
    pub unit: Unit,
    pub steps_per_unit: StepScale,
    /// Per second.
    pub max_velocity: Quantity,
    pub acceleration_duration: Duration,
    pub backlash_distance: Quantity,
    pub backlash_direction: i8,
    pub backlash_policy: BacklashPolicy,
    pub redirect_policy: RedirectPolicy,
    pub invert_axis_direction: bool,
    pub swap_limit_switches: Option<bool>,
    pub invert_limit_values: bool,
    pub user_offset: Quantity,
    pub negative_user_limit: Quantity,
    pub positive_user_limit: Quantity,
    pub poll_interval_moving: Duration,
    pub poll_interval_idle: Duration,
    pub fixed_offset: bool,
    pub max_retries: u32,
    pub center_after_homing: bool,
    pub parameter_ids: DeviceParameterIds,
    pub device_parameters: BTreeMap<u16, i64>,
}

impl AxisConfig {
    /// Whether the raw limit inputs are swapped for a given direction setting.
    pub fn swaps_limit_switches(&self, inverted: bool) -> bool {
        self.swap_limit_switches.unwrap_or(inverted)
    }
}

impl TryFrom<AxisSettings> for AxisConfig {
    type Error = BridgeError;

    fn try_from(s: AxisSettings) -> Result<Self, Self::Error> {
        let id = s.short_id.clone();
        let invalid = |what: String| BridgeError::Configuration(format!("axis {id}: {what}"));

        if s.short_id.is_empty() || !s.short_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("short_id must be non-empty and alphanumeric".to_string()));
        }
        let unit = s.unit;
        if !matches!(unit.dimension(), Dimension::Length | Dimension::Angle) {
            return Err(invalid(format!("unit {unit} is neither a length nor an angle")));
        }
        let in_unit = |name: &str, q: Quantity| {
            q.convert(unit)
                .map_err(|e| invalid(format!("{name}: {e}")))
        };
        let steps_per_unit = s.steps_per_unit.in_unit(unit).map_err(|_| {
            invalid(format!(
                "steps_per_unit {} does not match axis unit {unit}",
                s.steps_per_unit
            ))
        })?;

        let max_velocity = in_unit("max_velocity", s.max_velocity.per_second())?;
        if max_velocity.value <= 0.0 {
            return Err(invalid("max_velocity must be positive".to_string()));
        }
        let acceleration_duration = s
            .acceleration_duration
            .to_duration()
            .map_err(|e| invalid(format!("acceleration_duration: {e}")))?;
        if acceleration_duration.is_zero() {
            return Err(invalid("acceleration_duration must be positive".to_string()));
        }

        let backlash_distance = match s.backlash_distance {
            Some(q) => in_unit("backlash_distance", q)?,
            None => Quantity::zero(unit),
        };
        if backlash_distance.value < 0.0 {
            return Err(invalid(
                "backlash_distance must not be negative, use backlash_direction".to_string(),
            ));
        }
        if s.backlash_direction != 1 && s.backlash_direction != -1 {
            return Err(invalid(format!(
                "backlash_direction must be -1 or 1, got {}",
                s.backlash_direction
            )));
        }

        let user_offset = match s.user_offset {
            Some(q) => in_unit("user_offset", q)?,
            None => Quantity::zero(unit),
        };
        let negative_user_limit = in_unit("negative_user_limit", s.negative_user_limit)?;
        let positive_user_limit = in_unit("positive_user_limit", s.positive_user_limit)?;
        if negative_user_limit.value > positive_user_limit.value {
            return Err(invalid(format!(
                "negative_user_limit {negative_user_limit} above positive_user_limit {positive_user_limit}"
            )));
        }

        let interval = |name: &str, q: Quantity| -> Result<Duration, BridgeError> {
            let d = q.to_duration().map_err(|e| invalid(format!("{name}: {e}")))?;
            if d.is_zero() {
                return Err(invalid(format!("{name} must be positive")));
            }
            Ok(d)
        };
        let poll_interval_moving = interval("poll_interval_moving", s.poll_interval_moving)?;
        let poll_interval_idle = interval("poll_interval_idle", s.poll_interval_idle)?;

        let mut device_parameters = BTreeMap::new();
        for (key, value) in &s.device_parameters {
            let number: u16 = key
                .trim()
                .parse()
                .map_err(|_| invalid(format!("device parameter key '{key}' is not a number")))?;
            device_parameters.insert(number, *value);
        }

        Ok(AxisConfig {
            short_id: s.short_id,
            axis_number: s.axis_number,
            description: s.description,
            unit,
            steps_per_unit,
            max_velocity,
            acceleration_duration,
            backlash_distance,
            backlash_direction: s.backlash_direction,
            backlash_policy: s.backlash_policy,
            redirect_policy: s.redirect_policy,
            invert_axis_direction: s.invert_axis_direction,
            swap_limit_switches: s.swap_limit_switches,
            invert_limit_values: s.invert_limit_values,
            user_offset,
            negative_user_limit,
            positive_user_limit,
            poll_interval_moving,
            poll_interval_idle,
            fixed_offset: s.fixed_offset,
            max_retries: s.max_retries,
            center_after_homing: s.center_after_homing,
            parameter_ids: s.parameter_ids,
            device_parameters,
        })
    }
}
