//! Per-axis motion state machine.
//!
//! The controller never performs I/O. Every operation returns the device
//! commands it wants issued, in order; the axis poll loop hands them to the
//! board supervisor and feeds status reports back through
//! [`AxisController::on_poll_result`].
//!
//! Coordinates:
//! - raw: board steps, the only stored position;
//! - dial: raw converted to the axis unit, sign-flipped when the direction
//!   is inverted;
//! - user: dial plus the user offset.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    error::BridgeError,
    motor_controller::{DeviceStatus, HomeDirection, LimitSwitchBits},
    units::{from_raw_steps, to_raw_steps, Quantity},
};

use super::{
    config::{AxisConfig, BacklashPolicy, RedirectPolicy},
    limit_switches::LimitSwitches,
    movement_parameters::MovementParams,
    state::{CalibrationMode, MotionPhase, SpmgMode},
    state_info::AxisStateInfo,
};

/// Consecutive idle polls after which a stalled leg or a reference search is
/// considered finished.
const SETTLE_POLLS: u32 = 2;

/// Position tolerance for "target reached".
const TOLERANCE_STEPS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    MoveAbsolute(i64),
    ReferenceSearch(HomeDirection),
    Stop,
    WriteParameter { parameter: u16, value: i64 },
    /// The value comes back through [`AxisController::on_parameter_read`].
    ReadParameter(u16),
}

/// The coordinate a calibration request sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationValue {
    User(Quantity),
    Dial(Quantity),
    Raw(i64),
}

/// Raw points of a move: an optional backlash leg, then the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    pub intermediate: Option<i64>,
    pub target: i64,
}

impl MovePlan {
    pub fn first_leg(&self) -> i64 {
        self.intermediate.unwrap_or(self.target)
    }
}

/// Progress of a reference search. Directions are raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HomingStep {
    Searching(HomeDirection),
    ReadingRange(HomeDirection),
    Centering(i64),
}

/// Coordinates a calibration installs once its position write reached the
/// board.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Calibration {
    raw_position: i64,
    user_offset: Quantity,
    negative_user_limit: Quantity,
    positive_user_limit: Quantity,
}

pub struct AxisController {
    config: Arc<AxisConfig>,

    user_offset: Quantity,
    negative_user_limit: Quantity,
    positive_user_limit: Quantity,
    invert_direction: bool,
    backlash_distance: Quantity,
    movement: MovementParams,

    raw_position: i64,
    position_known: bool,
    moving: bool,
    raw_limits: LimitSwitchBits,

    phase: MotionPhase,
    plan: Option<MovePlan>,
    raw_target: Option<i64>,
    user_target: Option<Quantity>,
    paused_target: Option<Quantity>,
    idle_polls: u32,
    retries: u32,
    homing: Option<HomingStep>,
    homed: bool,
    travel_range: Option<i64>,
    pending_calibration: Option<Calibration>,
    /// Phase cut short by a communication failure, resumed on recovery.
    interrupted: Option<MotionPhase>,

    stop_flag: bool,
    spmg: SpmgMode,
    calibrating: bool,
    calibration_mode: CalibrationMode,

    last_error: Option<String>,
    consecutive_failures: u32,
}

impl AxisController {
    pub fn new(config: Arc<AxisConfig>) -> Self {
        let calibration_mode = if config.fixed_offset {
            CalibrationMode::FixOffset
        } else {
            CalibrationMode::Offset
        };
        Self {
            user_offset: config.user_offset,
            negative_user_limit: config.negative_user_limit,
            positive_user_limit: config.positive_user_limit,
            invert_direction: config.invert_axis_direction,
            backlash_distance: config.backlash_distance,
            movement: MovementParams::from_config(&config),
            raw_position: 0,
            position_known: false,
            moving: false,
            raw_limits: LimitSwitchBits::default(),
            phase: MotionPhase::Idle,
            plan: None,
            raw_target: None,
            user_target: None,
            paused_target: None,
            idle_polls: 0,
            retries: 0,
            homing: None,
            homed: false,
            travel_range: None,
            pending_calibration: None,
            interrupted: None,
            stop_flag: false,
            spmg: SpmgMode::Go,
            calibrating: false,
            calibration_mode,
            last_error: None,
            consecutive_failures: 0,
            config,
        }
    }

    pub fn config(&self) -> &AxisConfig {
        &self.config
    }

    pub fn short_id(&self) -> &str {
        &self.config.short_id
    }

    pub fn phase(&self) -> MotionPhase {
        self.phase
    }

    pub fn plan(&self) -> Option<MovePlan> {
        self.plan
    }

    pub fn raw_position(&self) -> i64 {
        self.raw_position
    }

    pub fn raw_target(&self) -> Option<i64> {
        self.raw_target
    }

    pub fn user_target(&self) -> Option<Quantity> {
        self.user_target
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    pub fn calibration_mode(&self) -> CalibrationMode {
        self.calibration_mode
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    // --- coordinates -----------------------------------------------------

    fn sign(&self) -> f64 {
        if self.invert_direction {
            -1.0
        } else {
            1.0
        }
    }

    pub fn dial_from_raw(&self, raw: i64) -> Quantity {
        from_raw_steps(raw, &self.config.steps_per_unit).scale(self.sign())
    }

    pub fn raw_from_dial(&self, dial: Quantity) -> Result<i64, BridgeError> {
        Ok(to_raw_steps(
            dial.scale(self.sign()),
            &self.config.steps_per_unit,
        )?)
    }

    pub fn raw_from_user(&self, user: Quantity) -> Result<i64, BridgeError> {
        let dial = user.convert(self.config.unit)?.checked_sub(self.user_offset)?;
        self.raw_from_dial(dial)
    }

    pub fn user_from_raw(&self, raw: i64) -> Quantity {
        let dial = self.dial_from_raw(raw);
        Quantity::new(dial.value + self.user_offset.value, self.config.unit)
    }

    pub fn dial_position(&self) -> Quantity {
        self.dial_from_raw(self.raw_position)
    }

    pub fn user_position(&self) -> Quantity {
        self.user_from_raw(self.raw_position)
    }

    pub fn done_moving(&self) -> bool {
        !self.moving && self.user_target.is_none() && !self.motion_active()
    }

    /// A phase is driving the axis, or a communication failure interrupted one.
    fn motion_active(&self) -> bool {
        !self.phase.is_quiescent() || self.interrupted.is_some()
    }

    /// Fast cadence while the board reports motion or a commanded motion has
    /// not been observed to finish yet.
    pub fn poll_interval(&self) -> Duration {
        if self.moving || self.motion_active() {
            self.config.poll_interval_moving
        } else {
            self.config.poll_interval_idle
        }
    }

    // --- guards ----------------------------------------------------------

    fn ensure_motion_permitted(&self) -> Result<(), BridgeError> {
        if self.stop_flag {
            return Err(BridgeError::MotionBlocked("STOP is set"));
        }
        if !self.spmg.permits_motion() {
            return Err(BridgeError::MotionBlocked(match self.spmg {
                SpmgMode::Stop => "SPMG is Stop",
                _ => "SPMG is Pause",
            }));
        }
        Ok(())
    }

    fn ensure_position_known(&self) -> Result<(), BridgeError> {
        if self.position_known {
            Ok(())
        } else {
            Err(BridgeError::AxisBusy("position not yet read back"))
        }
    }

    fn ensure_quiescent(&self) -> Result<(), BridgeError> {
        if !self.motion_active() && !self.moving {
            Ok(())
        } else {
            Err(BridgeError::AxisBusy("axis is moving"))
        }
    }

    fn check_limits(&self, target: Quantity) -> Result<(), BridgeError> {
        if target.value < self.negative_user_limit.value
            || target.value > self.positive_user_limit.value
        {
            return Err(BridgeError::OutOfRange {
                target: target.to_string(),
                low: self.negative_user_limit.to_string(),
                high: self.positive_user_limit.to_string(),
            });
        }
        Ok(())
    }

    // --- motion requests -------------------------------------------------

    /// Start (or redirect) a move to `user_target`.
    ///
    /// A redirect discards whatever plan was active and plans afresh from the
    /// current raw position; backlash already travelled is not credited.
    /// The backlash overshoot must lie inside the user limits as well.
    pub fn request_move(&mut self, user_target: Quantity) -> Result<Vec<DeviceCommand>, BridgeError> {
        let target = user_target.convert(self.config.unit)?;
        self.check_limits(target)?;
        self.ensure_motion_permitted()?;
        self.ensure_position_known()?;

        let target_raw = self.raw_from_user(target)?;
        let redirect = self.phase == MotionPhase::BacklashApproach;
        let plan = self.plan_move(target_raw, redirect)?;
        if let Some(intermediate) = plan.intermediate {
            self.check_limits(self.user_from_raw(intermediate))?;
        }

        let first = plan.first_leg();
        self.phase = if plan.intermediate.is_some() {
            MotionPhase::BacklashApproach
        } else {
            MotionPhase::FinalApproach
        };
        self.plan = Some(plan);
        self.raw_target = Some(first);
        self.user_target = Some(target);
        self.paused_target = None;
        self.homing = None;
        self.interrupted = None;
        self.idle_polls = 0;
        self.retries = 0;
        self.last_error = None;
        debug!(
            "axis {}: move to {} (raw {}) via {:?}, phase {}",
            self.config.short_id,
            target,
            target_raw,
            plan.intermediate,
            self.phase.as_str()
        );
        Ok(vec![DeviceCommand::MoveAbsolute(first)])
    }

    pub fn request_relative_move(&mut self, delta: Quantity) -> Result<Vec<DeviceCommand>, BridgeError> {
        let delta = delta.convert(self.config.unit)?;
        let target = Quantity::new(self.user_position().value + delta.value, self.config.unit);
        self.request_move(target)
    }

    fn plan_move(&self, target_raw: i64, redirect: bool) -> Result<MovePlan, BridgeError> {
        let backlash_steps = to_raw_steps(self.backlash_distance, &self.config.steps_per_unit)?.abs();
        let direction = i64::from(self.config.backlash_direction);
        let approach = (target_raw - self.raw_position).signum();

        let needs_backlash = backlash_steps > 0
            && if redirect && self.config.redirect_policy == RedirectPolicy::ReplayFull {
                true
            } else {
                match self.config.backlash_policy {
                    BacklashPolicy::Always => true,
                    BacklashPolicy::WhenOpposing => approach != 0 && approach != direction,
                }
            };

        Ok(MovePlan {
            intermediate: needs_backlash.then(|| target_raw - direction * backlash_steps),
            target: target_raw,
        })
    }

    /// Start a reference search. `direction` is in user coordinates.
    pub fn request_home(&mut self, direction: HomeDirection) -> Result<Vec<DeviceCommand>, BridgeError> {
        self.ensure_motion_permitted()?;
        let raw_direction = match (direction, self.invert_direction) {
            (HomeDirection::Positive, false) | (HomeDirection::Negative, true) => {
                HomeDirection::Positive
            }
            _ => HomeDirection::Negative,
        };
        self.phase = MotionPhase::Homing;
        self.homing = Some(HomingStep::Searching(raw_direction));
        self.interrupted = None;
        self.plan = None;
        self.raw_target = None;
        self.user_target = None;
        self.paused_target = None;
        self.idle_polls = 0;
        self.retries = 0;
        self.homed = false;
        self.last_error = None;
        info!(
            "axis {}: reference search {:?}",
            self.config.short_id, raw_direction
        );
        Ok(vec![DeviceCommand::ReferenceSearch(raw_direction)])
    }

    /// Halt now, whatever is in progress.
    pub fn request_stop(&mut self) -> Vec<DeviceCommand> {
        if self.phase != MotionPhase::Stopping {
            debug!(
                "axis {}: stop requested in phase {}",
                self.config.short_id,
                self.phase.as_str()
            );
        }
        self.phase = MotionPhase::Stopping;
        self.homing = None;
        self.interrupted = None;
        self.plan = None;
        self.raw_target = None;
        self.user_target = None;
        self.idle_polls = 0;
        self.retries = 0;
        vec![DeviceCommand::Stop]
    }

    /// `STOP` field. The flag stays latched, blocking motion, until cleared.
    pub fn set_stop_flag(&mut self, stop: bool) -> Vec<DeviceCommand> {
        self.stop_flag = stop;
        if stop {
            self.paused_target = None;
            self.request_stop()
        } else {
            Vec::new()
        }
    }

    pub fn set_spmg(&mut self, mode: SpmgMode) -> Result<Vec<DeviceCommand>, BridgeError> {
        self.spmg = mode;
        match mode {
            SpmgMode::Stop => {
                self.paused_target = None;
                Ok(self.request_stop())
            }
            SpmgMode::Pause => {
                // a reference search is halted too, with nothing to resume
                if self.motion_active() {
                    let retained = self.user_target;
                    let commands = self.request_stop();
                    self.paused_target = retained;
                    Ok(commands)
                } else {
                    Ok(Vec::new())
                }
            }
            SpmgMode::Move | SpmgMode::Go => match self.paused_target.take() {
                Some(target) if !self.stop_flag => self.request_move(target),
                Some(target) => {
                    self.paused_target = Some(target);
                    Ok(Vec::new())
                }
                None => Ok(Vec::new()),
            },
        }
    }

    // --- calibration and settings ----------------------------------------

    /// `SET` field: while on, position writes recalibrate instead of moving.
    pub fn set_calibrating(&mut self, on: bool) {
        self.calibrating = on;
    }

    /// `FOFF` field.
    pub fn set_calibration_mode(&mut self, mode: CalibrationMode) {
        self.calibration_mode = mode;
    }

    /// Redefine a coordinate without moving. When the board's position
    /// register has to be rewritten, the new coordinates take effect only
    /// after [`AxisController::on_commands_issued`] confirms the write.
    pub fn request_calibration_adjust(
        &mut self,
        value: CalibrationValue,
        mode: CalibrationMode,
    ) -> Result<Vec<DeviceCommand>, BridgeError> {
        self.ensure_quiescent()?;
        self.ensure_position_known()?;
        let user_before = self.user_position();
        let mut next = Calibration {
            raw_position: self.raw_position,
            user_offset: self.user_offset,
            negative_user_limit: self.negative_user_limit,
            positive_user_limit: self.positive_user_limit,
        };

        match (value, mode) {
            (CalibrationValue::User(user), CalibrationMode::Offset) => {
                let delta = user.convert(self.config.unit)?.value - user_before.value;
                next.user_offset.value += delta;
                next.negative_user_limit.value += delta;
                next.positive_user_limit.value += delta;
            }
            (CalibrationValue::User(user), CalibrationMode::FixOffset) => {
                next.raw_position = self.raw_from_user(user)?;
            }
            (CalibrationValue::Dial(dial), mode) => {
                next.raw_position = self.raw_from_dial(dial)?;
                if mode == CalibrationMode::Offset {
                    next.user_offset = self.offset_holding(user_before, next.raw_position);
                }
            }
            (CalibrationValue::Raw(raw), mode) => {
                next.raw_position = raw;
                if mode == CalibrationMode::Offset {
                    next.user_offset = self.offset_holding(user_before, next.raw_position);
                }
            }
        }

        debug!(
            "axis {}: calibration {:?} ({:?}) requested",
            self.config.short_id, value, mode
        );
        if next.raw_position == self.raw_position {
            self.commit_calibration(next);
            return Ok(Vec::new());
        }
        self.pending_calibration = Some(next);
        Ok(vec![DeviceCommand::WriteParameter {
            parameter: self.config.parameter_ids.actual_position,
            value: next.raw_position,
        }])
    }

    /// Offset that keeps the user position at `user` once raw reads `raw`.
    fn offset_holding(&self, user: Quantity, raw: i64) -> Quantity {
        Quantity::new(user.value - self.dial_from_raw(raw).value, self.config.unit)
    }

    fn commit_calibration(&mut self, next: Calibration) {
        let user_before = self.user_position();
        self.raw_position = next.raw_position;
        self.user_offset = next.user_offset;
        self.negative_user_limit = next.negative_user_limit;
        self.positive_user_limit = next.positive_user_limit;
        info!(
            "axis {}: calibrated, user {} -> {}, offset {}",
            self.config.short_id,
            user_before,
            self.user_position(),
            self.user_offset
        );
    }

    /// Move the user frame by `delta`; user limits travel with it.
    fn shift_offset(&mut self, delta: f64) {
        self.user_offset.value += delta;
        self.negative_user_limit.value += delta;
        self.positive_user_limit.value += delta;
    }

    /// `OFF` field.
    pub fn set_user_offset(&mut self, offset: Quantity) -> Result<(), BridgeError> {
        self.ensure_quiescent()?;
        let offset = offset.convert(self.config.unit)?;
        self.shift_offset(offset.value - self.user_offset.value);
        Ok(())
    }

    pub fn set_user_limits(
        &mut self,
        negative: Option<Quantity>,
        positive: Option<Quantity>,
    ) -> Result<(), BridgeError> {
        let negative = match negative {
            Some(q) => q.convert(self.config.unit)?,
            None => self.negative_user_limit,
        };
        let positive = match positive {
            Some(q) => q.convert(self.config.unit)?,
            None => self.positive_user_limit,
        };
        if negative.value > positive.value {
            return Err(BridgeError::InvalidValue {
                field: "limits".to_string(),
                reason: format!("low limit {negative} above high limit {positive}"),
            });
        }
        self.negative_user_limit = negative;
        self.positive_user_limit = positive;
        Ok(())
    }

    pub fn set_dial_limits(
        &mut self,
        negative: Option<Quantity>,
        positive: Option<Quantity>,
    ) -> Result<(), BridgeError> {
        let to_user = |q: Quantity| -> Result<Quantity, BridgeError> {
            let dial = q.convert(self.config.unit)?;
            Ok(Quantity::new(dial.value + self.user_offset.value, self.config.unit))
        };
        let negative = negative.map(to_user).transpose()?;
        let positive = positive.map(to_user).transpose()?;
        self.set_user_limits(negative, positive)
    }

    /// `VELO` field; the acceleration is re-sent because it is derived from
    /// the velocity.
    pub fn set_velocity(&mut self, velocity: Quantity) -> Result<Vec<DeviceCommand>, BridgeError> {
        self.movement = self.movement.with_velocity(velocity.convert(self.config.unit)?)?;
        self.movement_commands()
    }

    /// `ACCL` field.
    pub fn set_acceleration_duration(&mut self, duration: Duration) -> Result<Vec<DeviceCommand>, BridgeError> {
        self.movement = self.movement.with_acceleration_duration(duration)?;
        let value = self.movement.acceleration_steps(&self.config.steps_per_unit)?;
        Ok(vec![DeviceCommand::WriteParameter {
            parameter: self.config.parameter_ids.max_acceleration,
            value,
        }])
    }

    /// Velocity and acceleration parameters as the board should hold them.
    pub fn movement_commands(&self) -> Result<Vec<DeviceCommand>, BridgeError> {
        let scale = &self.config.steps_per_unit;
        let ids = &self.config.parameter_ids;
        Ok(vec![
            DeviceCommand::WriteParameter {
                parameter: ids.max_velocity,
                value: self.movement.velocity_steps(scale)?,
            },
            DeviceCommand::WriteParameter {
                parameter: ids.max_acceleration,
                value: self.movement.acceleration_steps(scale)?,
            },
        ])
    }

    /// `BDST` field.
    pub fn set_backlash_distance(&mut self, distance: Quantity) -> Result<(), BridgeError> {
        let distance = distance.convert(self.config.unit)?;
        if distance.value < 0.0 {
            return Err(BridgeError::InvalidValue {
                field: "BDST".to_string(),
                reason: "backlash distance must not be negative".to_string(),
            });
        }
        self.backlash_distance = distance;
        Ok(())
    }

    /// `DIR` field. Dial limits are mirrored so the user limits keep
    /// bracketing the same physical travel.
    pub fn set_direction_inverted(&mut self, inverted: bool) -> Result<(), BridgeError> {
        if inverted == self.invert_direction {
            return Ok(());
        }
        self.ensure_quiescent()?;
        let offset = self.user_offset.value;
        let dial_low = self.negative_user_limit.value - offset;
        let dial_high = self.positive_user_limit.value - offset;
        self.negative_user_limit.value = -dial_high + offset;
        self.positive_user_limit.value = -dial_low + offset;
        self.invert_direction = inverted;
        Ok(())
    }

    // --- observations ---------------------------------------------------

    pub fn on_poll_result(&mut self, result: Result<DeviceStatus, BridgeError>) -> Vec<DeviceCommand> {
        match result {
            Ok(status) => self.apply_status(status),
            Err(err) => {
                self.record_failure(err);
                Vec::new()
            }
        }
    }

    /// A command issued on this axis's behalf failed in transport.
    pub fn on_command_failed(&mut self, err: BridgeError) {
        if self.pending_calibration.take().is_some() {
            warn!(
                "axis {}: position rewrite failed, calibration dropped",
                self.config.short_id
            );
        }
        self.record_failure(err);
    }

    /// Every command of the last batch reached the board.
    pub fn on_commands_issued(&mut self) {
        if let Some(next) = self.pending_calibration.take() {
            self.commit_calibration(next);
        }
    }

    /// Value of a parameter read requested with [`DeviceCommand::ReadParameter`].
    pub fn on_parameter_read(&mut self, parameter: u16, value: i64) -> Vec<DeviceCommand> {
        let Some(HomingStep::ReadingRange(direction)) = self.homing else {
            return Vec::new();
        };
        if self.phase != MotionPhase::Homing
            || parameter != self.config.parameter_ids.end_switch_distance
        {
            return Vec::new();
        }
        let range = value.abs();
        // raw zero sits on the switch the search ended at
        let middle = match direction {
            HomeDirection::Positive => -range / 2,
            HomeDirection::Negative => range / 2,
        };
        info!(
            "axis {}: travel range {} steps, centering at raw {}",
            self.config.short_id, range, middle
        );
        self.travel_range = Some(range);
        self.homing = Some(HomingStep::Centering(middle));
        self.raw_target = Some(middle);
        self.idle_polls = 0;
        self.retries = 0;
        vec![DeviceCommand::MoveAbsolute(middle)]
    }

    fn record_failure(&mut self, err: BridgeError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures == 1 {
            warn!("axis {}: {}", self.config.short_id, err);
        } else {
            error!(
                "axis {}: {} ({} consecutive failures)",
                self.config.short_id, err, self.consecutive_failures
            );
        }
        if self.phase != MotionPhase::Error {
            self.interrupted = (self.phase != MotionPhase::Idle).then_some(self.phase);
        }
        self.phase = MotionPhase::Error;
        self.idle_polls = 0;
        self.last_error = Some(err.to_string());
    }

    fn apply_status(&mut self, status: DeviceStatus) -> Vec<DeviceCommand> {
        self.raw_position = status.raw_position;
        self.moving = status.moving;
        self.raw_limits = status.limit_switches;
        self.position_known = true;

        if self.phase == MotionPhase::Error {
            info!(
                "axis {}: communication restored after {} failures",
                self.config.short_id, self.consecutive_failures
            );
            self.last_error = None;
            self.consecutive_failures = 0;
            self.idle_polls = 0;
            let Some(phase) = self.interrupted.take() else {
                self.phase = MotionPhase::Idle;
                return Vec::new();
            };
            info!("axis {}: resuming {}", self.config.short_id, phase.as_str());
            self.phase = phase;
            if let Some(commands) = self.resume_commands() {
                return commands;
            }
        }
        self.consecutive_failures = 0;

        if self.moving {
            self.idle_polls = 0;
        } else {
            self.idle_polls += 1;
        }

        if self.phase.is_moving_phase() && self.limit_in_travel_direction() {
            warn!(
                "axis {}: limit switch active in direction of travel at raw {}",
                self.config.short_id, self.raw_position
            );
            let commands = self.request_stop();
            self.last_error = Some("limit switch active".to_string());
            return commands;
        }

        match self.phase {
            MotionPhase::BacklashApproach => {
                let Some(plan) = self.plan else {
                    return self.abandon_move("backlash leg without a plan");
                };
                if !self.moving && self.reached(plan.first_leg()) {
                    debug!(
                        "axis {}: backlash point {} reached, final leg to {}",
                        self.config.short_id,
                        plan.first_leg(),
                        plan.target
                    );
                    self.phase = MotionPhase::FinalApproach;
                    self.raw_target = Some(plan.target);
                    self.idle_polls = 0;
                    self.retries = 0;
                    vec![DeviceCommand::MoveAbsolute(plan.target)]
                } else {
                    self.retry_if_stalled()
                }
            }
            MotionPhase::FinalApproach => {
                let Some(plan) = self.plan else {
                    return self.abandon_move("final leg without a plan");
                };
                if !self.moving && self.reached(plan.target) {
                    self.finish_move();
                    Vec::new()
                } else {
                    self.retry_if_stalled()
                }
            }
            MotionPhase::Homing => self.advance_homing(),
            MotionPhase::Stopping => {
                if !self.moving {
                    debug!("axis {}: halted at raw {}", self.config.short_id, self.raw_position);
                    self.phase = MotionPhase::Idle;
                }
                Vec::new()
            }
            MotionPhase::Idle | MotionPhase::Error => Vec::new(),
        }
    }

    /// Commands that put a resumed phase back in motion, unless the board is
    /// still carrying it out.
    fn resume_commands(&self) -> Option<Vec<DeviceCommand>> {
        match self.phase {
            MotionPhase::Stopping => self.moving.then(|| vec![DeviceCommand::Stop]),
            _ if self.moving => None,
            MotionPhase::BacklashApproach | MotionPhase::FinalApproach => {
                let leg = self.raw_target?;
                (!self.reached(leg)).then(|| vec![DeviceCommand::MoveAbsolute(leg)])
            }
            MotionPhase::Homing => match self.homing? {
                HomingStep::Searching(direction) => Some(vec![DeviceCommand::ReferenceSearch(direction)]),
                HomingStep::ReadingRange(_) => Some(vec![DeviceCommand::ReadParameter(
                    self.config.parameter_ids.end_switch_distance,
                )]),
                HomingStep::Centering(middle) => {
                    (!self.reached(middle)).then(|| vec![DeviceCommand::MoveAbsolute(middle)])
                }
            },
            MotionPhase::Idle | MotionPhase::Error => None,
        }
    }

    fn advance_homing(&mut self) -> Vec<DeviceCommand> {
        match self.homing {
            Some(HomingStep::Searching(direction)) => {
                if self.idle_polls < SETTLE_POLLS {
                    return Vec::new();
                }
                if !self.config.center_after_homing {
                    self.finish_homing();
                    return Vec::new();
                }
                debug!(
                    "axis {}: reference search settled at raw {}, reading travel range",
                    self.config.short_id, self.raw_position
                );
                self.homing = Some(HomingStep::ReadingRange(direction));
                vec![DeviceCommand::ReadParameter(
                    self.config.parameter_ids.end_switch_distance,
                )]
            }
            Some(HomingStep::ReadingRange(_)) => Vec::new(),
            Some(HomingStep::Centering(middle)) => {
                if !self.moving && self.reached(middle) {
                    self.finish_homing();
                    Vec::new()
                } else {
                    self.retry_if_stalled()
                }
            }
            None => self.abandon_move("homing without a reference search"),
        }
    }

    fn finish_homing(&mut self) {
        info!(
            "axis {}: reference search complete, raw {}",
            self.config.short_id, self.raw_position
        );
        self.homed = true;
        self.homing = None;
        self.raw_target = None;
        self.phase = MotionPhase::Idle;
    }

    fn reached(&self, raw: i64) -> bool {
        (self.raw_position - raw).abs() <= TOLERANCE_STEPS
    }

    fn limit_in_travel_direction(&self) -> bool {
        let Some(target) = self.raw_target else {
            return false;
        };
        let direction = (target - self.raw_position).signum();
        let (positive, negative) =
            LimitSwitches::active_inputs(self.raw_limits, self.config.invert_limit_values);
        (direction > 0 && positive) || (direction < 0 && negative)
    }

    fn retry_if_stalled(&mut self) -> Vec<DeviceCommand> {
        if self.moving || self.idle_polls < SETTLE_POLLS {
            return Vec::new();
        }
        let Some(leg) = self.raw_target else {
            return self.abandon_move("leg without a target");
        };
        if self.retries >= self.config.max_retries {
            return self.abandon_move("target not reached");
        }
        self.retries += 1;
        self.idle_polls = 0;
        warn!(
            "axis {}: stopped at raw {} short of {}, retry {}/{}",
            self.config.short_id, self.raw_position, leg, self.retries, self.config.max_retries
        );
        vec![DeviceCommand::MoveAbsolute(leg)]
    }

    fn abandon_move(&mut self, reason: &str) -> Vec<DeviceCommand> {
        error!("axis {}: {}", self.config.short_id, reason);
        self.phase = MotionPhase::Idle;
        self.homing = None;
        self.interrupted = None;
        self.plan = None;
        self.raw_target = None;
        self.user_target = None;
        self.last_error = Some(reason.to_string());
        Vec::new()
    }

    fn finish_move(&mut self) {
        debug!(
            "axis {}: move complete at {}",
            self.config.short_id,
            self.user_position()
        );
        self.phase = MotionPhase::Idle;
        self.plan = None;
        self.raw_target = None;
        self.user_target = None;
        if self.spmg == SpmgMode::Move {
            self.spmg = SpmgMode::Pause;
        }
    }

    pub fn snapshot(&self) -> AxisStateInfo {
        let swap = self.config.swaps_limit_switches(self.invert_direction);
        AxisStateInfo {
            short_id: self.config.short_id.clone(),
            unit: self.config.unit,
            phase: self.phase,
            moving: self.moving,
            done_moving: self.done_moving(),
            homed: self.homed,
            raw_position: self.raw_position,
            dial_position: self.dial_position(),
            user_position: self.user_position(),
            raw_target: self.raw_target,
            final_raw_target: self.plan.map(|p| p.target),
            user_target: self.user_target,
            user_offset: self.user_offset,
            negative_user_limit: self.negative_user_limit,
            positive_user_limit: self.positive_user_limit,
            velocity: self.movement.velocity,
            acceleration_duration: self.movement.acceleration_duration,
            backlash_distance: self.backlash_distance,
            invert_direction: self.invert_direction,
            step_size: 1.0 / self.config.steps_per_unit.steps_per_unit,
            travel_range: self
                .travel_range
                .map(|steps| from_raw_steps(steps, &self.config.steps_per_unit)),
            limit_switches: LimitSwitches::process(
                self.raw_limits,
                swap,
                self.config.invert_limit_values,
            ),
            raw_limit_switches: LimitSwitches::from_raw(self.raw_limits),
            stop_flag: self.stop_flag,
            spmg: self.spmg,
            calibrating: self.calibrating,
            calibration_mode: self.calibration_mode,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::config::tests::linear_config;
    use crate::units::Unit;

    fn mm(v: f64) -> Quantity {
        Quantity::new(v, Unit::Millimeter)
    }

    fn status(raw: i64, moving: bool) -> Result<DeviceStatus, BridgeError> {
        Ok(DeviceStatus {
            raw_position: raw,
            moving,
            limit_switches: LimitSwitchBits::default(),
        })
    }

    /// Axis from `linear_config`, first poll at raw 0 (user -50 mm).
    fn controller_with(config: AxisConfig) -> AxisController {
        let mut c = AxisController::new(Arc::new(config));
        assert!(c.on_poll_result(status(0, false)).is_empty());
        c
    }

    fn controller() -> AxisController {
        controller_with(linear_config())
    }

    #[test]
    fn test_user_is_dial_plus_offset_after_poll() {
        let mut c = controller();
        for raw in [0, 1, -25_600, 1_536_000, 7] {
            c.on_poll_result(status(raw, false));
            let snap = c.snapshot();
            assert!(
                (snap.user_position.value - (snap.dial_position.value + snap.user_offset.value))
                    .abs()
                    < 1e-12
            );
        }
        assert!((c.user_position().value - (-50.0 + 7.0 / 25_600.0)).abs() < 1e-12);
    }

    #[test]
    fn test_move_with_backlash_direction_is_single_leg() {
        let mut c = controller();
        let commands = c.request_move(mm(10.0)).unwrap();
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_536_000)]);
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
        assert_eq!(c.raw_target(), Some(1_536_000));
        assert_eq!(c.user_target(), Some(mm(10.0)));
    }

    #[test]
    fn test_move_against_backlash_direction_goes_through_intermediate() {
        let mut c = controller();
        c.on_poll_result(status(1_536_000, false));
        // user 10 mm -> 0 mm: raw 1_536_000 -> 1_280_000, negative approach
        let commands = c.request_move(mm(0.0)).unwrap();
        let intermediate = 1_280_000 - 25_600;
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(intermediate)]);
        assert_eq!(c.phase(), MotionPhase::BacklashApproach);
        assert_eq!(c.raw_target(), Some(intermediate));
        assert_eq!(c.user_target(), Some(mm(0.0)));

        assert!(c.on_poll_result(status(1_400_000, true)).is_empty());
        let commands = c.on_poll_result(status(intermediate, false));
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_280_000)]);
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
        assert_eq!(c.raw_target(), Some(1_280_000));

        assert!(c.on_poll_result(status(1_280_001, false)).is_empty());
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert!(c.snapshot().done_moving);
        assert_eq!(c.user_target(), None);
    }

    #[test]
    fn test_always_policy_adds_backlash_leg() {
        let mut config = linear_config();
        config.backlash_policy = BacklashPolicy::Always;
        let mut c = controller_with(config);
        let commands = c.request_move(mm(10.0)).unwrap();
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_536_000 - 25_600)]);
        assert_eq!(c.phase(), MotionPhase::BacklashApproach);
    }

    #[test]
    fn test_zero_backlash_never_adds_leg() {
        let mut config = linear_config();
        config.backlash_distance = mm(0.0);
        let mut c = controller_with(config);
        c.request_move(mm(-60.0)).unwrap();
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
    }

    #[test]
    fn test_out_of_range_rejected_without_state_change() {
        let mut c = controller();
        let err = c.request_move(mm(100.5)).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfRange { .. }));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert_eq!(c.raw_target(), None);

        c.request_move(mm(10.0)).unwrap();
        assert!(c.request_move(mm(-101.0)).is_err());
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
        assert_eq!(c.raw_target(), Some(1_536_000));
    }

    #[test]
    fn test_backlash_point_outside_limits_rejected() {
        let mut c = controller();
        // the overshoot for -100 mm lands at -101 mm
        let err = c.request_move(mm(-100.0)).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfRange { .. }));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert!(c.request_move(mm(-99.0)).is_ok());
    }

    #[test]
    fn test_incompatible_unit_rejected() {
        let mut c = controller();
        let err = c.request_move(Quantity::new(1.0, Unit::Degree)).unwrap_err();
        assert!(matches!(err, BridgeError::IncompatibleUnit(_)));
    }

    #[test]
    fn test_compatible_unit_converted() {
        let mut c = controller();
        let commands = c.request_move(Quantity::new(-49_000.0, Unit::Micrometer)).unwrap();
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(25_600)]);
    }

    #[test]
    fn test_stop_flag_blocks_moves() {
        let mut c = controller();
        assert_eq!(c.set_stop_flag(true), vec![DeviceCommand::Stop]);
        c.on_poll_result(status(0, false));
        assert_eq!(c.phase(), MotionPhase::Idle);

        let err = c.request_move(mm(10.0)).unwrap_err();
        assert!(matches!(err, BridgeError::MotionBlocked(_)));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert_eq!(c.raw_target(), None);
        assert!(c.request_home(HomeDirection::Negative).is_err());

        c.set_stop_flag(false);
        assert!(c.request_move(mm(10.0)).is_ok());
    }

    #[test]
    fn test_stop_overrides_spmg_move() {
        let mut c = controller();
        c.set_stop_flag(true);
        c.set_spmg(SpmgMode::Move).unwrap();
        assert!(matches!(
            c.request_move(mm(10.0)),
            Err(BridgeError::MotionBlocked(_))
        ));
    }

    #[test]
    fn test_redirect_during_backlash_replans_from_current_position() {
        let mut c = controller();
        c.on_poll_result(status(1_536_000, false));
        c.request_move(mm(0.0)).unwrap();
        assert_eq!(c.phase(), MotionPhase::BacklashApproach);

        // halfway down, redirect upwards: now in the backlash direction
        c.on_poll_result(status(1_400_000, true));
        let commands = c.request_move(mm(5.0)).unwrap();
        let target = (55.0 * 25_600.0) as i64;
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(target)]);
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
        assert_eq!(c.plan(), Some(MovePlan { intermediate: None, target }));

        // redirect down again: full backlash from the new position
        c.on_poll_result(status(1_390_000, true));
        let commands = c.request_move(mm(1.0)).unwrap();
        let target = (51.0 * 25_600.0) as i64;
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(target - 25_600)]);
    }

    #[test]
    fn test_replay_full_policy_forces_backlash_on_redirect() {
        let mut config = linear_config();
        config.redirect_policy = RedirectPolicy::ReplayFull;
        let mut c = controller_with(config);
        c.on_poll_result(status(1_536_000, false));
        c.request_move(mm(0.0)).unwrap();
        c.on_poll_result(status(1_400_000, true));
        let commands = c.request_move(mm(5.0)).unwrap();
        let target = (55.0 * 25_600.0) as i64;
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(target - 25_600)]);
        assert_eq!(c.phase(), MotionPhase::BacklashApproach);
    }

    #[test]
    fn test_stop_from_any_phase_returns_to_idle() {
        let setups: Vec<fn(&mut AxisController)> = vec![
            |c| {
                c.request_move(mm(10.0)).unwrap();
            },
            |c| {
                c.on_poll_result(status(1_536_000, false));
                c.request_move(mm(0.0)).unwrap();
            },
            |c| {
                c.request_home(HomeDirection::Negative).unwrap();
            },
            |c| {
                c.on_poll_result(Err(BridgeError::Communication("down".into())));
            },
        ];
        for setup in setups {
            let mut c = controller();
            setup(&mut c);
            assert_ne!(c.phase(), MotionPhase::Idle);
            assert_eq!(c.request_stop(), vec![DeviceCommand::Stop]);
            assert_eq!(c.phase(), MotionPhase::Stopping);
            assert_eq!(c.raw_target(), None);
            c.on_poll_result(status(500, true));
            assert_eq!(c.phase(), MotionPhase::Stopping);
            c.on_poll_result(status(600, false));
            assert_eq!(c.phase(), MotionPhase::Idle);
        }
    }

    #[test]
    fn test_homing_completes_after_settled_polls() {
        let mut c = controller();
        let commands = c.request_home(HomeDirection::Negative).unwrap();
        assert_eq!(
            commands,
            vec![DeviceCommand::ReferenceSearch(HomeDirection::Negative)]
        );
        c.on_poll_result(status(0, false));
        assert_eq!(c.phase(), MotionPhase::Homing);
        c.on_poll_result(status(-5_000, true));
        c.on_poll_result(status(0, false));
        assert_eq!(c.phase(), MotionPhase::Homing);
        c.on_poll_result(status(0, false));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert!(c.snapshot().homed);
        assert_eq!(c.raw_position(), 0);
    }

    #[test]
    fn test_pause_halts_homing() {
        let mut c = controller();
        c.request_home(HomeDirection::Negative).unwrap();
        c.on_poll_result(status(-5_000, true));
        assert_eq!(c.set_spmg(SpmgMode::Pause).unwrap(), vec![DeviceCommand::Stop]);
        assert_eq!(c.phase(), MotionPhase::Stopping);
        c.on_poll_result(status(-6_000, false));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert!(!c.snapshot().homed);
        assert!(c.set_spmg(SpmgMode::Go).unwrap().is_empty());
        assert_eq!(c.phase(), MotionPhase::Idle);
    }

    #[test]
    fn test_homing_centers_in_travel_range() {
        let mut config = linear_config();
        config.center_after_homing = true;
        let mut c = controller_with(config);
        c.request_home(HomeDirection::Positive).unwrap();
        c.on_poll_result(status(0, true));
        assert!(c.on_poll_result(status(0, false)).is_empty());
        assert_eq!(
            c.on_poll_result(status(0, false)),
            vec![DeviceCommand::ReadParameter(196)]
        );
        assert_eq!(c.phase(), MotionPhase::Homing);
        assert!(c.on_poll_result(status(0, false)).is_empty());

        assert!(c.on_parameter_read(4, 7).is_empty());
        // zero on the positive switch, the middle lies below it
        assert_eq!(
            c.on_parameter_read(196, 1_000_000),
            vec![DeviceCommand::MoveAbsolute(-500_000)]
        );
        assert!(c.on_poll_result(status(-200_000, true)).is_empty());
        assert!(!c.snapshot().homed);
        c.on_poll_result(status(-500_000, false));
        let snap = c.snapshot();
        assert_eq!(snap.phase, MotionPhase::Idle);
        assert!(snap.homed);
        assert!((snap.travel_range.unwrap().value - 39.0625).abs() < 1e-9);
    }

    #[test]
    fn test_parameter_read_outside_homing_is_ignored() {
        let mut c = controller();
        assert!(c.on_parameter_read(196, 1_000_000).is_empty());
        assert_eq!(c.snapshot().travel_range, None);
    }

    #[test]
    fn test_home_direction_follows_inversion() {
        let mut config = linear_config();
        config.invert_axis_direction = true;
        let mut c = controller_with(config);
        assert_eq!(
            c.request_home(HomeDirection::Positive).unwrap(),
            vec![DeviceCommand::ReferenceSearch(HomeDirection::Negative)]
        );
    }

    #[test]
    fn test_communication_error_resumes_interrupted_move() {
        let mut c = controller();
        c.request_move(mm(10.0)).unwrap();
        c.on_poll_result(Err(BridgeError::Communication("timeout".into())));
        c.on_poll_result(Err(BridgeError::Communication("refused".into())));
        assert_eq!(c.phase(), MotionPhase::Error);
        assert_eq!(c.consecutive_failures(), 2);
        assert!(c.last_error().unwrap().contains("refused"));
        assert_eq!(c.user_target(), Some(mm(10.0)));
        assert!(!c.done_moving());

        let commands = c.on_poll_result(status(100, false));
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_536_000)]);
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
        assert_eq!(c.last_error(), None);
        assert_eq!(c.consecutive_failures(), 0);
    }

    #[test]
    fn test_communication_error_on_idle_axis_recovers_to_idle() {
        let mut c = controller();
        c.on_poll_result(Err(BridgeError::Communication("timeout".into())));
        assert_eq!(c.phase(), MotionPhase::Error);
        assert!(c.done_moving());
        assert!(c.on_poll_result(status(0, false)).is_empty());
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert_eq!(c.last_error(), None);
    }

    #[test]
    fn test_timeout_mid_backlash_leg_keeps_the_move() {
        let mut c = controller();
        c.on_poll_result(status(1_536_000, false));
        c.request_move(mm(0.0)).unwrap();
        c.on_poll_result(status(1_400_000, true));
        c.on_poll_result(Err(BridgeError::Communication("timeout".into())));
        let snap = c.snapshot();
        assert!(!snap.done_moving);
        assert_eq!(snap.user_target, Some(mm(0.0)));
        assert_eq!(snap.final_raw_target, Some(1_280_000));

        // the board finished the leg while the link was down
        let commands = c.on_poll_result(status(1_254_400, false));
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_280_000)]);
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
    }

    #[test]
    fn test_timeout_short_of_backlash_point_reissues_leg() {
        let mut c = controller();
        c.on_poll_result(status(1_536_000, false));
        c.request_move(mm(0.0)).unwrap();
        c.on_poll_result(Err(BridgeError::Communication("timeout".into())));
        let commands = c.on_poll_result(status(1_400_000, false));
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_254_400)]);
        assert_eq!(c.phase(), MotionPhase::BacklashApproach);
    }

    #[test]
    fn test_failed_move_command_resumes_on_next_poll() {
        let mut c = controller();
        c.request_move(mm(10.0)).unwrap();
        c.on_command_failed(BridgeError::Communication("refused".into()));
        assert_eq!(c.phase(), MotionPhase::Error);
        assert_eq!(
            c.on_poll_result(status(0, false)),
            vec![DeviceCommand::MoveAbsolute(1_536_000)]
        );
    }

    #[test]
    fn test_limit_switch_in_travel_direction_stops() {
        let mut c = controller();
        c.request_move(mm(10.0)).unwrap();
        let commands = c.on_poll_result(Ok(DeviceStatus {
            raw_position: 800_000,
            moving: true,
            limit_switches: LimitSwitchBits {
                positive: true,
                negative: false,
            },
        }));
        assert_eq!(commands, vec![DeviceCommand::Stop]);
        assert_eq!(c.phase(), MotionPhase::Stopping);
        assert_eq!(c.last_error(), Some("limit switch active"));
    }

    #[test]
    fn test_limit_switch_behind_travel_is_ignored() {
        let mut c = controller();
        c.request_move(mm(10.0)).unwrap();
        let commands = c.on_poll_result(Ok(DeviceStatus {
            raw_position: 10,
            moving: true,
            limit_switches: LimitSwitchBits {
                positive: false,
                negative: true,
            },
        }));
        assert!(commands.is_empty());
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
        assert_eq!(c.snapshot().limit_switches, LimitSwitches::Lower);
    }

    #[test]
    fn test_stalled_leg_is_retried_then_abandoned() {
        let mut config = linear_config();
        config.max_retries = 1;
        let mut c = controller_with(config);
        c.request_move(mm(10.0)).unwrap();
        assert!(c.on_poll_result(status(1_000, false)).is_empty());
        assert_eq!(
            c.on_poll_result(status(1_000, false)),
            vec![DeviceCommand::MoveAbsolute(1_536_000)]
        );
        c.on_poll_result(status(2_000, false));
        assert!(c.on_poll_result(status(2_000, false)).is_empty());
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert_eq!(c.last_error(), Some("target not reached"));
    }

    #[test]
    fn test_pause_retains_target_and_go_resumes() {
        let mut c = controller();
        c.request_move(mm(10.0)).unwrap();
        c.on_poll_result(status(700_000, true));
        assert_eq!(c.set_spmg(SpmgMode::Pause).unwrap(), vec![DeviceCommand::Stop]);
        c.on_poll_result(status(710_000, false));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert!(matches!(
            c.request_move(mm(20.0)),
            Err(BridgeError::MotionBlocked(_))
        ));

        let commands = c.set_spmg(SpmgMode::Go).unwrap();
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(1_536_000)]);
        assert_eq!(c.phase(), MotionPhase::FinalApproach);
    }

    #[test]
    fn test_spmg_move_reverts_to_pause_after_completion() {
        let mut c = controller();
        c.set_spmg(SpmgMode::Move).unwrap();
        c.request_move(mm(-49.0)).unwrap();
        c.on_poll_result(status(25_600, false));
        assert_eq!(c.phase(), MotionPhase::Idle);
        assert_eq!(c.snapshot().spmg, SpmgMode::Pause);
        assert!(c.request_move(mm(-48.0)).is_err());
    }

    #[test]
    fn test_calibrate_user_in_offset_mode_shifts_offset_and_limits() {
        let mut c = controller();
        let commands = c
            .request_calibration_adjust(CalibrationValue::User(mm(0.0)), CalibrationMode::Offset)
            .unwrap();
        assert!(commands.is_empty());
        let snap = c.snapshot();
        assert!((snap.user_position.value).abs() < 1e-12);
        assert!((snap.user_offset.value).abs() < 1e-12);
        assert!((snap.negative_user_limit.value - (-50.0)).abs() < 1e-12);
        assert!((snap.positive_user_limit.value - 150.0).abs() < 1e-12);
        assert_eq!(snap.raw_position, 0);
    }

    #[test]
    fn test_calibrate_user_in_fixed_offset_mode_rewrites_raw() {
        let mut c = controller();
        let commands = c
            .request_calibration_adjust(CalibrationValue::User(mm(-40.0)), CalibrationMode::FixOffset)
            .unwrap();
        assert_eq!(
            commands,
            vec![DeviceCommand::WriteParameter {
                parameter: 1,
                value: 256_000
            }]
        );
        assert!((c.user_position().value + 50.0).abs() < 1e-12);
        c.on_commands_issued();
        let snap = c.snapshot();
        assert!((snap.user_offset.value + 50.0).abs() < 1e-12);
        assert!((snap.user_position.value + 40.0).abs() < 1e-9);
        assert!((snap.dial_position.value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibrate_dial_in_offset_mode_keeps_user_position() {
        let mut c = controller();
        let commands = c
            .request_calibration_adjust(CalibrationValue::Dial(mm(5.0)), CalibrationMode::Offset)
            .unwrap();
        assert_eq!(
            commands,
            vec![DeviceCommand::WriteParameter {
                parameter: 1,
                value: 128_000
            }]
        );
        c.on_commands_issued();
        let snap = c.snapshot();
        assert!((snap.user_position.value + 50.0).abs() < 1e-9);
        assert!((snap.user_offset.value + 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibrate_raw_in_fixed_offset_mode_moves_user() {
        let mut c = controller();
        c.request_calibration_adjust(CalibrationValue::Raw(-25_600), CalibrationMode::FixOffset)
            .unwrap();
        c.on_commands_issued();
        assert!((c.user_position().value + 51.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_position_rewrite_drops_calibration() {
        let mut c = controller();
        c.request_calibration_adjust(CalibrationValue::Dial(mm(5.0)), CalibrationMode::Offset)
            .unwrap();
        c.on_command_failed(BridgeError::Communication("timeout".into()));
        c.on_poll_result(status(0, false));
        c.on_commands_issued();
        let snap = c.snapshot();
        assert_eq!(snap.phase, MotionPhase::Idle);
        assert!((snap.user_position.value + 50.0).abs() < 1e-9);
        assert!((snap.user_offset.value + 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibration_rejected_while_moving() {
        let mut c = controller();
        c.request_move(mm(10.0)).unwrap();
        let err = c
            .request_calibration_adjust(CalibrationValue::User(mm(0.0)), CalibrationMode::Offset)
            .unwrap_err();
        assert!(matches!(err, BridgeError::AxisBusy(_)));
    }

    #[test]
    fn test_move_rejected_before_first_poll() {
        let mut c = AxisController::new(Arc::new(linear_config()));
        assert!(matches!(
            c.request_move(mm(0.0)),
            Err(BridgeError::AxisBusy(_))
        ));
    }

    #[test]
    fn test_direction_inversion_mirrors_limits() {
        let mut c = controller();
        c.on_poll_result(status(25_600, false));
        c.set_direction_inverted(true).unwrap();
        let snap = c.snapshot();
        assert!((snap.dial_position.value + 1.0).abs() < 1e-12);
        // dial limits were [-50, 150], now [-150, 50]
        assert!((snap.negative_user_limit.value + 200.0).abs() < 1e-12);
        assert!((snap.positive_user_limit.value - 0.0).abs() < 1e-12);
        assert_eq!(c.raw_from_user(mm(-52.0)).unwrap(), 51_200);
    }

    #[test]
    fn test_inverted_axis_swaps_reported_limits() {
        let mut config = linear_config();
        config.invert_axis_direction = true;
        let mut c = controller_with(config.clone());
        let positive_only = Ok(DeviceStatus {
            raw_position: 0,
            moving: false,
            limit_switches: LimitSwitchBits {
                positive: true,
                negative: false,
            },
        });
        c.on_poll_result(positive_only.clone());
        assert_eq!(c.snapshot().limit_switches, LimitSwitches::Lower);

        config.swap_limit_switches = Some(false);
        let mut c = controller_with(config);
        c.on_poll_result(positive_only);
        assert_eq!(c.snapshot().limit_switches, LimitSwitches::Upper);
    }

    #[test]
    fn test_inverted_axis_stops_on_switch_in_raw_travel_direction() {
        let mut config = linear_config();
        config.invert_axis_direction = true;
        let mut c = controller_with(config);
        // user 10 mm is dial 60 mm, raw -1_536_000; the approach opposes
        // the backlash direction
        let commands = c.request_move(mm(10.0)).unwrap();
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(-1_561_600)]);
        let commands = c.on_poll_result(Ok(DeviceStatus {
            raw_position: -800_000,
            moving: true,
            limit_switches: LimitSwitchBits {
                positive: false,
                negative: true,
            },
        }));
        assert_eq!(commands, vec![DeviceCommand::Stop]);
    }

    #[test]
    fn test_velocity_write_updates_board_parameters() {
        let mut c = controller();
        let commands = c.set_velocity(mm(2.0)).unwrap();
        assert_eq!(
            commands,
            vec![
                DeviceCommand::WriteParameter {
                    parameter: 4,
                    value: 51_200
                },
                DeviceCommand::WriteParameter {
                    parameter: 5,
                    value: 102_400
                },
            ]
        );
    }

    #[test]
    fn test_relative_move() {
        let mut c = controller();
        let commands = c.request_relative_move(mm(1.0)).unwrap();
        assert_eq!(commands, vec![DeviceCommand::MoveAbsolute(25_600)]);
        assert_eq!(c.user_target(), Some(mm(-49.0)));
    }

    #[test]
    fn test_poll_interval_follows_motion() {
        let mut c = controller();
        assert_eq!(c.poll_interval(), Duration::from_secs(1));
        c.request_move(mm(10.0)).unwrap();
        assert_eq!(c.poll_interval(), Duration::from_millis(100));
        c.on_poll_result(status(1_536_000, false));
        assert_eq!(c.poll_interval(), Duration::from_secs(1));
    }
}
