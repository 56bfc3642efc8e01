use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, warn};

use crate::{
    axis::{
        state::{CalibrationMode, SpmgMode},
        AxisController, CalibrationValue, DeviceCommand,
    },
    error::BridgeError,
    motor_controller::HomeDirection,
    units::{Quantity, Unit},
};

use super::{FieldBus, FieldId, FieldValue};

/// Turns field writes into controller requests and controller state into
/// read-back batches for one axis.
pub struct FieldSynchronizer {
    axis: String,
    bus: Arc<dyn FieldBus>,
    published: BTreeMap<FieldId, FieldValue>,
}

impl FieldSynchronizer {
    pub fn new(axis: impl Into<String>, bus: Arc<dyn FieldBus>) -> Self {
        Self {
            axis: axis.into(),
            bus,
            published: BTreeMap::new(),
        }
    }

    pub async fn register(&self) -> Result<(), BridgeError> {
        self.bus.register(&self.axis, &FieldId::descriptors()).await
    }

    /// Apply one remote write. A rejection is raised as an alarm on the field
    /// and returned to the writer; the controller is left untouched.
    pub async fn apply_write(
        &self,
        controller: &mut AxisController,
        field: FieldId,
        value: &FieldValue,
    ) -> Result<Vec<DeviceCommand>, BridgeError> {
        match Self::dispatch(controller, field, value) {
            Ok(commands) => {
                debug!(
                    "axis {}: {} <- {} ({} device commands)",
                    self.axis,
                    field,
                    value,
                    commands.len()
                );
                Ok(commands)
            }
            Err(err) => {
                warn!("axis {}: write {} <- {} rejected: {}", self.axis, field, value, err);
                self.bus.raise_alarm(&self.axis, field, &err.to_string()).await;
                Err(err)
            }
        }
    }

    fn dispatch(
        c: &mut AxisController,
        field: FieldId,
        value: &FieldValue,
    ) -> Result<Vec<DeviceCommand>, BridgeError> {
        if !field.is_settable() {
            return Err(BridgeError::ReadOnlyField(field.to_string()));
        }
        let unit = c.config().unit;
        let quantity = |v: &FieldValue| v.as_quantity(field, unit);
        let none = |r: Result<(), BridgeError>| -> Result<Vec<DeviceCommand>, BridgeError> {
            r.map(|()| Vec::new())
        };

        match field {
            FieldId::Val => {
                let target = quantity(value)?;
                if c.is_calibrating() {
                    c.request_calibration_adjust(CalibrationValue::User(target), c.calibration_mode())
                } else {
                    c.request_move(target)
                }
            }
            FieldId::Dval => {
                let dial = quantity(value)?.convert(unit)?;
                if c.is_calibrating() {
                    c.request_calibration_adjust(CalibrationValue::Dial(dial), c.calibration_mode())
                } else {
                    let offset = c.snapshot().user_offset;
                    c.request_move(Quantity::new(dial.value + offset.value, unit))
                }
            }
            FieldId::Rval => {
                let raw = value.as_integer(field)?;
                if c.is_calibrating() {
                    c.request_calibration_adjust(CalibrationValue::Raw(raw), c.calibration_mode())
                } else {
                    let user = c.user_from_raw(raw);
                    c.request_move(user)
                }
            }
            FieldId::Rlv => {
                let delta = quantity(value)?.convert(unit)?;
                if delta.value == 0.0 {
                    return Ok(Vec::new());
                }
                if c.is_calibrating() {
                    let target = Quantity::new(c.user_position().value + delta.value, unit);
                    c.request_calibration_adjust(CalibrationValue::User(target), c.calibration_mode())
                } else {
                    c.request_relative_move(delta)
                }
            }
            FieldId::Off => none(c.set_user_offset(quantity(value)?)),
            FieldId::Set => {
                c.set_calibrating(value.as_flag(field)?);
                Ok(Vec::new())
            }
            FieldId::Foff => {
                let mode = if value.as_flag(field)? {
                    CalibrationMode::FixOffset
                } else {
                    CalibrationMode::Offset
                };
                c.set_calibration_mode(mode);
                Ok(Vec::new())
            }
            FieldId::Hlm => none(c.set_user_limits(None, Some(quantity(value)?))),
            FieldId::Llm => none(c.set_user_limits(Some(quantity(value)?), None)),
            FieldId::Dhlm => none(c.set_dial_limits(None, Some(quantity(value)?))),
            FieldId::Dllm => none(c.set_dial_limits(Some(quantity(value)?), None)),
            FieldId::Velo => c.set_velocity(quantity(value)?),
            FieldId::Accl => {
                let seconds = value.as_quantity(field, Unit::Second)?.to_duration()?;
                c.set_acceleration_duration(seconds)
            }
            FieldId::Bdst => none(c.set_backlash_distance(quantity(value)?.abs())),
            FieldId::Dir => none(c.set_direction_inverted(value.as_flag(field)?)),
            FieldId::Homf | FieldId::Homr => {
                if !value.as_flag(field)? {
                    return Ok(Vec::new());
                }
                let direction = if field == FieldId::Homf {
                    HomeDirection::Positive
                } else {
                    HomeDirection::Negative
                };
                c.request_home(direction)
            }
            FieldId::Stop => Ok(c.set_stop_flag(value.as_flag(field)?)),
            FieldId::Spmg => {
                let mode = match value {
                    FieldValue::Text(name) => SpmgMode::from_name(name),
                    other => SpmgMode::from_index(other.as_integer(field)?),
                }
                .ok_or_else(|| BridgeError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("'{value}' is not one of Stop, Pause, Move, Go"),
                })?;
                c.set_spmg(mode)
            }
            _ => Err(BridgeError::ReadOnlyField(field.to_string())),
        }
    }

    /// Publish the controller's read-back fields if any changed since the
    /// last batch; returns whether a batch was sent.
    pub async fn publish(&mut self, controller: &AxisController) -> bool {
        let state = controller.snapshot();
        let current: BTreeMap<FieldId, FieldValue> = FieldId::ALL
            .iter()
            .map(|id| (*id, id.read(&state)))
            .collect();
        if current == self.published {
            return false;
        }
        let batch = current.iter().map(|(id, v)| (*id, v.clone())).collect();
        self.bus.publish(&self.axis, batch).await;
        self.published = current;
        true
    }
}
