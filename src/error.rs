use thiserror::Error;

use crate::{motor_controller::DriverError, units::UnitError};

/// Failures an axis request or a board operation can end in.
///
/// Everything except `Configuration` is axis-local: it is reported on the
/// affected axis's fields and never stops other axes.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("target {target} outside user limits [{low}, {high}]")]
    OutOfRange { target: String, low: String, high: String },
    #[error("motion blocked: {0}")]
    MotionBlocked(&'static str),
    #[error("communication error: {0}")]
    Communication(String),
    #[error(transparent)]
    IncompatibleUnit(#[from] UnitError),
    #[error("axis busy: {0}")]
    AxisBusy(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("field {0} is read-only")]
    ReadOnlyField(String),
    #[error("axis not found: {0}")]
    UnknownAxis(String),
    #[error("axis task is no longer running")]
    ChannelClosed,
}

impl From<DriverError> for BridgeError {
    fn from(err: DriverError) -> Self {
        BridgeError::Communication(err.to_string())
    }
}

impl BridgeError {
    /// Short code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "configuration",
            BridgeError::OutOfRange { .. } => "out_of_range",
            BridgeError::MotionBlocked(_) => "motion_blocked",
            BridgeError::Communication(_) => "communication",
            BridgeError::IncompatibleUnit(_) => "incompatible_unit",
            BridgeError::AxisBusy(_) => "axis_busy",
            BridgeError::InvalidValue { .. } => "invalid_value",
            BridgeError::ReadOnlyField(_) => "read_only",
            BridgeError::UnknownAxis(_) => "unknown_axis",
            BridgeError::ChannelClosed => "channel_closed",
        }
    }
}
