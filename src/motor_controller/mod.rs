pub mod simulated;
pub mod tmcl;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(String),
    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),
    #[error("board rejected command {command} with status {status}")]
    Rejected { command: u8, status: u8 },
    #[error("malformed reply: {0}")]
    InvalidResponse(String),
    #[error("connection closed")]
    Disconnected,
    #[error("raw value {0} outside the board's 32-bit range")]
    ValueRange(i64),
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err.to_string())
    }
}

/// Direction of a reference search, in raw (motor) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomeDirection {
    Positive,
    Negative,
}

/// Limit switch inputs exactly as the board reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitSwitchBits {
    /// Switch at the positive-raw end ("right" on Trinamic boards).
    pub positive: bool,
    /// Switch at the negative-raw end ("left").
    pub negative: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub raw_position: i64,
    pub moving: bool,
    pub limit_switches: LimitSwitchBits,
}

/// Primitive per-axis operations of one stepper controller board.
///
/// Implementations own the transport; callers never issue two operations on
/// the same board concurrently, the board supervisor's command loop sees to
/// that.
#[async_trait::async_trait]
pub trait MotorController: Send + Sync {
    fn name(&self) -> &str;

    async fn write_parameter(&self, axis: u8, parameter: u16, value: i64)
        -> Result<(), DriverError>;
    async fn read_parameter(&self, axis: u8, parameter: u16) -> Result<i64, DriverError>;

    async fn move_absolute(&self, axis: u8, raw_position: i64) -> Result<(), DriverError>;
    async fn move_relative(&self, axis: u8, raw_delta: i64) -> Result<(), DriverError>;
    async fn reference_search(&self, axis: u8, direction: HomeDirection)
        -> Result<(), DriverError>;
    async fn stop(&self, axis: u8) -> Result<(), DriverError>;

    async fn get_status(&self, axis: u8) -> Result<DeviceStatus, DriverError>;

    /// Board-wide settings, applied once at connect time.
    async fn write_global_parameter(
        &self,
        bank: u8,
        parameter: u16,
        value: i64,
    ) -> Result<(), DriverError> {
        let _ = (bank, parameter, value);
        Ok(())
    }

    async fn shutdown(&self, axes: &[u8]) -> Result<(), DriverError> {
        for axis in axes {
            self.stop(*axis).await?;
        }
        Ok(())
    }
}
