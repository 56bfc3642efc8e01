pub mod config;
pub mod controller;
pub mod limit_switches;
pub mod movement_parameters;
pub mod poll_loop;
pub mod state;
pub mod state_info;

pub use config::{AxisConfig, AxisSettings};
pub use controller::{AxisController, CalibrationValue, DeviceCommand, MovePlan};
pub use poll_loop::{AxisHandle, AxisTask};
pub use state_info::AxisStateInfo;
