use tokio::sync::oneshot;

use crate::{
    axis::DeviceCommand,
    motor_controller::{DeviceStatus, DriverError},
};

/// One operation queued for the board command loop.
#[derive(Debug)]
pub enum DeviceRequest {
    Execute {
        axis: u8,
        command: DeviceCommand,
        resp: oneshot::Sender<Result<(), DriverError>>,
    },
    Status {
        axis: u8,
        resp: oneshot::Sender<Result<DeviceStatus, DriverError>>,
    },
    ReadParameter {
        axis: u8,
        parameter: u16,
        resp: oneshot::Sender<Result<i64, DriverError>>,
    },
    WriteGlobalParameter {
        bank: u8,
        parameter: u16,
        value: i64,
        resp: oneshot::Sender<Result<(), DriverError>>,
    },
    Shutdown {
        axes: Vec<u8>,
        resp: oneshot::Sender<Result<(), DriverError>>,
    },
}
