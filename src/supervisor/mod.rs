pub mod command;
pub mod config;

use command::DeviceRequest;
use config::SupervisorConfig;

use moka::future::Cache;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    axis::{AxisConfig, AxisController, AxisHandle, AxisTask, DeviceCommand},
    error::BridgeError,
    fields::{FieldBus, FieldSynchronizer},
    motor_controller::{DeviceStatus, DriverError, MotorController},
};

/// Queue front of one board. Cheap to clone; every clone feeds the same
/// command loop, so operations on one board never overlap.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<DeviceRequest>,
    cache: Cache<(u8, u16), i64>,
}

impl DeviceHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, DriverError>>) -> DeviceRequest,
    ) -> Result<T, BridgeError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)?.map_err(BridgeError::from)
    }

    pub async fn execute(&self, axis: u8, command: DeviceCommand) -> Result<(), BridgeError> {
        let result = self
            .request(|resp| DeviceRequest::Execute {
                axis,
                command,
                resp,
            })
            .await;
        if let DeviceCommand::WriteParameter { parameter, .. } = command {
            self.cache.invalidate(&(axis, parameter)).await;
        }
        result
    }

    pub async fn status(&self, axis: u8) -> Result<DeviceStatus, BridgeError> {
        self.request(|resp| DeviceRequest::Status { axis, resp }).await
    }

    pub async fn write_parameter(&self, axis: u8, parameter: u16, value: i64) -> Result<(), BridgeError> {
        self.execute(axis, DeviceCommand::WriteParameter { parameter, value })
            .await
    }

    /// Cached read; a write to the same parameter drops the entry.
    pub async fn read_parameter(&self, axis: u8, parameter: u16) -> Result<i64, BridgeError> {
        if let Some(value) = self.cache.get(&(axis, parameter)).await {
            return Ok(value);
        }
        let value = self.read_parameter_uncached(axis, parameter).await?;
        self.cache.insert((axis, parameter), value).await;
        Ok(value)
    }

    pub async fn read_parameter_uncached(&self, axis: u8, parameter: u16) -> Result<i64, BridgeError> {
        self.request(|resp| DeviceRequest::ReadParameter {
            axis,
            parameter,
            resp,
        })
        .await
    }

    pub async fn write_global_parameter(&self, bank: u8, parameter: u16, value: i64) -> Result<(), BridgeError> {
        self.request(|resp| DeviceRequest::WriteGlobalParameter {
            bank,
            parameter,
            value,
            resp,
        })
        .await
    }
}

/// Owns the board connection and every axis task running on it.
pub struct BoardSupervisor {
    config: SupervisorConfig,
    device: DeviceHandle,
    bus: Arc<dyn FieldBus>,
    axes: HashMap<String, AxisHandle>,
    axis_numbers: Vec<u8>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BoardSupervisor {
    /// Spawn the command loop for `driver`. Must be called inside a runtime.
    pub fn new(config: SupervisorConfig, driver: Arc<dyn MotorController>, bus: Arc<dyn FieldBus>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        let (tx, rx) = mpsc::channel::<DeviceRequest>(config.queue_depth.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let command_loop = tokio::spawn(Self::command_loop(driver, rx));

        BoardSupervisor {
            config,
            device: DeviceHandle { tx, cache },
            bus,
            axes: HashMap::new(),
            axis_numbers: Vec::new(),
            shutdown_tx,
            tasks: Mutex::new(vec![command_loop]),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.board_name
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Write the board-level parameters, then each axis's parameter map,
    /// reading every value back.
    pub async fn connect(&self, axes: &[AxisConfig]) -> Result<(), BridgeError> {
        info!(
            "board {}: writing {} global parameters",
            self.config.board_name,
            self.config.global_parameters.len()
        );
        for global in &self.config.global_parameters {
            self.device
                .write_global_parameter(global.bank, global.parameter, global.value)
                .await?;
        }
        for axis in axes {
            for (&parameter, &value) in &axis.device_parameters {
                self.device
                    .write_parameter(axis.axis_number, parameter, value)
                    .await?;
                let actual = self
                    .device
                    .read_parameter_uncached(axis.axis_number, parameter)
                    .await?;
                if actual != value {
                    warn!(
                        "axis {}: parameter {} reads back {} after writing {}",
                        axis.short_id, parameter, actual, value
                    );
                }
            }
            debug!(
                "axis {}: {} device parameters applied",
                axis.short_id,
                axis.device_parameters.len()
            );
        }
        Ok(())
    }

    /// Create the controller and start the poll task for one axis.
    pub async fn register_axis(&mut self, config: AxisConfig) -> Result<AxisHandle, BridgeError> {
        if self.axes.contains_key(&config.short_id) {
            return Err(BridgeError::Configuration(format!(
                "axis {} registered twice",
                config.short_id
            )));
        }
        if self.axis_numbers.contains(&config.axis_number) {
            return Err(BridgeError::Configuration(format!(
                "axis number {} already in use on board {}",
                config.axis_number, self.config.board_name
            )));
        }
        let short_id = config.short_id.clone();
        let axis_number = config.axis_number;
        let controller = AxisController::new(Arc::new(config));

        for command in controller.movement_commands()? {
            self.device.execute(axis_number, command).await?;
        }

        let synchronizer = FieldSynchronizer::new(short_id.clone(), self.bus.clone());
        synchronizer.register().await?;

        let (task, handle) = AxisTask::new(
            controller,
            synchronizer,
            self.device.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.tasks.lock().await.push(tokio::spawn(task.run()));
        self.axes.insert(short_id.clone(), handle.clone());
        self.axis_numbers.push(axis_number);
        info!("board {}: axis {} registered as motor {}", self.config.board_name, short_id, axis_number);
        Ok(handle)
    }

    pub fn axis(&self, short_id: &str) -> Result<&AxisHandle, BridgeError> {
        self.axes
            .get(short_id)
            .ok_or_else(|| BridgeError::UnknownAxis(short_id.to_string()))
    }

    pub fn axis_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.axes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every axis task, halt all motors and end the command loop.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let _ = self.shutdown_tx.send(());
        let mut tasks = self.tasks.lock().await;
        let command_loop = if tasks.is_empty() { None } else { Some(tasks.remove(0)) };
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!("axis task ended abnormally: {}", e);
            }
        }

        let result = self
            .device
            .request(|resp| DeviceRequest::Shutdown {
                axes: self.axis_numbers.clone(),
                resp,
            })
            .await;
        if let Some(command_loop) = command_loop {
            if let Err(e) = command_loop.await {
                error!("board command loop ended abnormally: {}", e);
            }
        }
        info!("board {}: shutdown complete", self.config.board_name);
        result
    }

    async fn command_loop(driver: Arc<dyn MotorController>, mut rx: mpsc::Receiver<DeviceRequest>) {
        debug!("command loop for {} started", driver.name());
        while let Some(request) = rx.recv().await {
            match request {
                DeviceRequest::Execute {
                    axis,
                    command,
                    resp,
                } => {
                    let result = Self::handle_execute(driver.as_ref(), axis, command).await;
                    let _ = resp.send(result);
                }
                DeviceRequest::Status { axis, resp } => {
                    let _ = resp.send(driver.get_status(axis).await);
                }
                DeviceRequest::ReadParameter {
                    axis,
                    parameter,
                    resp,
                } => {
                    let _ = resp.send(driver.read_parameter(axis, parameter).await);
                }
                DeviceRequest::WriteGlobalParameter {
                    bank,
                    parameter,
                    value,
                    resp,
                } => {
                    let _ = resp.send(driver.write_global_parameter(bank, parameter, value).await);
                }
                DeviceRequest::Shutdown { axes, resp } => {
                    let _ = resp.send(driver.shutdown(&axes).await);
                    break;
                }
            }
        }
        debug!("command loop for {} finished", driver.name());
    }

    async fn handle_execute(
        driver: &dyn MotorController,
        axis: u8,
        command: DeviceCommand,
    ) -> Result<(), DriverError> {
        match command {
            DeviceCommand::MoveAbsolute(raw) => driver.move_absolute(axis, raw).await,
            DeviceCommand::ReadParameter(parameter) => {
                driver.read_parameter(axis, parameter).await.map(|_| ())
            }
            DeviceCommand::ReferenceSearch(direction) => driver.reference_search(axis, direction).await,
            DeviceCommand::Stop => driver.stop(axis).await,
            DeviceCommand::WriteParameter { parameter, value } => {
                driver.write_parameter(axis, parameter, value).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        axis::config::tests::linear_config,
        fields::FieldStore,
        motor_controller::simulated::{SimulatedBoard, SimulatedController},
    };

    fn supervisor(config: SupervisorConfig) -> (BoardSupervisor, Arc<SimulatedController>) {
        let driver = Arc::new(SimulatedController::new(SimulatedBoard::default()));
        let bus = Arc::new(FieldStore::new());
        (BoardSupervisor::new(config, driver.clone(), bus), driver)
    }

    #[tokio::test]
    async fn test_connect_writes_global_and_axis_parameters() {
        let config = SupervisorConfig {
            global_parameters: vec![config::GlobalParameter {
                bank: 0,
                parameter: 77,
                value: 1,
            }],
            ..SupervisorConfig::default()
        };
        let (supervisor, driver) = supervisor(config);
        let mut axis = linear_config();
        axis.device_parameters.insert(6, 128);

        supervisor.connect(&[axis]).await.unwrap();
        assert_eq!(driver.global_parameter(0, 77).await, Some(1));
        assert_eq!(supervisor.device().read_parameter(0, 6).await.unwrap(), 128);
    }

    #[tokio::test]
    async fn test_parameter_cache_invalidated_on_write() {
        let (supervisor, driver) = supervisor(SupervisorConfig::default());
        let device = supervisor.device();
        device.write_parameter(0, 6, 100).await.unwrap();
        assert_eq!(device.read_parameter(0, 6).await.unwrap(), 100);

        // changed behind the cache's back: still the cached value
        driver.set_parameter(0, 6, 50).await;
        assert_eq!(device.read_parameter(0, 6).await.unwrap(), 100);

        device.write_parameter(0, 6, 200).await.unwrap();
        assert_eq!(device.read_parameter(0, 6).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_register_pushes_movement_parameters() {
        let (mut supervisor, driver) = supervisor(SupervisorConfig::default());
        supervisor.register_axis(linear_config()).await.unwrap();
        assert_eq!(driver.parameter(0, 4).await, Some(128_000));
        assert_eq!(driver.parameter(0, 5).await, Some(256_000));
        assert_eq!(supervisor.axis_ids(), vec!["X".to_string()]);
        assert!(matches!(
            supervisor.axis("Y"),
            Err(BridgeError::UnknownAxis(_))
        ));

        let mut duplicate = linear_config();
        duplicate.short_id = "Y".to_string();
        assert!(matches!(
            supervisor.register_axis(duplicate).await,
            Err(BridgeError::Configuration(_))
        ));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let (supervisor, _driver) = supervisor(SupervisorConfig::default());
        supervisor.shutdown().await.unwrap();
        assert!(matches!(
            supervisor.device().status(0).await,
            Err(BridgeError::ChannelClosed)
        ));
    }
}
