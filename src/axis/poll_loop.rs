use std::collections::VecDeque;

use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, info};

use crate::{
    error::BridgeError,
    fields::{FieldId, FieldSynchronizer, FieldValue},
    supervisor::DeviceHandle,
};

use super::{AxisController, AxisStateInfo, DeviceCommand};

const REQUEST_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub enum AxisRequest {
    Write {
        field: FieldId,
        value: FieldValue,
        resp: oneshot::Sender<Result<(), BridgeError>>,
    },
    Snapshot {
        resp: oneshot::Sender<AxisStateInfo>,
    },
}

/// Client end of one axis task.
#[derive(Debug, Clone)]
pub struct AxisHandle {
    short_id: String,
    axis_number: u8,
    tx: mpsc::Sender<AxisRequest>,
}

impl AxisHandle {
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn axis_number(&self) -> u8 {
        self.axis_number
    }

    /// Field write; resolves once the request has been applied and its
    /// device commands issued.
    pub async fn write(&self, field: FieldId, value: FieldValue) -> Result<(), BridgeError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(AxisRequest::Write { field, value, resp })
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)?
    }

    pub async fn snapshot(&self) -> Result<AxisStateInfo, BridgeError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(AxisRequest::Snapshot { resp })
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    pub async fn read(&self, field: FieldId) -> Result<FieldValue, BridgeError> {
        Ok(field.read(&self.snapshot().await?))
    }
}

/// The task that owns one [`AxisController`]. Polls and requests are
/// handled strictly one at a time.
pub struct AxisTask {
    controller: AxisController,
    synchronizer: FieldSynchronizer,
    device: DeviceHandle,
    requests: mpsc::Receiver<AxisRequest>,
    shutdown: broadcast::Receiver<()>,
}

impl AxisTask {
    pub fn new(
        controller: AxisController,
        synchronizer: FieldSynchronizer,
        device: DeviceHandle,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, AxisHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let handle = AxisHandle {
            short_id: controller.short_id().to_string(),
            axis_number: controller.config().axis_number,
            tx,
        };
        (
            Self {
                controller,
                synchronizer,
                device,
                requests,
                shutdown,
            },
            handle,
        )
    }

    fn axis_number(&self) -> u8 {
        self.controller.config().axis_number
    }

    pub async fn run(mut self) {
        info!("axis {}: poll loop started", self.controller.short_id());
        let mut next_poll = Instant::now();
        loop {
            tokio::select! {
                _ = sleep_until(next_poll) => {
                    self.poll().await;
                    // the deadline advances by the interval chosen after this
                    // poll; a late wake does not try to catch up
                    next_poll += self.controller.poll_interval();
                    let now = Instant::now();
                    if next_poll < now {
                        next_poll = now;
                    }
                }
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => break,
                    }
                }
                _ = self.shutdown.recv() => {
                    debug!("axis {}: shutdown signal received", self.controller.short_id());
                    break;
                }
            }
        }
        info!("axis {}: poll loop finished", self.controller.short_id());
    }

    async fn poll(&mut self) {
        let status = self.device.status(self.axis_number()).await;
        let commands = self.controller.on_poll_result(status);
        // a failed follow-up command is already recorded on the controller
        let _ = self.issue(commands).await;
        self.synchronizer.publish(&self.controller).await;
    }

    async fn handle_request(&mut self, request: AxisRequest) {
        match request {
            AxisRequest::Write { field, value, resp } => {
                let result = match self
                    .synchronizer
                    .apply_write(&mut self.controller, field, &value)
                    .await
                {
                    Ok(commands) => self.issue(commands).await,
                    Err(err) => Err(err),
                };
                self.synchronizer.publish(&self.controller).await;
                let _ = resp.send(result);
            }
            AxisRequest::Snapshot { resp } => {
                let _ = resp.send(self.controller.snapshot());
            }
        }
    }

    /// Issue commands in order, stopping at the first failure. Parameter
    /// reads go straight to the board and their follow-up commands join the
    /// queue.
    async fn issue(&mut self, commands: Vec<DeviceCommand>) -> Result<(), BridgeError> {
        let axis = self.axis_number();
        let mut queue = VecDeque::from(commands);
        while let Some(command) = queue.pop_front() {
            let result = match command {
                DeviceCommand::ReadParameter(parameter) => self
                    .device
                    .read_parameter_uncached(axis, parameter)
                    .await
                    .map(|value| queue.extend(self.controller.on_parameter_read(parameter, value))),
                command => self.device.execute(axis, command).await,
            };
            if let Err(err) = result {
                self.controller.on_command_failed(err.clone());
                return Err(err);
            }
        }
        self.controller.on_commands_issued();
        Ok(())
    }
}
