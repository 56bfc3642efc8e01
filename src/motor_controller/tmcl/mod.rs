pub mod codec;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use codec::{
    TmclCodec, TmclRequest, CMD_GAP, CMD_MST, CMD_MVP, CMD_RFS, CMD_SAP, CMD_SGP, MVP_ABSOLUTE,
    MVP_RELATIVE, RFS_START,
};

use super::{DeviceStatus, DriverError, HomeDirection, LimitSwitchBits, MotorController};

const AP_ACTUAL_POSITION: u16 = 1;
const AP_ACTUAL_SPEED: u16 = 3;
const AP_RIGHT_LIMIT: u16 = 10;
const AP_LEFT_LIMIT: u16 = 11;
const AP_REFERENCE_MODE: u16 = 193;

/// Where and how to reach the board's serial-over-TCP adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmclSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_module_address")]
    pub module_address: u8,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Reference search modes (axis parameter 193) written before a search
    /// in each direction; unset leaves the board's configured mode.
    #[serde(default)]
    pub reference_mode_positive: Option<i64>,
    #[serde(default)]
    pub reference_mode_negative: Option<i64>,
}

fn default_module_address() -> u8 {
    1
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

type Connection = Framed<TcpStream, TmclCodec>;

/// TMCL over a network serial link. One request is in flight at a time;
/// the connection is re-opened lazily after any transport failure.
pub struct TmclController {
    name: String,
    settings: TmclSettings,
    connection: Mutex<Option<Connection>>,
}

impl TmclController {
    pub fn new(name: impl Into<String>, settings: TmclSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            connection: Mutex::new(None),
        }
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.reply_timeout_ms)
    }

    async fn open(&self) -> Result<Connection, DriverError> {
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        let stream = timeout(self.reply_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| DriverError::Timeout(self.reply_timeout()))??;
        stream.set_nodelay(true)?;
        info!("{}: connected to {}", self.name, address);
        Ok(Framed::new(stream, TmclCodec))
    }

    async fn transact(&self, command: u8, type_number: u8, motor: u8, value: i64) -> Result<i32, DriverError> {
        let value = i32::try_from(value).map_err(|_| DriverError::ValueRange(value))?;
        let request = TmclRequest {
            module: self.settings.module_address,
            command,
            type_number,
            motor,
            value,
        };

        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(self.open().await?);
        }
        let Some(framed) = connection.as_mut() else {
            return Err(DriverError::Disconnected);
        };

        let exchange = async {
            framed.send(request).await?;
            let reply = framed.next().await.unwrap_or(Err(DriverError::Disconnected))?;
            Ok::<_, DriverError>(reply)
        };
        let result = timeout(self.reply_timeout(), exchange).await;
        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                warn!("{}: {}, dropping connection", self.name, err);
                *connection = None;
                return Err(err);
            }
            Err(_) => {
                warn!("{}: no reply to command {}, dropping connection", self.name, command);
                *connection = None;
                return Err(DriverError::Timeout(self.reply_timeout()));
            }
        };

        if reply.command != command {
            *connection = None;
            return Err(DriverError::InvalidResponse(format!(
                "reply for command {} while waiting for {}",
                reply.command, command
            )));
        }
        if !reply.is_success() {
            return Err(DriverError::Rejected {
                command,
                status: reply.status,
            });
        }
        debug!(
            "{}: cmd {} type {} motor {} value {} -> {}",
            self.name, command, type_number, motor, value, reply.value
        );
        Ok(reply.value)
    }

    fn parameter_type(parameter: u16) -> Result<u8, DriverError> {
        u8::try_from(parameter).map_err(|_| DriverError::ValueRange(i64::from(parameter)))
    }
}

#[async_trait::async_trait]
impl MotorController for TmclController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_parameter(&self, axis: u8, parameter: u16, value: i64) -> Result<(), DriverError> {
        self.transact(CMD_SAP, Self::parameter_type(parameter)?, axis, value)
            .await
            .map(|_| ())
    }

    async fn read_parameter(&self, axis: u8, parameter: u16) -> Result<i64, DriverError> {
        self.transact(CMD_GAP, Self::parameter_type(parameter)?, axis, 0)
            .await
            .map(i64::from)
    }

    async fn move_absolute(&self, axis: u8, raw_position: i64) -> Result<(), DriverError> {
        self.transact(CMD_MVP, MVP_ABSOLUTE, axis, raw_position)
            .await
            .map(|_| ())
    }

    async fn move_relative(&self, axis: u8, raw_delta: i64) -> Result<(), DriverError> {
        self.transact(CMD_MVP, MVP_RELATIVE, axis, raw_delta)
            .await
            .map(|_| ())
    }

    async fn reference_search(&self, axis: u8, direction: HomeDirection) -> Result<(), DriverError> {
        let mode = match direction {
            HomeDirection::Positive => self.settings.reference_mode_positive,
            HomeDirection::Negative => self.settings.reference_mode_negative,
        };
        if let Some(mode) = mode {
            self.write_parameter(axis, AP_REFERENCE_MODE, mode).await?;
        }
        self.transact(CMD_RFS, RFS_START, axis, 0).await.map(|_| ())
    }

    async fn stop(&self, axis: u8) -> Result<(), DriverError> {
        self.transact(CMD_MST, 0, axis, 0).await.map(|_| ())
    }

    async fn get_status(&self, axis: u8) -> Result<DeviceStatus, DriverError> {
        let raw_position = self.read_parameter(axis, AP_ACTUAL_POSITION).await?;
        let speed = self.read_parameter(axis, AP_ACTUAL_SPEED).await?;
        let right = self.read_parameter(axis, AP_RIGHT_LIMIT).await?;
        let left = self.read_parameter(axis, AP_LEFT_LIMIT).await?;
        Ok(DeviceStatus {
            raw_position,
            moving: speed != 0,
            limit_switches: LimitSwitchBits {
                positive: right != 0,
                negative: left != 0,
            },
        })
    }

    async fn write_global_parameter(&self, bank: u8, parameter: u16, value: i64) -> Result<(), DriverError> {
        self.transact(CMD_SGP, Self::parameter_type(parameter)?, bank, value)
            .await
            .map(|_| ())
    }
}
