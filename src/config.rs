//! Bridge configuration file.
//!
//! ```toml
//! [board]
//! name = "stage-rack"
//! host = "192.168.0.253"
//! port = 4016
//! module_address = 1
//!
//! [[board.global_parameters]]
//! bank = 0
//! parameter = 77
//! value = 0
//!
//! [server]
//! socket_path = "/tmp/motorbridge.sock"
//!
//! [[axes]]
//! short_id = "X"
//! axis_number = 0
//! unit = "mm"
//! steps_per_unit = "25600 steps/mm"
//! max_velocity = "5 mm/s"
//! acceleration_duration = "0.5 s"
//! backlash_distance = "1 mm"
//! user_offset = "-50 mm"
//! negative_user_limit = "-100 mm"
//! positive_user_limit = "100 mm"
//!
//! [axes.device_parameters]
//! 6 = 128
//! ```

use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    axis::{AxisConfig, AxisSettings},
    motor_controller::tmcl::TmclSettings,
    socket_server::config::SocketServerConfig,
    supervisor::config::{GlobalParameter, SupervisorConfig},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The `[board]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSettings {
    pub name: String,
    #[serde(flatten)]
    pub connection: TmclSettings,
    #[serde(default)]
    pub global_parameters: Vec<GlobalParameter>,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_cache_capacity")]
    pub parameter_cache_capacity: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub parameter_cache_ttl_ms: u64,
}

fn default_queue_depth() -> usize {
    64
}

fn default_cache_capacity() -> u64 {
    256
}

fn default_cache_ttl_ms() -> u64 {
    5000
}

impl BoardSettings {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            board_name: self.name.clone(),
            queue_depth: self.queue_depth,
            cache_capacity: self.parameter_cache_capacity,
            cache_ttl: Duration::from_millis(self.parameter_cache_ttl_ms),
            global_parameters: self.global_parameters.clone(),
        }
    }
}

/// The file as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub board: BoardSettings,
    #[serde(default)]
    pub server: SocketServerConfig,
    #[serde(default)]
    pub axes: Vec<AxisSettings>,
}

/// A configuration with every axis validated.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub board: BoardSettings,
    pub server: SocketServerConfig,
    pub axes: Vec<AxisConfig>,
}

impl BridgeConfig {
    pub fn validate(self) -> Result<LoadedConfig, ConfigError> {
        if self.axes.is_empty() {
            return Err(ConfigError::Invalid("no [[axes]] configured".to_string()));
        }
        if self.board.queue_depth == 0 {
            return Err(ConfigError::Invalid("board.queue_depth must be positive".to_string()));
        }
        let mut ids = HashSet::new();
        let mut numbers = HashSet::new();
        let mut axes = Vec::with_capacity(self.axes.len());
        for settings in self.axes {
            if !ids.insert(settings.short_id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "axis {} defined twice",
                    settings.short_id
                )));
            }
            if !numbers.insert(settings.axis_number) {
                return Err(ConfigError::Invalid(format!(
                    "axis {}: axis_number {} already used",
                    settings.short_id, settings.axis_number
                )));
            }
            let axis = AxisConfig::try_from(settings).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            axes.push(axis);
        }
        Ok(LoadedConfig {
            board: self.board,
            server: self.server,
            axes,
        })
    }
}

pub fn parse_config(contents: &str) -> Result<LoadedConfig, ConfigError> {
    let config: BridgeConfig = toml::from_str(contents)?;
    config.validate()
}

pub fn load_config(path: impl AsRef<Path>) -> Result<LoadedConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path.display(), e);
        ConfigError::Io(e)
    })?;
    parse_config(&contents)
}
