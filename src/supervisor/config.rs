use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A board-level (global) parameter written once at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalParameter {
    #[serde(default)]
    pub bank: u8,
    pub parameter: u16,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub board_name: String,
    pub queue_depth: usize,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
    pub global_parameters: Vec<GlobalParameter>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            board_name: "board".to_string(),
            queue_depth: 64,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(5),
            global_parameters: Vec::new(),
        }
    }
}
