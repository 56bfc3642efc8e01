use serde::{Deserialize, Serialize};

/// The `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketServerConfig {
    pub socket_path: String,
    pub max_connections: usize,
}

impl Default for SocketServerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/motorbridge.sock".to_string(),
            max_connections: 16,
        }
    }
}
