use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerResponse {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: serde_json::Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerResponse {
    pub fn success(id: Option<String>, data: serde_json::Value) -> Self {
        Self::Success { id, data }
    }

    pub fn error(id: Option<String>, message: String) -> Self {
        Self::Error {
            id,
            message,
            code: None,
        }
    }

    /// Error response carrying the bridge error code when there is one.
    pub fn from_error(id: Option<String>, err: &anyhow::Error) -> Self {
        Self::Error {
            id,
            message: err.to_string(),
            code: err
                .downcast_ref::<BridgeError>()
                .map(|e| e.code().to_string()),
        }
    }
}
