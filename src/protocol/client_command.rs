use serde::{Deserialize, Serialize};

use crate::fields::{FieldId, FieldValue};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Put {
        axis: String,
        field: FieldId,
        value: FieldValue,
        #[serde(default)]
        id: Option<String>,
    },
    Get {
        axis: String,
        field: FieldId,
        #[serde(default)]
        id: Option<String>,
    },
    GetAxis {
        axis: String,
        #[serde(default)]
        id: Option<String>,
    },
    ListAxes {
        #[serde(default)]
        id: Option<String>,
    },
    ListFields {
        #[serde(default)]
        id: Option<String>,
    },
    GetParameter {
        axis: String,
        parameter: u16,
        #[serde(default)]
        id: Option<String>,
    },
    SetParameter {
        axis: String,
        parameter: u16,
        value: i64,
        #[serde(default)]
        id: Option<String>,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
}

impl ClientCommand {
    pub fn id(&self) -> Option<&String> {
        match self {
            ClientCommand::Put { id, .. }
            | ClientCommand::Get { id, .. }
            | ClientCommand::GetAxis { id, .. }
            | ClientCommand::ListAxes { id }
            | ClientCommand::ListFields { id }
            | ClientCommand::GetParameter { id, .. }
            | ClientCommand::SetParameter { id, .. }
            | ClientCommand::Ping { id } => id.as_ref(),
        }
    }
}
