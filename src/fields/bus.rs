use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::BridgeError;

use super::{FieldDescriptor, FieldId, FieldValue};

/// The process-control side: exposes fields and receives read-backs.
///
/// Writes travel the other way through [`crate::axis::AxisHandle::write`].
#[async_trait::async_trait]
pub trait FieldBus: Send + Sync {
    async fn register(&self, axis: &str, fields: &[FieldDescriptor]) -> Result<(), BridgeError>;

    /// Replace the read-back values of `axis`. The batch must become visible
    /// as a whole.
    async fn publish(&self, axis: &str, values: Vec<(FieldId, FieldValue)>);

    async fn raise_alarm(&self, axis: &str, field: FieldId, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldAlarm {
    pub field: FieldId,
    pub reason: String,
}

#[derive(Debug, Default)]
struct AxisFields {
    descriptors: Vec<FieldDescriptor>,
    values: BTreeMap<FieldId, FieldValue>,
    alarm: Option<FieldAlarm>,
    updates: u64,
}

/// In-memory field bus keeping the latest published batch per axis.
#[derive(Debug, Default)]
pub struct FieldStore {
    axes: RwLock<HashMap<String, AxisFields>>,
}

impl FieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, axis: &str, field: FieldId) -> Result<FieldValue, BridgeError> {
        let axes = self.axes.read().await;
        let fields = axes
            .get(axis)
            .ok_or_else(|| BridgeError::UnknownAxis(axis.to_string()))?;
        fields
            .values
            .get(&field)
            .cloned()
            .ok_or_else(|| BridgeError::InvalidValue {
                field: field.to_string(),
                reason: "not published yet".to_string(),
            })
    }

    /// All values of one axis, taken from a single batch.
    pub async fn get_all(&self, axis: &str) -> Result<BTreeMap<FieldId, FieldValue>, BridgeError> {
        let axes = self.axes.read().await;
        axes.get(axis)
            .map(|fields| fields.values.clone())
            .ok_or_else(|| BridgeError::UnknownAxis(axis.to_string()))
    }

    pub async fn alarm(&self, axis: &str) -> Option<FieldAlarm> {
        self.axes.read().await.get(axis).and_then(|f| f.alarm.clone())
    }

    pub async fn update_count(&self, axis: &str) -> u64 {
        self.axes.read().await.get(axis).map_or(0, |f| f.updates)
    }

    pub async fn axes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.axes.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl FieldBus for FieldStore {
    async fn register(&self, axis: &str, fields: &[FieldDescriptor]) -> Result<(), BridgeError> {
        let mut axes = self.axes.write().await;
        if axes.contains_key(axis) {
            return Err(BridgeError::Configuration(format!(
                "fields for axis {axis} registered twice"
            )));
        }
        axes.insert(
            axis.to_string(),
            AxisFields {
                descriptors: fields.to_vec(),
                ..AxisFields::default()
            },
        );
        debug!("registered {} fields for axis {}", fields.len(), axis);
        Ok(())
    }

    async fn publish(&self, axis: &str, values: Vec<(FieldId, FieldValue)>) {
        let mut axes = self.axes.write().await;
        let Some(fields) = axes.get_mut(axis) else {
            warn!("publish for unregistered axis {}", axis);
            return;
        };
        for (id, value) in values {
            if fields.descriptors.iter().any(|d| d.id == id) {
                fields.values.insert(id, value);
            }
        }
        fields.updates += 1;
    }

    async fn raise_alarm(&self, axis: &str, field: FieldId, reason: &str) {
        if let Some(fields) = self.axes.write().await.get_mut(axis) {
            fields.alarm = Some(FieldAlarm {
                field,
                reason: reason.to_string(),
            });
        }
    }
}
