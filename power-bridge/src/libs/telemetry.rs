//! Publishes decoded telemetry frames to the remote store.

use std::sync::Arc;

use log::{error, info};
use serde::Serialize;
use serde_json::{Map, Value};

use super::store::{RemoteStore, StoreError};

/// One telemetry reading. Built per inbound frame and dropped after publishing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub power: f64,
    #[serde(rename = "dailyEnergy")]
    pub daily_energy: f64,
    #[serde(rename = "totalEnergy")]
    pub total_energy: f64,
    #[serde(rename = "thresholdLevel")]
    pub threshold_level: i32,
    pub component1: bool,
    pub component2: bool,
    pub component3: bool,
}

pub struct TelemetryPublisher {
    store: Arc<dyn RemoteStore>,
    path: String,
}

impl TelemetryRecord {
    /// The partial-update document. Contains only the record's own keys so that other fields
    /// under the same remote path are left untouched.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        }
    }
}

impl TelemetryPublisher {
    pub fn new(store: Arc<dyn RemoteStore>, path: &str) -> Self {
        TelemetryPublisher {
            store,
            path: path.to_string(),
        }
    }

    /// Write one record as a partial update. Failures are logged and returned, never retried:
    /// the next frame is the retry.
    pub async fn publish(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        const FN_NAME: &'static str = "TelemetryPublisher::publish";

        if let Err(e) = self.store.update(self.path.as_str(), &record.to_fields()).await {
            error!("[{}] update {} error: {}", FN_NAME, self.path, e);
            return Err(e);
        }
        info!("[{}] updated {}: {:?}", FN_NAME, self.path, record);
        Ok(())
    }
}
