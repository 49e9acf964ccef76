//! The remote synchronized store as seen by the bridge.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;

/// Notifications pushed by a path subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandNotification {
    /// The path changed. Deleted or non-string values are delivered as an empty string.
    Value(String),
    /// The subscription saw no traffic for too long. The store resumes it by itself.
    Timeout,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not ready")]
    NotReady,
    #[error("request {path} error: {reason}")]
    Request { path: String, reason: String },
    #[error("request {path} status {status}: {reason}")]
    Status {
        path: String,
        status: u16,
        reason: String,
    },
    #[error("invalid response from {path}: {reason}")]
    Response { path: String, reason: String },
}

/// Operations of the remote store collaborator. Paths are `/`-separated without leading `/`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether the store is connected and holds a usable credential.
    fn is_ready(&self) -> bool;

    /// Read the value at `path`. `None` means absent.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Merge `fields` into the object at `path`. Keys not listed keep their values.
    async fn update(&self, path: &str, fields: &Map<String, Value>) -> Result<(), StoreError>;

    /// Remove the node at `path`.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Subscribe to changes of `path`. The subscription ends when the receiver is dropped.
    async fn subscribe(&self, path: &str) -> Result<Receiver<CommandNotification>, StoreError>;
}

/// Convert a stored value into the command string carried by [`CommandNotification::Value`].
pub fn command_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => "".to_string(),
    }
}
