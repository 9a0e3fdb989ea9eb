//! Device connection seam
//!
//! The device pool context drives worker devices through these traits; the
//! supervisor binary provides the websocket implementation. Transport-level
//! failures surface as [`crate::error::Error::DeviceOffline`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
use workty_protocol::Platform;

use crate::error::Result;
use crate::instance::ExecutionResult;
use crate::model::Device;

/// Payload handed to a device's `execute` request
#[derive(Debug, Clone)]
pub struct ExecutePayload {
    pub instance_id: Uuid,
    pub workflow_id: Uuid,
    pub workty_id: Uuid,
    /// Opaque code payload from the workty template
    pub code: String,
    pub properties: Value,
}

/// A live, exclusive connection to one device.
///
/// There is exactly one handle per device; the borrow/release protocol keeps
/// it from being shared across concurrent workflows.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// `get_configuration`/`send_configuration` handshake
    async fn configuration(&self) -> Result<Platform>;
    /// Dispatch code and await the single `completed` reply
    async fn execute(&self, payload: ExecutePayload) -> Result<ExecutionResult>;
    /// Heartbeat probe; a missing pong is reported as an error but is not
    /// itself treated as a disconnect
    async fn ping(&self) -> Result<()>;
    /// Tear the connection down, dropping any pending listeners
    async fn close(&self);
}

/// Factory establishing device connections
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<Arc<dyn DeviceHandle>>;
}
