//! Communication protocol for the workty supervisor
//!
//! This crate defines the message types exchanged over the two websocket
//! surfaces of the supervisor:
//!
//! - Client channels (per tenant+context "room"): commands sent by clients
//!   and the uniform `{err, request_id?, <payload>}` response envelope that
//!   every command and every live change notification is broadcast as
//! - Worker devices: the configuration handshake, code execution dispatch,
//!   and the heartbeat ping/pong

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stable numeric error codes surfaced to clients.
///
/// These codes are part of the client contract and must never be renumbered.
pub mod error_codes {
    pub const ENTITY_NOT_FOUND: u16 = 1;
    pub const BAD_DIGEST: u16 = 2;
    pub const OPERATION_FORBIDDEN: u16 = 3;
    pub const STORE_ERROR: u16 = 4;
    pub const DEVICE_UNAVAILABLE: u16 = 5;
    pub const DEVICE_OFFLINE: u16 = 6;
    pub const INTERNAL: u16 = 7;
}

/// Structured error rendered to clients in place of raw internal failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Stable numeric code from [`error_codes`]
    pub code: u16,
    /// Human readable message
    pub message: String,
    /// Optional documentation link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// The offending input, echoed back when validation fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Command sent by a client on a tenant+context channel.
///
/// The optional `request_id` is echoed back in the matching response so
/// clients can correlate out-of-order responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(flatten)]
    pub op: ClientOp,
}

/// Channel operations.
///
/// `RefreshAll`/`Refresh`/`Add`/`Upd`/`Del` are uniform across contexts;
/// the workflow-specific and workty-specific operations are rejected with a
/// validation error by contexts that do not support them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientOp {
    /// Reload the full entity collection from the store
    RefreshAll,
    /// Reload a single entity by id
    Refresh { id: Uuid },
    /// Create an entity from the given payload
    Add { entity: Value },
    /// Update an entity with a partial payload
    Upd { id: Uuid, patch: Value },
    /// Delete an entity
    Del { id: Uuid },

    /// Start (or resume) a workflow
    Run { id: Uuid },
    /// Pause a workflow, leaving its current instance in `waiting`
    Pause { id: Uuid },
    /// Stop a workflow, re-initializing every instance
    Stop { id: Uuid },

    /// Append a workty instance to a workflow
    AddWorktyInstance { workflow_id: Uuid, instance: Value },
    /// Update a workty instance inside a workflow
    UpdWorktyInstance {
        workflow_id: Uuid,
        instance_id: Uuid,
        patch: Value,
    },
    /// Remove a workty instance from a workflow
    DelWorktyInstance { workflow_id: Uuid, instance_id: Uuid },
    /// Update a single named property of a workty instance
    UpdWorktyInstanceProperty {
        workflow_id: Uuid,
        instance_id: Uuid,
        name: String,
        value: Value,
    },

    /// Add a named property to a workty template
    AddWorktyProperty { workty_id: Uuid, name: String, value: Value },
    /// Update a named property of a workty template
    UpdWorktyProperty { workty_id: Uuid, name: String, value: Value },
    /// Remove a named property from a workty template
    DelWorktyProperty { workty_id: Uuid, name: String },
}

/// Response and live-change envelope broadcast on a tenant+context room.
///
/// Every client command yields exactly one of these to the room; unsolicited
/// change notifications use the same shape with no `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub err: Option<ErrorObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// Entity payload keyed by entity name, e.g. `{"workflow": {...}}`
    #[serde(flatten)]
    pub payload: Value,
}

impl ChannelResponse {
    pub fn ok(request_id: Option<Uuid>, payload: Value) -> Self {
        Self {
            err: None,
            request_id,
            payload,
        }
    }

    pub fn error(request_id: Option<Uuid>, err: ErrorObject) -> Self {
        Self {
            err: Some(err),
            request_id,
            payload: Value::Object(Default::default()),
        }
    }

    /// Emitted once when a channel connection is established
    pub fn initialized() -> Self {
        Self::ok(None, serde_json::json!({ "initialized": true }))
    }
}

/// Platform descriptor reported by a device during the configuration handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// Message sent by the supervisor to a worker device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceRequest {
    /// Request the device platform descriptor
    GetConfiguration,
    /// Dispatch a workty's code for execution with the instance properties
    Execute {
        instance_id: Uuid,
        workflow_id: Uuid,
        workty_id: Uuid,
        /// Opaque code payload, delivered as-is
        code: String,
        properties: Value,
    },
    /// Heartbeat probe
    Ping,
}

/// Message sent by a worker device to the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceReply {
    /// Handshake response carrying the platform descriptor
    SendConfiguration { platform: Platform },
    /// Emitted exactly once per execute request
    Completed {
        instance_id: Uuid,
        err: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Heartbeat acknowledgement
    Pong,
}
