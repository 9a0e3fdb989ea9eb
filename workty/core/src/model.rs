//! Domain entities mirrored between the store and the per-tenant contexts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use workty_protocol::Platform;

/// Tenant account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Access-control role name, resolved through the store's permission checks
    pub role: String,
    pub balance: i64,
    pub created: DateTime<Utc>,
}

/// Lifecycle state of a remote worker device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Free for borrowing
    Waiting,
    /// Borrowed by a workflow
    Running,
    /// Transport-level failure observed; the reconnect sweep will retry
    Disconnected,
}

/// Remote worker device.
///
/// The live connection handle is transient and owned by the device pool
/// context; it is never part of the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub state: DeviceState,
    /// Filled in after the first successful configuration handshake
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Device {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }
}

/// Named property attached to workties and workty instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: Value,
}

/// Unit-of-work template: opaque code plus metadata, purchasable between accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workty {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub language_type: String,
    /// Opaque code payload delivered to devices as-is
    pub code: String,
    pub properties: Vec<Property>,
    pub price: i64,
    pub created: DateTime<Utc>,
}

impl Workty {
    /// Clone this workty for a buying account, preserving code and properties
    pub fn copy_for(&self, buyer: Uuid) -> Workty {
        Workty {
            id: Uuid::new_v4(),
            account_id: buyer,
            created: Utc::now(),
            ..self.clone()
        }
    }
}

/// Persistent identity and metadata of a workflow; the runtime sequence of
/// instances lives in [`crate::workflow::WorkflowOrchestrator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub description: String,
}

/// Records a workty purchase/copy event.
///
/// Append-only except for the free-text `msg` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    /// Buyer account
    pub account_id: Uuid,
    /// The workty copied into the buyer's account
    pub workty_id: Uuid,
    /// The workty that was purchased
    pub source_workty_id: Uuid,
    pub price: i64,
    pub msg: String,
    pub created: DateTime<Utc>,
}

/// Named lookup table, loaded once per tenant root and served from cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dictionary {
    pub name: String,
    pub entries: Vec<DictionaryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub name: String,
    pub label: String,
}

/// Per-account UI settings document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSettings {
    pub account_id: Uuid,
    pub settings: Value,
}

/// The fixed set of dictionary names served by the dictionaries context
pub const DICTIONARY_NAMES: &[&str] = &[
    "workty-instance-states",
    "workty-types",
    "workty-validation-states",
    "account-roles",
    "category-types",
    "language-types",
];
