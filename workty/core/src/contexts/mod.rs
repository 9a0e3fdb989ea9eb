//! Per-tenant contexts
//!
//! A context manages one entity family: it validates and authorizes client
//! commands, persists them through the store, mirrors the result in memory,
//! and broadcasts a normalized change payload to every channel subscribed to
//! its tenant+context room. The locator owns the registry of tenant roots
//! and hands out non-owning context references.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;
use workty_protocol::ChannelResponse;

use crate::error::{Error, Result};
use crate::store::Store;

pub mod accounts;
pub mod devices;
pub mod dictionaries;
pub mod locator;
pub mod payments;
pub mod ui_settings;
pub mod workflows;
pub mod workties;

pub use accounts::AccountsContext;
pub use devices::DevicePoolContext;
pub use dictionaries::DictionariesContext;
pub use locator::{AccountEvent, ContextLocator, ContextRef};
pub use payments::PaymentsContext;
pub use ui_settings::UiSettingsContext;
pub use workflows::WorkflowsContext;
pub use workties::WorktiesContext;

/// Channel capacity of a context room; lagging subscribers drop messages
/// rather than stalling broadcasts
const ROOM_CAPACITY: usize = 256;

/// Names of the configured contexts; `devices` and `dictionaries` are
/// static (one shared instance process-wide)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextName {
    Accounts,
    Devices,
    Workties,
    Workflows,
    Payments,
    UiSettings,
    Dictionaries,
}

impl ContextName {
    pub const ALL: [ContextName; 7] = [
        ContextName::Accounts,
        ContextName::Devices,
        ContextName::Workties,
        ContextName::Workflows,
        ContextName::Payments,
        ContextName::UiSettings,
        ContextName::Dictionaries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextName::Accounts => "accounts",
            ContextName::Devices => "devices",
            ContextName::Workties => "workties",
            ContextName::Workflows => "workflows",
            ContextName::Payments => "payments",
            ContextName::UiSettings => "ui-settings",
            ContextName::Dictionaries => "dictionaries",
        }
    }

    /// Static contexts are shared across tenants and destroyed only with
    /// the last tenant root
    pub fn is_static(&self) -> bool {
        matches!(self, ContextName::Devices | ContextName::Dictionaries)
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ContextName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::UnknownContext(s.to_string()))
    }
}

/// Broadcast room for one tenant+context channel.
///
/// Every client command yields exactly one envelope on the room; unsolicited
/// change pushes use the same channel without a request id.
#[derive(Clone)]
pub struct Room {
    tx: broadcast::Sender<ChannelResponse>,
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl Room {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(ROOM_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelResponse> {
        self.tx.subscribe()
    }

    /// Broadcast; send errors only mean there are no subscribers
    pub fn push(&self, response: ChannelResponse) {
        let _ = self.tx.send(response);
    }

    pub fn push_ok(&self, payload: Value) {
        self.push(ChannelResponse::ok(None, payload));
    }

    /// Fold a command result into the single response the requester (and
    /// every other subscriber) receives
    pub fn respond(&self, request_id: Option<Uuid>, outcome: Result<Value>) {
        match outcome {
            Ok(payload) => self.push(ChannelResponse::ok(request_id, payload)),
            Err(err) => self.push(ChannelResponse::error(request_id, err.to_object())),
        }
    }
}

/// Authorization pre-check shared by all contexts; runs before any state
/// mutation or store write
pub(crate) async fn check_permission(
    store: &Arc<dyn Store>,
    account_id: Uuid,
    resource: &'static str,
    permission: &'static str,
) -> Result<()> {
    if store
        .is_permission_allowed(account_id, resource, permission)
        .await?
    {
        Ok(())
    } else {
        Err(Error::OperationForbidden {
            resource,
            permission,
        })
    }
}
