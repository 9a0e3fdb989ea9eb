//! UI settings context
//!
//! Per-account settings document mirrored against the store; the supervisor
//! treats the content as opaque.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;
use workty_protocol::{ClientOp, ClientRequest};

use crate::contexts::{check_permission, Room};
use crate::error::{Error, Result};
use crate::model::UiSettings;
use crate::store::Store;

pub struct UiSettingsContext {
    account_id: Uuid,
    store: Arc<dyn Store>,
    cached: Mutex<Option<UiSettings>>,
    room: Room,
}

impl UiSettingsContext {
    pub fn new(account_id: Uuid, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            store,
            cached: Mutex::new(None),
            room: Room::new(),
        })
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub async fn handle(&self, request: ClientRequest) {
        let outcome = match request.op {
            ClientOp::RefreshAll | ClientOp::Refresh { .. } => self.get().await,
            ClientOp::Upd { patch, .. } => self.update(patch).await,
            other => Err(Error::bad_digest(format!(
                "unsupported ui-settings operation: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    pub async fn get(&self) -> Result<Value> {
        let record = self.store.get_ui_settings(self.account_id).await?;
        *self.cached.lock().await = Some(record.clone());
        Ok(json!({ "uiSettings": record }))
    }

    pub async fn update(&self, patch: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "ui-settings", "update").await?;
        if !patch.is_object() {
            return Err(Error::bad_input("settings must be an object", patch));
        }
        let record = self
            .store
            .update_ui_settings(UiSettings {
                account_id: self.account_id,
                settings: patch,
            })
            .await?;
        *self.cached.lock().await = Some(record.clone());
        Ok(json!({ "uiSettings": record }))
    }
}
