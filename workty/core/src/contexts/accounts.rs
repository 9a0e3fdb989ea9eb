//! Accounts context
//!
//! CRUD mirror over tenant accounts. Every mutation is forwarded to the
//! context locator so tenant roots (and their cached ACL/balance snapshots)
//! stay in sync with the store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;
use workty_protocol::{ClientOp, ClientRequest};

use crate::contexts::locator::{AccountEvent, ContextLocator};
use crate::contexts::{check_permission, Room};
use crate::error::{Error, Result};
use crate::model::Account;
use crate::store::Store;

pub struct AccountsContext {
    account_id: Uuid,
    store: Arc<dyn Store>,
    locator: Weak<ContextLocator>,
    accounts: Mutex<HashMap<Uuid, Account>>,
    room: Room,
}

impl AccountsContext {
    pub fn new(account_id: Uuid, store: Arc<dyn Store>, locator: Weak<ContextLocator>) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            store,
            locator,
            accounts: Mutex::new(HashMap::new()),
            room: Room::new(),
        })
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub async fn handle(&self, request: ClientRequest) {
        let outcome = match request.op {
            ClientOp::RefreshAll => self.get_all().await,
            ClientOp::Refresh { id } => self.get_by_id(id).await,
            ClientOp::Add { entity } => self.add(entity).await,
            ClientOp::Upd { id, patch } => self.update(id, patch).await,
            ClientOp::Del { id } => self.del(id).await,
            other => Err(Error::bad_digest(format!(
                "unsupported accounts operation: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    /// Admins see the whole account list; everyone else only their own
    pub async fn get_all(&self) -> Result<Value> {
        let records = if self.store.has_account_admin_role(self.account_id).await? {
            self.store.get_all_accounts().await?
        } else {
            self.store
                .get_account_by_id(self.account_id)
                .await?
                .into_iter()
                .collect()
        };
        let mut accounts = self.accounts.lock().await;
        accounts.clear();
        for record in &records {
            accounts.insert(record.id, record.clone());
        }
        Ok(json!({ "accounts": records }))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Value> {
        let record = self
            .store
            .get_account_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("account", id))?;
        self.accounts.lock().await.insert(record.id, record.clone());
        Ok(json!({ "account": record }))
    }

    pub async fn add(&self, entity: Value) -> Result<Value> {
        if !self.store.has_account_admin_role(self.account_id).await? {
            return Err(Error::OperationForbidden {
                resource: "accounts",
                permission: "add",
            });
        }
        let name = entity
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_input("account name is required", entity.clone()))?;
        let email = entity
            .get("email")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_input("account email is required", entity.clone()))?;
        let account = Account {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            role: entity
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string(),
            balance: entity.get("balance").and_then(Value::as_i64).unwrap_or(0),
            created: Utc::now(),
        };
        let record = self.store.add_account(account).await?;
        self.accounts.lock().await.insert(record.id, record.clone());
        self.notify_locator(AccountEvent::Added(record.clone())).await;
        Ok(json!({ "account": record }))
    }

    pub async fn update(&self, id: Uuid, patch: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "accounts", "update").await?;
        let mut record = self
            .store
            .get_account_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("account", id))?;
        if let Some(name) = patch.get("name").and_then(Value::as_str) {
            record.name = name.to_string();
        }
        if let Some(email) = patch.get("email").and_then(Value::as_str) {
            record.email = email.to_string();
        }
        if let Some(balance) = patch.get("balance").and_then(Value::as_i64) {
            record.balance = balance;
        }
        let record = self.store.update_account(record).await?;
        self.accounts.lock().await.insert(record.id, record.clone());
        self.notify_locator(AccountEvent::Updated(record.clone())).await;
        Ok(json!({ "account": record }))
    }

    pub async fn del(&self, id: Uuid) -> Result<Value> {
        if !self.store.has_account_admin_role(self.account_id).await? {
            return Err(Error::OperationForbidden {
                resource: "accounts",
                permission: "del",
            });
        }
        self.store.del_account(id).await?;
        self.accounts.lock().await.remove(&id);
        self.notify_locator(AccountEvent::Deleted(id)).await;
        Ok(json!({ "account": { "id": id, "deleted": true } }))
    }

    async fn notify_locator(&self, event: AccountEvent) {
        if let Some(locator) = self.locator.upgrade() {
            if let Err(err) = locator.upsert_root_context(event).await {
                tracing::error!(error = %err, "tenant root upsert failed");
            }
        }
    }
}
