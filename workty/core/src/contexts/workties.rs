//! Workties context
//!
//! Per-tenant mirror of workty templates (code + metadata) with property
//! CRUD. The payments context calls into `register_copy` when a purchase
//! lands, registering the copied workty for the buyer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;
use workty_protocol::{ClientOp, ClientRequest};

use crate::contexts::{check_permission, Room};
use crate::error::{Error, Result};
use crate::model::{Property, Workty};
use crate::store::Store;

pub struct WorktiesContext {
    account_id: Uuid,
    store: Arc<dyn Store>,
    workties: Mutex<HashMap<Uuid, Workty>>,
    room: Room,
}

impl WorktiesContext {
    pub fn new(account_id: Uuid, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            store,
            workties: Mutex::new(HashMap::new()),
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
            ClientOp::AddWorktyProperty {
                workty_id,
                name,
                value,
            }
            | ClientOp::UpdWorktyProperty {
                workty_id,
                name,
                value,
            } => self.set_property(workty_id, &name, value).await,
            ClientOp::DelWorktyProperty { workty_id, name } => {
                self.del_property(workty_id, &name).await
            }
            other => Err(Error::bad_digest(format!(
                "unsupported workties operation: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    pub async fn get_all(&self) -> Result<Value> {
        let records = self.store.get_all_workties(self.account_id).await?;
        let mut workties = self.workties.lock().await;
        workties.clear();
        for record in &records {
            workties.insert(record.id, record.clone());
        }
        Ok(json!({ "workties": records }))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Value> {
        let record = self
            .store
            .get_workty_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("workty", id))?;
        self.workties.lock().await.insert(record.id, record.clone());
        Ok(json!({ "workty": record }))
    }

    pub async fn add(&self, entity: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workties", "add").await?;
        let name = entity
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_input("workty name is required", entity.clone()))?;
        let code = entity
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_input("workty code is required", entity.clone()))?;
        let workty = Workty {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            name: name.to_string(),
            description: entity
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            category: entity
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string(),
            language_type: entity
                .get("language_type")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string(),
            code: code.to_string(),
            properties: entity
                .get("properties")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| Error::bad_input(format!("invalid properties: {e}"), entity.clone()))?
                .unwrap_or_default(),
            price: entity.get("price").and_then(Value::as_i64).unwrap_or(0),
            created: Utc::now(),
        };
        let record = self.store.add_workty(workty).await?;
        self.workties.lock().await.insert(record.id, record.clone());
        Ok(json!({ "workty": record }))
    }

    pub async fn update(&self, id: Uuid, patch: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workties", "update").await?;
        let mut record = self.owned(id).await?;
        if let Some(name) = patch.get("name").and_then(Value::as_str) {
            record.name = name.to_string();
        }
        if let Some(description) = patch.get("description").and_then(Value::as_str) {
            record.description = description.to_string();
        }
        if let Some(code) = patch.get("code").and_then(Value::as_str) {
            record.code = code.to_string();
        }
        if let Some(price) = patch.get("price").and_then(Value::as_i64) {
            record.price = price;
        }
        let record = self.store.update_workty(record).await?;
        self.workties.lock().await.insert(record.id, record.clone());
        Ok(json!({ "workty": record }))
    }

    pub async fn del(&self, id: Uuid) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workties", "del").await?;
        self.owned(id).await?;
        self.store.del_workty(id).await?;
        self.workties.lock().await.remove(&id);
        Ok(json!({ "workty": { "id": id, "deleted": true } }))
    }

    pub async fn set_property(&self, workty_id: Uuid, name: &str, value: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workties", "update").await?;
        let mut record = self.owned(workty_id).await?;
        match record.properties.iter_mut().find(|p| p.name == name) {
            Some(property) => property.value = value,
            None => record.properties.push(Property {
                name: name.to_string(),
                value,
            }),
        }
        let record = self.store.update_workty(record).await?;
        self.workties.lock().await.insert(record.id, record.clone());
        Ok(json!({ "workty": record }))
    }

    pub async fn del_property(&self, workty_id: Uuid, name: &str) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workties", "update").await?;
        let mut record = self.owned(workty_id).await?;
        let before = record.properties.len();
        record.properties.retain(|p| p.name != name);
        if record.properties.len() == before {
            return Err(Error::not_found("workty property", name));
        }
        let record = self.store.update_workty(record).await?;
        self.workties.lock().await.insert(record.id, record.clone());
        Ok(json!({ "workty": record }))
    }

    /// Register a purchased workty copy for this tenant; called by the
    /// payments context after a transaction is persisted
    pub async fn register_copy(&self, source: &Workty) -> Result<Workty> {
        let copy = source.copy_for(self.account_id);
        let record = self.store.add_workty(copy).await?;
        self.workties.lock().await.insert(record.id, record.clone());
        self.room.push_ok(json!({ "workty": record }));
        Ok(record)
    }

    async fn owned(&self, id: Uuid) -> Result<Workty> {
        let record = self
            .store
            .get_workty_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("workty", id))?;
        if record.account_id != self.account_id {
            return Err(Error::OperationForbidden {
                resource: "workties",
                permission: "update",
            });
        }
        Ok(record)
    }
}
