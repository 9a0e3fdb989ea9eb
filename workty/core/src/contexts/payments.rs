//! Payments context
//!
//! Bookkeeping for workty purchases. A new transaction copies the purchased
//! workty into the buyer's account through the workties context; records are
//! append-only except for the free-text message.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;
use workty_protocol::{ClientOp, ClientRequest};

use crate::contexts::locator::ContextLocator;
use crate::contexts::{check_permission, ContextName, Room};
use crate::error::{Error, Result};
use crate::model::PaymentTransaction;
use crate::store::Store;

pub struct PaymentsContext {
    account_id: Uuid,
    store: Arc<dyn Store>,
    locator: Weak<ContextLocator>,
    payments: Mutex<HashMap<Uuid, PaymentTransaction>>,
    room: Room,
}

impl PaymentsContext {
    pub fn new(account_id: Uuid, store: Arc<dyn Store>, locator: Weak<ContextLocator>) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            store,
            locator,
            payments: Mutex::new(HashMap::new()),
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
            ClientOp::Upd { id, patch } => self.update_msg(id, patch).await,
            other => Err(Error::bad_digest(format!(
                "payments are append-only: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    pub async fn get_all(&self) -> Result<Value> {
        let records = self.store.get_all_payments(self.account_id).await?;
        let mut payments = self.payments.lock().await;
        payments.clear();
        for record in &records {
            payments.insert(record.id, record.clone());
        }
        Ok(json!({ "payments": records }))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Value> {
        let record = self
            .store
            .get_payment_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("payment", id))?;
        Ok(json!({ "payment": record }))
    }

    /// Record a purchase: persist the transaction, then trigger the workty
    /// copy into the buyer's account
    pub async fn add(&self, entity: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "payments", "add").await?;
        let source_workty_id: Uuid = entity
            .get("source_workty_id")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .ok()
            .flatten()
            .ok_or_else(|| Error::bad_input("source_workty_id is required", entity.clone()))?;

        let source = self
            .store
            .get_workty_by_id(source_workty_id)
            .await?
            .ok_or_else(|| Error::not_found("workty", source_workty_id))?;

        let workties = self
            .locator
            .upgrade()
            .and_then(|locator| locator.get(self.account_id, ContextName::Workties))
            .and_then(|ctx| ctx.into_workties())
            .ok_or_else(|| Error::Store("workties context unavailable".into()))?;
        let copy = workties.register_copy(&source).await?;

        let payment = PaymentTransaction {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            workty_id: copy.id,
            source_workty_id,
            price: source.price,
            msg: entity
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            created: Utc::now(),
        };
        let record = self.store.add_payment(payment).await?;
        self.payments.lock().await.insert(record.id, record.clone());
        Ok(json!({ "payment": record }))
    }

    /// Only the free-text message of a transaction may change
    pub async fn update_msg(&self, id: Uuid, patch: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "payments", "update").await?;
        let msg = patch
            .get("msg")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_input("msg is the only mutable field", patch.clone()))?;
        let record = self.store.update_payment_msg(id, msg.to_string()).await?;
        self.payments.lock().await.insert(record.id, record.clone());
        Ok(json!({ "payment": record }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::locator::AccountEvent;
    use crate::contexts::ContextRef;
    use crate::model::Workty;
    use crate::store::MemoryStore;
    use crate::test_support::{test_account, StubConnector};
    use std::time::Duration;

    // the locator must stay alive: the context only holds a Weak to it
    async fn setup() -> (
        Arc<PaymentsContext>,
        Arc<ContextLocator>,
        Arc<dyn Store>,
        Uuid,
        Workty,
    ) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let seller = store.add_account(test_account("user")).await.unwrap();
        let buyer = store.add_account(test_account("user")).await.unwrap();
        let source = store
            .add_workty(Workty {
                id: Uuid::new_v4(),
                account_id: seller.id,
                name: "scraper".into(),
                description: String::new(),
                category: "default".into(),
                language_type: "default".into(),
                code: "module.exports = 1;".into(),
                properties: vec![],
                price: 25,
                created: Utc::now(),
            })
            .await
            .unwrap();

        let locator = ContextLocator::new(
            Arc::clone(&store),
            Arc::new(StubConnector::healthy()),
            Duration::from_secs(5),
        );
        locator
            .upsert_root_context(AccountEvent::Added(buyer.clone()))
            .await
            .unwrap();
        let payments = match locator.get(buyer.id, ContextName::Payments) {
            Some(ContextRef::Payments(ctx)) => ctx,
            _ => panic!("payments context missing"),
        };
        (payments, locator, store, buyer.id, source)
    }

    #[tokio::test]
    async fn purchase_copies_workty_and_records_transaction() {
        let (payments, _locator, store, buyer_id, source) = setup().await;

        let added = payments
            .add(json!({ "source_workty_id": source.id, "msg": "thanks" }))
            .await
            .unwrap();
        assert_eq!(added["payment"]["price"], 25);
        assert_eq!(added["payment"]["msg"], "thanks");

        // the buyer now owns a fresh copy under a new id
        let owned = store.get_all_workties(buyer_id).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, source.name);
        assert_ne!(owned[0].id, source.id);
    }

    #[tokio::test]
    async fn missing_source_workty_is_rejected() {
        let (payments, _locator, store, buyer_id, _source) = setup().await;

        let err = payments
            .add(json!({ "source_workty_id": Uuid::new_v4() }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
        assert!(store.get_all_workties(buyer_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletion_is_rejected_with_an_envelope() {
        let (payments, _locator, _store, _buyer_id, _source) = setup().await;
        let mut room = payments.room().subscribe();

        payments
            .handle(ClientRequest {
                request_id: Some(Uuid::new_v4()),
                op: ClientOp::Del { id: Uuid::new_v4() },
            })
            .await;

        let response = room.recv().await.unwrap();
        assert!(response.err.is_some());
    }
}
