//! In-memory store implementation, used by tests and standalone runs

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::instance::WorktyInstance;
use crate::model::{
    Account, Device, DeviceState, Dictionary, DictionaryEntry, PaymentTransaction, UiSettings,
    WorkflowRecord, Workty, DICTIONARY_NAMES,
};
use crate::store::{DeviceCriteria, Store};

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, Account>,
    devices: HashMap<Uuid, Device>,
    workties: HashMap<Uuid, Workty>,
    workflows: HashMap<Uuid, WorkflowRecord>,
    instances: HashMap<Uuid, Vec<WorktyInstance>>,
    payments: HashMap<Uuid, PaymentTransaction>,
    ui_settings: HashMap<Uuid, UiSettings>,
    dictionaries: HashMap<String, Dictionary>,
    /// (account, resource, permission) triples explicitly denied
    denied: HashSet<(Uuid, String, String)>,
}

/// Hash-map backed [`Store`].
///
/// The single mutex makes `borrow_device` the atomic pool-wide pick the
/// trait contract requires.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut dictionaries = HashMap::new();
        for name in DICTIONARY_NAMES {
            dictionaries.insert(
                name.to_string(),
                Dictionary {
                    name: name.to_string(),
                    entries: vec![DictionaryEntry {
                        name: "default".into(),
                        label: format!("{name} default"),
                    }],
                },
            );
        }
        Self {
            inner: Mutex::new(Inner {
                dictionaries,
                ..Default::default()
            }),
        }
    }

    /// Deny a permission triple; everything not denied is allowed
    pub async fn deny(&self, account_id: Uuid, resource: &str, permission: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .denied
            .insert((account_id, resource.to_string(), permission.to_string()));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_all_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inner.lock().await.accounts.values().cloned().collect())
    }

    async fn get_account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.inner.lock().await.accounts.get(&id).cloned())
    }

    async fn add_account(&self, account: Account) -> Result<Account> {
        self.inner
            .lock()
            .await
            .accounts
            .insert(account.id, account.clone());
        Ok(account)
    }

    async fn update_account(&self, account: Account) -> Result<Account> {
        let mut inner = self.inner.lock().await;
        if !inner.accounts.contains_key(&account.id) {
            return Err(Error::not_found("account", account.id));
        }
        inner.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn del_account(&self, id: Uuid) -> Result<()> {
        self.inner.lock().await.accounts.remove(&id);
        Ok(())
    }

    async fn get_all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.inner.lock().await.devices.values().cloned().collect())
    }

    async fn get_device_by_id(&self, id: Uuid) -> Result<Option<Device>> {
        Ok(self.inner.lock().await.devices.get(&id).cloned())
    }

    async fn add_device(&self, device: Device) -> Result<Device> {
        self.inner
            .lock()
            .await
            .devices
            .insert(device.id, device.clone());
        Ok(device)
    }

    async fn update_device(&self, device: Device) -> Result<Device> {
        let mut inner = self.inner.lock().await;
        if !inner.devices.contains_key(&device.id) {
            return Err(Error::not_found("device", device.id));
        }
        inner.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn del_device(&self, id: Uuid) -> Result<()> {
        self.inner.lock().await.devices.remove(&id);
        Ok(())
    }

    async fn borrow_device(&self, criteria: &DeviceCriteria) -> Result<Option<Device>> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .devices
            .values_mut()
            .filter(|d| d.state == DeviceState::Waiting)
            .find(|d| {
                criteria
                    .protocol
                    .as_ref()
                    .map(|p| *p == d.protocol)
                    .unwrap_or(true)
            });
        match candidate {
            Some(device) => {
                device.state = DeviceState::Running;
                Ok(Some(device.clone()))
            }
            None => Ok(None),
        }
    }

    async fn return_device(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(&id) {
            if device.state == DeviceState::Running {
                device.state = DeviceState::Waiting;
            }
        }
        Ok(())
    }

    async fn set_device_state(&self, id: Uuid, state: DeviceState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(&id) {
            Some(device) => {
                device.state = state;
                Ok(())
            }
            None => Err(Error::not_found("device", id)),
        }
    }

    async fn get_all_workties(&self, account_id: Uuid) -> Result<Vec<Workty>> {
        Ok(self
            .inner
            .lock()
            .await
            .workties
            .values()
            .filter(|w| w.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get_workty_by_id(&self, id: Uuid) -> Result<Option<Workty>> {
        Ok(self.inner.lock().await.workties.get(&id).cloned())
    }

    async fn add_workty(&self, workty: Workty) -> Result<Workty> {
        self.inner
            .lock()
            .await
            .workties
            .insert(workty.id, workty.clone());
        Ok(workty)
    }

    async fn update_workty(&self, workty: Workty) -> Result<Workty> {
        let mut inner = self.inner.lock().await;
        if !inner.workties.contains_key(&workty.id) {
            return Err(Error::not_found("workty", workty.id));
        }
        inner.workties.insert(workty.id, workty.clone());
        Ok(workty)
    }

    async fn del_workty(&self, id: Uuid) -> Result<()> {
        self.inner.lock().await.workties.remove(&id);
        Ok(())
    }

    async fn get_all_workflows(&self, account_id: Uuid) -> Result<Vec<WorkflowRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .workflows
            .values()
            .filter(|w| w.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get_workflow_by_id(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
        Ok(self.inner.lock().await.workflows.get(&id).cloned())
    }

    async fn add_workflow(&self, record: WorkflowRecord) -> Result<WorkflowRecord> {
        self.inner
            .lock()
            .await
            .workflows
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_workflow(&self, record: WorkflowRecord) -> Result<WorkflowRecord> {
        let mut inner = self.inner.lock().await;
        if !inner.workflows.contains_key(&record.id) {
            return Err(Error::not_found("workflow", record.id));
        }
        inner.workflows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn del_workflow(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workflows.remove(&id);
        inner.instances.remove(&id);
        Ok(())
    }

    async fn get_workty_instances(&self, workflow_id: Uuid) -> Result<Vec<WorktyInstance>> {
        Ok(self
            .inner
            .lock()
            .await
            .instances
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_workty_instance(&self, instance: WorktyInstance) -> Result<WorktyInstance> {
        self.inner
            .lock()
            .await
            .instances
            .entry(instance.workflow_id)
            .or_default()
            .push(instance.clone());
        Ok(instance)
    }

    async fn update_workty_instance(&self, instance: WorktyInstance) -> Result<WorktyInstance> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .instances
            .get_mut(&instance.workflow_id)
            .and_then(|list| list.iter_mut().find(|i| i.id == instance.id))
            .ok_or_else(|| Error::not_found("workty instance", instance.id))?;
        *stored = instance.clone();
        Ok(instance)
    }

    async fn del_workty_instance(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for list in inner.instances.values_mut() {
            list.retain(|i| i.id != id);
        }
        Ok(())
    }

    async fn get_all_payments(&self, account_id: Uuid) -> Result<Vec<PaymentTransaction>> {
        Ok(self
            .inner
            .lock()
            .await
            .payments
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get_payment_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        Ok(self.inner.lock().await.payments.get(&id).cloned())
    }

    async fn add_payment(&self, payment: PaymentTransaction) -> Result<PaymentTransaction> {
        self.inner
            .lock()
            .await
            .payments
            .insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn update_payment_msg(&self, id: Uuid, msg: String) -> Result<PaymentTransaction> {
        let mut inner = self.inner.lock().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("payment", id))?;
        payment.msg = msg;
        Ok(payment.clone())
    }

    async fn get_ui_settings(&self, account_id: Uuid) -> Result<UiSettings> {
        Ok(self
            .inner
            .lock()
            .await
            .ui_settings
            .get(&account_id)
            .cloned()
            .unwrap_or(UiSettings {
                account_id,
                settings: Value::Object(Default::default()),
            }))
    }

    async fn update_ui_settings(&self, settings: UiSettings) -> Result<UiSettings> {
        self.inner
            .lock()
            .await
            .ui_settings
            .insert(settings.account_id, settings.clone());
        Ok(settings)
    }

    async fn get_dictionary(&self, name: &str) -> Result<Option<Dictionary>> {
        Ok(self.inner.lock().await.dictionaries.get(name).cloned())
    }

    async fn is_permission_allowed(
        &self,
        account_id: Uuid,
        resource: &str,
        permission: &str,
    ) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(!inner
            .denied
            .contains(&(account_id, resource.to_string(), permission.to_string())))
    }

    async fn has_account_admin_role(&self, account_id: Uuid) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .accounts
            .get(&account_id)
            .map(|a| a.role == "admin")
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(protocol: &str) -> Device {
        Device {
            id: Uuid::new_v4(),
            name: "worker".into(),
            address: "127.0.0.1".into(),
            port: 3000,
            protocol: protocol.into(),
            state: DeviceState::Waiting,
            platform: None,
        }
    }

    #[tokio::test]
    async fn borrow_is_exclusive_until_returned() {
        let store = MemoryStore::new();
        let d = store.add_device(device("ws")).await.unwrap();

        let first = store
            .borrow_device(&DeviceCriteria::default())
            .await
            .unwrap()
            .expect("device should be free");
        assert_eq!(first.id, d.id);
        assert_eq!(first.state, DeviceState::Running);

        // pool exhausted
        assert!(store
            .borrow_device(&DeviceCriteria::default())
            .await
            .unwrap()
            .is_none());

        store.return_device(d.id).await.unwrap();
        assert!(store
            .borrow_device(&DeviceCriteria::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn return_is_idempotent() {
        let store = MemoryStore::new();
        let d = store.add_device(device("ws")).await.unwrap();
        store.return_device(d.id).await.unwrap();
        store.return_device(d.id).await.unwrap();
        let stored = store.get_device_by_id(d.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeviceState::Waiting);
    }

    #[tokio::test]
    async fn borrow_honors_protocol_criteria() {
        let store = MemoryStore::new();
        store.add_device(device("tcp")).await.unwrap();
        let criteria = DeviceCriteria {
            protocol: Some("ws".into()),
        };
        assert!(store.borrow_device(&criteria).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn permissions_default_to_allowed() {
        let store = MemoryStore::new();
        let account = Uuid::new_v4();
        assert!(store
            .is_permission_allowed(account, "workflows", "update")
            .await
            .unwrap());
        store.deny(account, "workflows", "update").await;
        assert!(!store
            .is_permission_allowed(account, "workflows", "update")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dictionaries_are_preloaded() {
        let store = MemoryStore::new();
        for name in DICTIONARY_NAMES {
            assert!(store.get_dictionary(name).await.unwrap().is_some());
        }
        assert!(store.get_dictionary("nope").await.unwrap().is_none());
    }
}
