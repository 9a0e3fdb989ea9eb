//! Persistent-store boundary
//!
//! The supervisor consumes the store through this trait only; queries,
//! schema, and ACL resolution live behind it. All contexts follow the same
//! discipline: persist first, mirror in memory only on success, then
//! broadcast.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::instance::WorktyInstance;
use crate::model::{
    Account, Device, DeviceState, Dictionary, PaymentTransaction, UiSettings, WorkflowRecord,
    Workty,
};

mod memory;

pub use memory::MemoryStore;

/// Criteria for the atomic device-borrow query
#[derive(Debug, Clone, Default)]
pub struct DeviceCriteria {
    /// Restrict to devices speaking this protocol
    pub protocol: Option<String>,
}

/// Asynchronous persistent-store collaborator.
///
/// `borrow_device` must be atomic pool-wide: it is the sole serialization
/// point for device occupancy.
#[async_trait]
pub trait Store: Send + Sync {
    // Accounts
    async fn get_all_accounts(&self) -> Result<Vec<Account>>;
    async fn get_account_by_id(&self, id: Uuid) -> Result<Option<Account>>;
    async fn add_account(&self, account: Account) -> Result<Account>;
    async fn update_account(&self, account: Account) -> Result<Account>;
    async fn del_account(&self, id: Uuid) -> Result<()>;

    // Devices
    async fn get_all_devices(&self) -> Result<Vec<Device>>;
    async fn get_device_by_id(&self, id: Uuid) -> Result<Option<Device>>;
    async fn add_device(&self, device: Device) -> Result<Device>;
    async fn update_device(&self, device: Device) -> Result<Device>;
    async fn del_device(&self, id: Uuid) -> Result<()>;
    /// Atomically pick one free device matching `criteria` and mark it
    /// running; `None` when the pool is exhausted
    async fn borrow_device(&self, criteria: &DeviceCriteria) -> Result<Option<Device>>;
    /// Inverse of `borrow_device`; safe to call on an already-free device
    async fn return_device(&self, id: Uuid) -> Result<()>;
    async fn set_device_state(&self, id: Uuid, state: DeviceState) -> Result<()>;

    // Workties
    async fn get_all_workties(&self, account_id: Uuid) -> Result<Vec<Workty>>;
    async fn get_workty_by_id(&self, id: Uuid) -> Result<Option<Workty>>;
    async fn add_workty(&self, workty: Workty) -> Result<Workty>;
    async fn update_workty(&self, workty: Workty) -> Result<Workty>;
    async fn del_workty(&self, id: Uuid) -> Result<()>;

    // Workflows and their instances
    async fn get_all_workflows(&self, account_id: Uuid) -> Result<Vec<WorkflowRecord>>;
    async fn get_workflow_by_id(&self, id: Uuid) -> Result<Option<WorkflowRecord>>;
    async fn add_workflow(&self, record: WorkflowRecord) -> Result<WorkflowRecord>;
    async fn update_workflow(&self, record: WorkflowRecord) -> Result<WorkflowRecord>;
    async fn del_workflow(&self, id: Uuid) -> Result<()>;
    async fn get_workty_instances(&self, workflow_id: Uuid) -> Result<Vec<WorktyInstance>>;
    async fn add_workty_instance(&self, instance: WorktyInstance) -> Result<WorktyInstance>;
    async fn update_workty_instance(&self, instance: WorktyInstance) -> Result<WorktyInstance>;
    async fn del_workty_instance(&self, id: Uuid) -> Result<()>;

    // Payments
    async fn get_all_payments(&self, account_id: Uuid) -> Result<Vec<PaymentTransaction>>;
    async fn get_payment_by_id(&self, id: Uuid) -> Result<Option<PaymentTransaction>>;
    async fn add_payment(&self, payment: PaymentTransaction) -> Result<PaymentTransaction>;
    /// Payments are append-only except the free-text message
    async fn update_payment_msg(&self, id: Uuid, msg: String) -> Result<PaymentTransaction>;

    // UI settings
    async fn get_ui_settings(&self, account_id: Uuid) -> Result<UiSettings>;
    async fn update_ui_settings(&self, settings: UiSettings) -> Result<UiSettings>;

    // Dictionaries and access control
    async fn get_dictionary(&self, name: &str) -> Result<Option<Dictionary>>;
    async fn is_permission_allowed(
        &self,
        account_id: Uuid,
        resource: &str,
        permission: &str,
    ) -> Result<bool>;
    async fn has_account_admin_role(&self, account_id: Uuid) -> Result<bool>;
}
