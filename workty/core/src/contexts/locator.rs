//! Context locator
//!
//! Owns every live context. One [`TenantRoot`] per account holds that
//! tenant's private contexts; `devices` and `dictionaries` are process-wide
//! and shared by all roots, created with the first root and torn down with
//! the last. Contexts hold a `Weak` back-reference so lookups never form a
//! reference cycle.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;
use workty_protocol::ClientRequest;

use crate::contexts::{
    AccountsContext, ContextName, DevicePoolContext, DictionariesContext, PaymentsContext, Room,
    UiSettingsContext, WorkflowsContext, WorktiesContext,
};
use crate::error::Result;
use crate::link::DeviceConnector;
use crate::model::Account;
use crate::store::Store;

/// Account lifecycle notifications feeding tenant root maintenance
#[derive(Debug, Clone)]
pub enum AccountEvent {
    Added(Account),
    Updated(Account),
    Deleted(Uuid),
}

/// A handle to one live context, cheap to clone
#[derive(Clone)]
pub enum ContextRef {
    Accounts(Arc<AccountsContext>),
    Devices(Arc<DevicePoolContext>),
    Dictionaries(Arc<DictionariesContext>),
    Workties(Arc<WorktiesContext>),
    Workflows(Arc<WorkflowsContext>),
    Payments(Arc<PaymentsContext>),
    UiSettings(Arc<UiSettingsContext>),
}

impl ContextRef {
    pub fn room(&self) -> &Room {
        match self {
            ContextRef::Accounts(ctx) => ctx.room(),
            ContextRef::Devices(ctx) => ctx.room(),
            ContextRef::Dictionaries(ctx) => ctx.room(),
            ContextRef::Workties(ctx) => ctx.room(),
            ContextRef::Workflows(ctx) => ctx.room(),
            ContextRef::Payments(ctx) => ctx.room(),
            ContextRef::UiSettings(ctx) => ctx.room(),
        }
    }

    /// Route a client command to the context behind this handle
    pub async fn dispatch(&self, account_id: Uuid, request: ClientRequest) {
        match self {
            ContextRef::Accounts(ctx) => ctx.handle(request).await,
            ContextRef::Devices(ctx) => ctx.handle(account_id, request).await,
            ContextRef::Dictionaries(ctx) => ctx.handle(account_id, request).await,
            ContextRef::Workties(ctx) => ctx.handle(request).await,
            ContextRef::Workflows(ctx) => ctx.handle(request).await,
            ContextRef::Payments(ctx) => ctx.handle(request).await,
            ContextRef::UiSettings(ctx) => ctx.handle(request).await,
        }
    }

    pub fn into_devices(self) -> Option<Arc<DevicePoolContext>> {
        match self {
            ContextRef::Devices(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn into_dictionaries(self) -> Option<Arc<DictionariesContext>> {
        match self {
            ContextRef::Dictionaries(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn into_workties(self) -> Option<Arc<WorktiesContext>> {
        match self {
            ContextRef::Workties(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn into_workflows(self) -> Option<Arc<WorkflowsContext>> {
        match self {
            ContextRef::Workflows(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// Owner snapshot plus the tenant's private contexts
struct TenantRoot {
    account: Account,
    contexts: HashMap<ContextName, ContextRef>,
}

struct StaticContexts {
    devices: Arc<DevicePoolContext>,
    dictionaries: Arc<DictionariesContext>,
}

pub struct ContextLocator {
    store: Arc<dyn Store>,
    connector: Arc<dyn DeviceConnector>,
    execute_timeout: Duration,
    context_names: Vec<ContextName>,
    tenants: RwLock<HashMap<Uuid, TenantRoot>>,
    statics: RwLock<Option<StaticContexts>>,
    weak: Weak<ContextLocator>,
}

impl ContextLocator {
    /// Locator serving every known context kind
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn DeviceConnector>,
        execute_timeout: Duration,
    ) -> Arc<Self> {
        Self::with_contexts(store, connector, execute_timeout, ContextName::ALL.to_vec())
    }

    /// Locator restricted to the given context kinds
    pub fn with_contexts(
        store: Arc<dyn Store>,
        connector: Arc<dyn DeviceConnector>,
        execute_timeout: Duration,
        context_names: Vec<ContextName>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            connector,
            execute_timeout,
            context_names,
            tenants: RwLock::new(HashMap::new()),
            statics: RwLock::new(None),
            weak: weak.clone(),
        })
    }

    /// Resolve a context for a tenant. Static contexts resolve for any
    /// registered tenant; unregistered tenants see nothing at all.
    pub fn get(&self, tenant: Uuid, name: ContextName) -> Option<ContextRef> {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let root = tenants.get(&tenant)?;
        if name.is_static() {
            let statics = self.statics.read().unwrap_or_else(PoisonError::into_inner);
            let statics = statics.as_ref()?;
            match name {
                ContextName::Devices => Some(ContextRef::Devices(Arc::clone(&statics.devices))),
                ContextName::Dictionaries => {
                    Some(ContextRef::Dictionaries(Arc::clone(&statics.dictionaries)))
                }
                _ => None,
            }
        } else {
            root.contexts.get(&name).cloned()
        }
    }

    pub fn has_tenant(&self, tenant: Uuid) -> bool {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&tenant)
    }

    pub fn tenant_ids(&self) -> Vec<Uuid> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Cached owner snapshot of a tenant root
    pub fn owner(&self, tenant: Uuid) -> Option<Account> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant)
            .map(|root| root.account.clone())
    }

    /// The shared device pool, independent of any tenant; present while at
    /// least one tenant root is registered
    pub fn static_devices(&self) -> Option<Arc<DevicePoolContext>> {
        self.statics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| Arc::clone(&s.devices))
    }

    /// Apply an account lifecycle event to the tenant registry.
    ///
    /// `Added` for a known tenant degrades to a snapshot refresh, so replay
    /// on reconnect is harmless. Removing the last root tears the static
    /// contexts down with it.
    pub async fn upsert_root_context(&self, event: AccountEvent) -> Result<()> {
        match event {
            AccountEvent::Added(account) | AccountEvent::Updated(account) => {
                {
                    let mut tenants =
                        self.tenants.write().unwrap_or_else(PoisonError::into_inner);
                    if let Some(root) = tenants.get_mut(&account.id) {
                        root.account = account;
                        return Ok(());
                    }
                }
                self.register_tenant(account).await
            }
            AccountEvent::Deleted(id) => {
                self.remove_tenant(id).await;
                Ok(())
            }
        }
    }

    async fn register_tenant(&self, account: Account) -> Result<()> {
        let wants_statics = self
            .context_names
            .iter()
            .any(|name| name.is_static());
        if wants_statics {
            let missing = self
                .statics
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none();
            if missing {
                let devices = DevicePoolContext::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.connector),
                    self.execute_timeout,
                );
                devices.hydrate().await?;
                let dictionaries = DictionariesContext::load(&self.store).await?;
                self.statics
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(StaticContexts {
                        devices,
                        dictionaries,
                    });
            }
        }

        let mut contexts = HashMap::new();
        for name in &self.context_names {
            if name.is_static() {
                continue;
            }
            let context = match name {
                ContextName::Accounts => ContextRef::Accounts(AccountsContext::new(
                    account.id,
                    Arc::clone(&self.store),
                    self.weak.clone(),
                )),
                ContextName::Workties => ContextRef::Workties(WorktiesContext::new(
                    account.id,
                    Arc::clone(&self.store),
                )),
                ContextName::Workflows => {
                    let workflows = WorkflowsContext::new(
                        account.id,
                        Arc::clone(&self.store),
                        self.weak.clone(),
                    );
                    workflows.hydrate().await?;
                    ContextRef::Workflows(workflows)
                }
                ContextName::Payments => ContextRef::Payments(PaymentsContext::new(
                    account.id,
                    Arc::clone(&self.store),
                    self.weak.clone(),
                )),
                ContextName::UiSettings => ContextRef::UiSettings(UiSettingsContext::new(
                    account.id,
                    Arc::clone(&self.store),
                )),
                ContextName::Devices | ContextName::Dictionaries => unreachable!(),
            };
            contexts.insert(*name, context);
        }

        info!(account_id = %account.id, name = %account.name, "tenant root registered");
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.id, TenantRoot { account, contexts });
        Ok(())
    }

    async fn remove_tenant(&self, id: Uuid) {
        let (root, last) = {
            let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
            let root = tenants.remove(&id);
            (root, tenants.is_empty())
        };
        let Some(root) = root else {
            warn!(account_id = %id, "removal of unknown tenant root ignored");
            return;
        };

        if let Some(ContextRef::Workflows(workflows)) =
            root.contexts.get(&ContextName::Workflows).cloned()
        {
            workflows.destroy().await;
        }
        info!(account_id = %id, "tenant root removed");

        if last {
            let statics = self
                .statics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(statics) = statics {
                statics.devices.destroy().await;
                info!("last tenant root removed, static contexts dropped");
            }
        }
    }
}
