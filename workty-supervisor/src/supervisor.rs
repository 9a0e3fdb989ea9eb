//! Supervisor root
//!
//! Bootstraps the tenant registry from the store and drives the three
//! periodic loops: device reconnect sweep, device heartbeat, and per-tenant
//! workflow resumption sweep.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use workty_core::contexts::{AccountEvent, ContextLocator, ContextName, ContextRef};
use workty_core::error::Result;
use workty_core::link::DeviceConnector;
use workty_core::store::Store;

use crate::config::Config;

/// Load every account and register its tenant root with the locator
pub async fn bootstrap(
    store: Arc<dyn Store>,
    connector: Arc<dyn DeviceConnector>,
    config: &Config,
) -> Result<Arc<ContextLocator>> {
    let locator = ContextLocator::new(store.clone(), connector, config.execute_timeout);

    let accounts = store.get_all_accounts().await?;
    info!(count = accounts.len(), "bootstrapping tenant roots");
    for account in accounts {
        locator
            .upsert_root_context(AccountEvent::Added(account))
            .await?;
    }

    Ok(locator)
}

/// Spawn the periodic loops; each one stops when the token cancels
pub fn spawn_loops(
    locator: Arc<ContextLocator>,
    config: &Config,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // device reconnect sweep
    {
        let locator = Arc::clone(&locator);
        let shutdown = shutdown.clone();
        let interval = config.sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(devices) = locator.static_devices() {
                            devices.sweep().await;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("device sweep loop stopping");
                        break;
                    }
                }
            }
        }));
    }

    // device heartbeat
    {
        let locator = Arc::clone(&locator);
        let shutdown = shutdown.clone();
        let interval = config.heartbeat_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(devices) = locator.static_devices() {
                            devices.heartbeat().await;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("heartbeat loop stopping");
                        break;
                    }
                }
            }
        }));
    }

    // per-tenant workflow resumption sweep
    {
        let shutdown = shutdown.clone();
        let interval = config.sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        resume_tenants(&locator).await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("workflow resumption loop stopping");
                        break;
                    }
                }
            }
        }));
    }

    handles
}

async fn resume_tenants(locator: &Arc<ContextLocator>) {
    for tenant in locator.tenant_ids() {
        let Some(ContextRef::Workflows(workflows)) = locator.get(tenant, ContextName::Workflows)
        else {
            error!(%tenant, "tenant root missing its workflows context");
            continue;
        };
        workflows.sweep().await;
    }
}
