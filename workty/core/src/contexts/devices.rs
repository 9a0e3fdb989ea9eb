//! Device pool context
//!
//! Owns the set of known worker devices, their liveness, and the
//! borrow/release protocol for exclusive-use allocation. The actual atomic
//! "pick one free device" lives in the store; this context mirrors pool
//! state in memory, drives the live connections, and periodically
//! revalidates disconnected devices.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workty_protocol::{ClientOp, ClientRequest};

use crate::contexts::{check_permission, Room};
use crate::error::{Error, Result};
use crate::instance::ExecutionResult;
use crate::link::{DeviceConnector, DeviceHandle, ExecutePayload};
use crate::model::{Device, DeviceState};
use crate::store::{DeviceCriteria, Store};

struct DeviceEntry {
    record: Device,
    /// Live connection; exactly one per device, held only while the device
    /// is reachable
    handle: Option<Arc<dyn DeviceHandle>>,
}

pub struct DevicePoolContext {
    store: Arc<dyn Store>,
    connector: Arc<dyn DeviceConnector>,
    devices: Mutex<HashMap<Uuid, DeviceEntry>>,
    room: Room,
    /// Prevents the disconnected-device sweep from overlapping with itself
    sweep_in_flight: AtomicBool,
    execute_timeout: Duration,
}

impl DevicePoolContext {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn DeviceConnector>,
        execute_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            connector,
            devices: Mutex::new(HashMap::new()),
            room: Room::new(),
            sweep_in_flight: AtomicBool::new(false),
            execute_timeout,
        })
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Entry point for client channel commands; always broadcasts exactly
    /// one response
    pub async fn handle(self: &Arc<Self>, account_id: Uuid, request: ClientRequest) {
        let outcome = match request.op {
            ClientOp::RefreshAll => self.get_all().await,
            ClientOp::Refresh { id } => self.get_by_id(id).await,
            ClientOp::Add { entity } => self.add(account_id, entity).await,
            ClientOp::Upd { id, patch } => self.update(account_id, id, patch).await,
            ClientOp::Del { id } => self.del(account_id, id).await,
            other => Err(Error::bad_digest(format!(
                "unsupported devices operation: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    /// Mirror every persisted device when the pool is first created, so the
    /// reconnect sweep covers devices left `disconnected` by an earlier
    /// process
    pub async fn hydrate(self: &Arc<Self>) -> Result<()> {
        self.get_all().await?;
        Ok(())
    }

    /// Load the pool from the store, merge into memory, and kick off an
    /// asynchronous liveness refresh for every (re)loaded device
    pub async fn get_all(self: &Arc<Self>) -> Result<Value> {
        let records = self.store.get_all_devices().await?;
        let mut devices = self.devices.lock().await;
        for record in &records {
            devices
                .entry(record.id)
                .and_modify(|entry| entry.record = record.clone())
                .or_insert(DeviceEntry {
                    record: record.clone(),
                    handle: None,
                });
        }
        drop(devices);

        for record in &records {
            let ctx = Arc::clone(self);
            let id = record.id;
            tokio::spawn(async move {
                ctx.refresh_device(id).await;
            });
        }

        Ok(json!({ "devices": records }))
    }

    pub async fn get_by_id(self: &Arc<Self>, id: Uuid) -> Result<Value> {
        let record = self
            .store
            .get_device_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("device", id))?;
        {
            let mut devices = self.devices.lock().await;
            devices
                .entry(id)
                .and_modify(|entry| entry.record = record.clone())
                .or_insert(DeviceEntry {
                    record: record.clone(),
                    handle: None,
                });
        }
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            ctx.refresh_device(id).await;
        });
        Ok(json!({ "device": record }))
    }

    pub async fn add(&self, account_id: Uuid, entity: Value) -> Result<Value> {
        if !self.store.has_account_admin_role(account_id).await? {
            return Err(Error::OperationForbidden {
                resource: "devices",
                permission: "add",
            });
        }
        let mut device: Device = serde_json::from_value(entity.clone())
            .map_err(|e| Error::bad_input(format!("invalid device: {e}"), entity))?;
        device.state = DeviceState::Disconnected;
        let record = self.store.add_device(device).await?;
        self.devices.lock().await.insert(
            record.id,
            DeviceEntry {
                record: record.clone(),
                handle: None,
            },
        );
        Ok(json!({ "device": record }))
    }

    pub async fn update(&self, account_id: Uuid, id: Uuid, patch: Value) -> Result<Value> {
        check_permission(&self.store, account_id, "devices", "update").await?;
        let mut record = self
            .store
            .get_device_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("device", id))?;
        if let Some(name) = patch.get("name").and_then(Value::as_str) {
            record.name = name.to_string();
        }
        if let Some(address) = patch.get("address").and_then(Value::as_str) {
            record.address = address.to_string();
        }
        if let Some(port) = patch.get("port").and_then(Value::as_u64) {
            record.port = port as u16;
        }
        let record = self.store.update_device(record).await?;
        if let Some(entry) = self.devices.lock().await.get_mut(&id) {
            entry.record = record.clone();
        }
        Ok(json!({ "device": record }))
    }

    /// Delete a device; any live connection is closed first
    pub async fn del(&self, account_id: Uuid, id: Uuid) -> Result<Value> {
        if !self.store.has_account_admin_role(account_id).await? {
            return Err(Error::OperationForbidden {
                resource: "devices",
                permission: "del",
            });
        }
        self.store.del_device(id).await?;
        let removed = self.devices.lock().await.remove(&id);
        if let Some(entry) = removed {
            if let Some(handle) = entry.handle {
                handle.close().await;
            }
        }
        Ok(json!({ "device": { "id": id, "deleted": true } }))
    }

    /// Borrow a free device for exclusive use.
    ///
    /// Allocation is delegated to the store's atomic pick; the returned
    /// device's new state is mirrored locally. Callers must not retry
    /// synchronously on failure — they degrade to waiting for the sweep.
    pub async fn borrow(&self, criteria: &DeviceCriteria) -> Result<Device> {
        let device = self
            .store
            .borrow_device(criteria)
            .await?
            .ok_or(Error::DeviceUnavailable)?;
        {
            let mut devices = self.devices.lock().await;
            devices
                .entry(device.id)
                .and_modify(|entry| entry.record.state = DeviceState::Running)
                .or_insert(DeviceEntry {
                    record: device.clone(),
                    handle: None,
                });
        }
        info!(device_id = %device.id, "device borrowed");
        self.room.push_ok(json!({ "device": device }));
        Ok(device)
    }

    /// Release a borrowed device; always safe to call, even when the device
    /// is already free
    pub async fn release(&self, device_id: Uuid) -> Result<()> {
        self.store.return_device(device_id).await?;
        let mut devices = self.devices.lock().await;
        if let Some(entry) = devices.get_mut(&device_id) {
            if entry.record.state == DeviceState::Running {
                entry.record.state = DeviceState::Waiting;
                let record = entry.record.clone();
                drop(devices);
                info!(%device_id, "device released");
                self.room.push_ok(json!({ "device": record }));
            }
        }
        Ok(())
    }

    /// Execute a workty's code on a device, returning the worker's
    /// completion result exactly once.
    ///
    /// Connection failures, timeouts, and mid-execution disconnects all mean
    /// "device went offline": the device transitions to `disconnected`, its
    /// socket is torn down, and the error is returned to the caller.
    pub async fn execute_code(
        &self,
        device_id: Uuid,
        payload: ExecutePayload,
    ) -> Result<ExecutionResult> {
        let handle = match self.ensure_connected(device_id).await {
            Ok(handle) => handle,
            Err(err) => {
                self.mark_disconnected(device_id).await;
                return Err(err);
            }
        };

        let outcome = tokio::time::timeout(self.execute_timeout, handle.execute(payload)).await;
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                warn!(%device_id, error = %err, "device failed mid-execution");
                self.mark_disconnected(device_id).await;
                Err(err)
            }
            Err(_) => {
                warn!(%device_id, timeout = ?self.execute_timeout, "device execution timed out");
                self.mark_disconnected(device_id).await;
                Err(Error::DeviceOffline(format!(
                    "execution timed out after {:?}",
                    self.execute_timeout
                )))
            }
        }
    }

    /// Heartbeat pass: ping every connected device. A missing pong is only
    /// logged; disconnection is driven by transport errors alone.
    pub async fn heartbeat(&self) {
        let handles: Vec<(Uuid, Arc<dyn DeviceHandle>)> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .filter_map(|(id, entry)| entry.handle.clone().map(|h| (*id, h)))
                .collect()
        };
        let mut alive = Vec::new();
        for (id, handle) in handles {
            match handle.ping().await {
                Ok(()) => alive.push(id),
                Err(err) => warn!(device_id = %id, error = %err, "heartbeat ping failed"),
            }
        }
        if !alive.is_empty() {
            self.room.push_ok(json!({ "heartbeat": alive }));
        }
    }

    /// Reconnect pass over every `disconnected` device. Passes are mutually
    /// exclusive; a pass already in flight makes this call a no-op.
    pub async fn sweep(self: &Arc<Self>) {
        if self
            .sweep_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("device sweep already in flight, skipping");
            return;
        }

        let disconnected: Vec<Uuid> = {
            let devices = self.devices.lock().await;
            devices
                .values()
                .filter(|entry| entry.record.state == DeviceState::Disconnected)
                .map(|entry| entry.record.id)
                .collect()
        };
        debug!(count = disconnected.len(), "device reconnect sweep");
        for id in disconnected {
            self.refresh_device(id).await;
        }

        self.sweep_in_flight.store(false, Ordering::SeqCst);
    }

    /// Attempt a liveness refresh: connect, run the configuration
    /// handshake, and bring a disconnected device back to `waiting`
    pub async fn refresh_device(self: &Arc<Self>, device_id: Uuid) {
        let record = {
            let devices = self.devices.lock().await;
            match devices.get(&device_id) {
                Some(entry) if entry.handle.is_some() => return,
                Some(entry) => entry.record.clone(),
                None => return,
            }
        };

        match self.connect_and_configure(&record).await {
            Ok((handle, platform)) => {
                let mut devices = self.devices.lock().await;
                let Some(entry) = devices.get_mut(&device_id) else {
                    handle.close().await;
                    return;
                };
                entry.handle = Some(handle);
                entry.record.platform = Some(platform);
                let was_disconnected = entry.record.state == DeviceState::Disconnected;
                if was_disconnected {
                    entry.record.state = DeviceState::Waiting;
                }
                let record = entry.record.clone();
                drop(devices);
                if was_disconnected {
                    if let Err(err) = self
                        .store
                        .set_device_state(device_id, DeviceState::Waiting)
                        .await
                    {
                        warn!(%device_id, error = %err, "failed to persist reconnect");
                    }
                }
                info!(%device_id, "device is reachable");
                self.room.push_ok(json!({ "device": record }));
            }
            Err(err) => {
                debug!(%device_id, error = %err, "device refresh failed");
                self.mark_disconnected(device_id).await;
            }
        }
    }

    async fn connect_and_configure(
        &self,
        record: &Device,
    ) -> Result<(Arc<dyn DeviceHandle>, workty_protocol::Platform)> {
        let handle = self.connector.connect(record).await?;
        match handle.configuration().await {
            Ok(platform) => Ok((handle, platform)),
            Err(err) => {
                handle.close().await;
                Err(err)
            }
        }
    }

    async fn ensure_connected(&self, device_id: Uuid) -> Result<Arc<dyn DeviceHandle>> {
        let (existing, record) = {
            let devices = self.devices.lock().await;
            let entry = devices
                .get(&device_id)
                .ok_or_else(|| Error::not_found("device", device_id))?;
            (entry.handle.clone(), entry.record.clone())
        };
        if let Some(handle) = existing {
            return Ok(handle);
        }
        let (handle, platform) = self.connect_and_configure(&record).await?;
        let mut devices = self.devices.lock().await;
        let entry = devices
            .get_mut(&device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;
        entry.handle = Some(handle.clone());
        entry.record.platform = Some(platform);
        Ok(handle)
    }

    async fn mark_disconnected(&self, device_id: Uuid) {
        let changed = {
            let mut devices = self.devices.lock().await;
            match devices.get_mut(&device_id) {
                Some(entry) => {
                    if let Some(handle) = entry.handle.take() {
                        handle.close().await;
                    }
                    if entry.record.state != DeviceState::Disconnected {
                        entry.record.state = DeviceState::Disconnected;
                        Some(entry.record.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(record) = changed {
            if let Err(err) = self
                .store
                .set_device_state(device_id, DeviceState::Disconnected)
                .await
            {
                warn!(%device_id, error = %err, "failed to persist disconnect");
            }
            self.room.push_ok(json!({ "device": record }));
        }
    }

    /// Teardown when the last tenant root goes away: close every socket and
    /// hand borrowed devices back to the store as free
    pub async fn destroy(&self) {
        let mut devices = self.devices.lock().await;
        for entry in devices.values_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.close().await;
            }
            if entry.record.state == DeviceState::Running {
                entry.record.state = DeviceState::Waiting;
                if let Err(err) = self.store.return_device(entry.record.id).await {
                    warn!(device_id = %entry.record.id, error = %err, "device return on teardown failed");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn state_of(&self, device_id: Uuid) -> Option<DeviceState> {
        self.devices
            .lock()
            .await
            .get(&device_id)
            .map(|entry| entry.record.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_device, StubConnector};
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn pool(
        store: Arc<MemoryStore>,
        connector: Arc<StubConnector>,
    ) -> Arc<DevicePoolContext> {
        DevicePoolContext::new(store, connector, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn borrow_fails_when_pool_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let device = store.add_device(test_device()).await.unwrap();
        let ctx = pool(store, Arc::new(StubConnector::healthy()));

        ctx.borrow(&DeviceCriteria::default()).await.unwrap();
        let err = ctx.borrow(&DeviceCriteria::default()).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable));

        ctx.release(device.id).await.unwrap();
        assert_eq!(ctx.state_of(device.id).await, Some(DeviceState::Waiting));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_broadcasts_once() {
        let store = Arc::new(MemoryStore::new());
        let device = store.add_device(test_device()).await.unwrap();
        let ctx = pool(store, Arc::new(StubConnector::healthy()));
        ctx.borrow(&DeviceCriteria::default()).await.unwrap();

        let mut rx = ctx.room().subscribe();
        ctx.release(device.id).await.unwrap();
        ctx.release(device.id).await.unwrap();

        // exactly one state-change broadcast for the double release
        let first = rx.recv().await.unwrap();
        assert!(first.payload["device"].is_object());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn missed_pong_is_logged_but_keeps_the_device_connected() {
        let store = Arc::new(MemoryStore::new());
        let device = store.add_device(test_device()).await.unwrap();
        let ctx = pool(store, Arc::new(StubConnector::failing_ping()));
        ctx.borrow(&DeviceCriteria::default()).await.unwrap();
        // connects the socket so the heartbeat has a handle to ping
        ctx.refresh_device(device.id).await;

        ctx.heartbeat().await;

        assert!(logs_contain("heartbeat ping failed"));
        assert_eq!(ctx.state_of(device.id).await, Some(DeviceState::Running));
    }

    #[tokio::test]
    async fn execute_failure_marks_device_disconnected() {
        let store = Arc::new(MemoryStore::new());
        let device = store.add_device(test_device()).await.unwrap();
        let connector = Arc::new(StubConnector::failing_execute("socket reset"));
        let ctx = pool(Arc::clone(&store), connector);
        let borrowed = ctx.borrow(&DeviceCriteria::default()).await.unwrap();

        let err = ctx
            .execute_code(
                borrowed.id,
                ExecutePayload {
                    instance_id: Uuid::new_v4(),
                    workflow_id: Uuid::new_v4(),
                    workty_id: Uuid::new_v4(),
                    code: "noop".into(),
                    properties: json!({}),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeviceOffline(_)));
        assert_eq!(
            ctx.state_of(device.id).await,
            Some(DeviceState::Disconnected)
        );
        let stored = store.get_device_by_id(device.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn hung_execution_times_out_as_offline() {
        let store = Arc::new(MemoryStore::new());
        let device = store.add_device(test_device()).await.unwrap();
        let connector = Arc::new(StubConnector::hanging_execute());
        let ctx = pool(store, connector);
        ctx.borrow(&DeviceCriteria::default()).await.unwrap();

        let err = ctx
            .execute_code(
                device.id,
                ExecutePayload {
                    instance_id: Uuid::new_v4(),
                    workflow_id: Uuid::new_v4(),
                    workty_id: Uuid::new_v4(),
                    code: "loop {}".into(),
                    properties: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceOffline(_)));
    }

    #[tokio::test]
    async fn sweep_reconnects_disconnected_devices() {
        let store = Arc::new(MemoryStore::new());
        let mut record = test_device();
        record.state = DeviceState::Disconnected;
        let device = store.add_device(record).await.unwrap();
        let ctx = pool(store, Arc::new(StubConnector::healthy()));
        ctx.get_all().await.unwrap();

        ctx.sweep().await;
        assert_eq!(ctx.state_of(device.id).await, Some(DeviceState::Waiting));
    }

    #[tokio::test]
    async fn overlapping_sweeps_are_mutually_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let mut record = test_device();
        record.state = DeviceState::Disconnected;
        store.add_device(record).await.unwrap();

        let connect_attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StubConnector::slow_connect(
            Duration::from_millis(100),
            Arc::clone(&connect_attempts),
        ));
        let ctx = pool(store, connector);
        ctx.get_all().await.unwrap();
        // let the spawned refreshes from get_all settle
        tokio::time::sleep(Duration::from_millis(250)).await;
        let baseline = connect_attempts.load(Ordering::SeqCst);

        let first = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.sweep().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.sweep().await; // should bail immediately
        first.await.unwrap();

        assert_eq!(connect_attempts.load(Ordering::SeqCst), baseline + 1);
    }

    #[tokio::test]
    async fn non_admin_cannot_add_devices() {
        let store = Arc::new(MemoryStore::new());
        let ctx = pool(store, Arc::new(StubConnector::healthy()));
        let err = ctx
            .add(Uuid::new_v4(), serde_json::to_value(test_device()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationForbidden { .. }));
    }
}
