//! Workflows context
//!
//! Bridges client commands to the per-workflow orchestrators and to
//! persistence. Device borrow-before-run and release-on-pause/stop/complete
//! happen here, keeping the orchestrator itself free of device concerns. A
//! periodic sweep resumes workflows left in `waiting`, one at a time to
//! bound borrow pressure on the device pool.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workty_protocol::{ChannelResponse, ClientOp, ClientRequest, ErrorObject};

use crate::contexts::locator::ContextLocator;
use crate::contexts::{check_permission, ContextName, DevicePoolContext, Room};
use crate::error::{Error, Result};
use crate::instance::{ExecutionRequest, ExecutionResult, InstancePatch, WorktyInstance};
use crate::link::ExecutePayload;
use crate::model::WorkflowRecord;
use crate::store::{DeviceCriteria, Store};
use crate::workflow::{WorkflowEvent, WorkflowOrchestrator};

pub struct WorkflowsContext {
    account_id: Uuid,
    store: Arc<dyn Store>,
    locator: Weak<ContextLocator>,
    workflows: Mutex<HashMap<Uuid, WorkflowOrchestrator>>,
    room: Room,
    /// Prevents the resumption sweep from overlapping with itself
    sweep_in_flight: AtomicBool,
}

impl WorkflowsContext {
    pub fn new(account_id: Uuid, store: Arc<dyn Store>, locator: Weak<ContextLocator>) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            store,
            locator,
            workflows: Mutex::new(HashMap::new()),
            room: Room::new(),
            sweep_in_flight: AtomicBool::new(false),
        })
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    fn devices(&self) -> Result<Arc<DevicePoolContext>> {
        self.locator
            .upgrade()
            .and_then(|locator| locator.get(self.account_id, ContextName::Devices))
            .and_then(|ctx| ctx.into_devices())
            .ok_or_else(|| Error::Store("device pool context unavailable".into()))
    }

    pub async fn handle(self: &Arc<Self>, request: ClientRequest) {
        let outcome = match request.op {
            ClientOp::RefreshAll => self.get_all().await,
            ClientOp::Refresh { id } => self.get_by_id(id).await,
            ClientOp::Add { entity } => self.add(entity).await,
            ClientOp::Upd { id, patch } => self.update(id, patch).await,
            ClientOp::Del { id } => self.del(id).await,
            ClientOp::Run { id } => self.run(id).await,
            ClientOp::Pause { id } => self.pause(id).await,
            ClientOp::Stop { id } => self.stop(id).await,
            ClientOp::AddWorktyInstance {
                workflow_id,
                instance,
            } => self.add_workty_instance(workflow_id, instance).await,
            ClientOp::UpdWorktyInstance {
                workflow_id,
                instance_id,
                patch,
            } => self.update_workty_instance(workflow_id, instance_id, patch).await,
            ClientOp::DelWorktyInstance {
                workflow_id,
                instance_id,
            } => self.del_workty_instance(workflow_id, instance_id).await,
            ClientOp::UpdWorktyInstanceProperty {
                workflow_id,
                instance_id,
                name,
                value,
            } => {
                self.update_workty_instance_property(workflow_id, instance_id, &name, value)
                    .await
            }
            other => Err(Error::bad_digest(format!(
                "unsupported workflows operation: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    /// Mirror every persisted workflow. Runs once at tenant-root
    /// registration so a workflow left `waiting` by an earlier process is
    /// visible to the resumption sweep without waiting for a client refresh.
    pub async fn hydrate(&self) -> Result<()> {
        self.get_all().await?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Value> {
        let records = self.store.get_all_workflows(self.account_id).await?;
        let mut workflows = self.workflows.lock().await;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            if !workflows.contains_key(&record.id) {
                let instances = self.store.get_workty_instances(record.id).await?;
                workflows.insert(record.id, WorkflowOrchestrator::load(record.clone(), instances));
            }
            // live orchestrators win over stale store reads
            if let Some(orchestrator) = workflows.get(&record.id) {
                snapshots.push(orchestrator.snapshot());
            }
        }
        Ok(json!({ "workflows": snapshots }))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Value> {
        let workflows = self.workflows.lock().await;
        match workflows.get(&id) {
            Some(orchestrator) => Ok(json!({ "workflow": orchestrator.snapshot() })),
            None => {
                drop(workflows);
                let record = self
                    .store
                    .get_workflow_by_id(id)
                    .await?
                    .ok_or_else(|| Error::not_found("workflow", id))?;
                let instances = self.store.get_workty_instances(id).await?;
                let orchestrator = WorkflowOrchestrator::load(record, instances);
                let snapshot = orchestrator.snapshot();
                self.workflows.lock().await.insert(id, orchestrator);
                Ok(json!({ "workflow": snapshot }))
            }
        }
    }

    pub async fn add(&self, entity: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "add").await?;
        let name = entity
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_input("workflow name is required", entity.clone()))?;
        let record = WorkflowRecord {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            name: name.to_string(),
            description: entity
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        let record = self.store.add_workflow(record).await?;
        let orchestrator = WorkflowOrchestrator::new(record);
        let snapshot = orchestrator.snapshot();
        self.workflows
            .lock()
            .await
            .insert(orchestrator.id(), orchestrator);
        Ok(json!({ "workflow": snapshot }))
    }

    pub async fn update(&self, id: Uuid, patch: Value) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        let name = patch.get("name").and_then(Value::as_str).map(String::from);
        let description = patch
            .get("description")
            .and_then(Value::as_str)
            .map(String::from);

        // resolve the orchestrator before any store write, so an unknown id
        // cannot leave an updated record behind
        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        let mut record = orchestrator.record().clone();
        if let Some(name) = &name {
            record.name = name.clone();
        }
        if let Some(description) = &description {
            record.description = description.clone();
        }
        self.store.update_workflow(record).await?;
        orchestrator.update_record(name, description);
        Ok(json!({ "workflow": orchestrator.snapshot() }))
    }

    pub async fn del(&self, id: Uuid) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "del").await?;
        self.store.del_workflow(id).await?;
        let removed = self.workflows.lock().await.remove(&id);
        if let Some(orchestrator) = removed {
            if let Some(device_id) = orchestrator.device_id {
                self.release_device(device_id).await;
            }
        }
        Ok(json!({ "workflow": { "id": id, "deleted": true } }))
    }

    /// Borrow a device and start (or resume) the workflow.
    ///
    /// On borrow failure the workflow is paused immediately, leaving it
    /// eligible for the next resumption sweep, and the error surfaces to
    /// clients.
    pub async fn run(self: &Arc<Self>, id: Uuid) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "run").await?;
        let devices = self.devices()?;

        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        if orchestrator.device_id.is_some() {
            // already holding a device: the run is in progress
            return Ok(json!({ "workflow": orchestrator.snapshot() }));
        }

        match devices.borrow(&DeviceCriteria::default()).await {
            Ok(device) => {
                info!(workflow_id = %id, device_id = %device.id, "workflow starting");
                orchestrator.device_id = Some(device.id);
                let events = orchestrator.run();
                let snapshot = orchestrator.snapshot();
                drop(workflows);
                self.process_events(events).await;
                Ok(json!({ "workflow": snapshot }))
            }
            Err(err) => {
                warn!(workflow_id = %id, error = %err, "device borrow failed, pausing workflow");
                let events = orchestrator.pause();
                drop(workflows);
                self.process_events(events).await;
                Err(err)
            }
        }
    }

    /// Release the held device (if any), then move the cursor instance to
    /// `waiting`
    pub async fn pause(self: &Arc<Self>, id: Uuid) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        let device_id = orchestrator.device_id.take();
        let events = orchestrator.pause();
        let snapshot = orchestrator.snapshot();
        drop(workflows);
        if let Some(device_id) = device_id {
            self.release_device(device_id).await;
        }
        self.process_events(events).await;
        Ok(json!({ "workflow": snapshot }))
    }

    /// Release the held device (if any), then re-initialize every instance
    pub async fn stop(self: &Arc<Self>, id: Uuid) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        let device_id = orchestrator.device_id.take();
        let events = orchestrator.stop();
        let snapshot = orchestrator.snapshot();
        drop(workflows);
        if let Some(device_id) = device_id {
            self.release_device(device_id).await;
        }
        self.process_events(events).await;
        Ok(json!({ "workflow": snapshot }))
    }

    pub async fn add_workty_instance(
        self: &Arc<Self>,
        workflow_id: Uuid,
        entity: Value,
    ) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        let workty_id: Uuid = entity
            .get("workty_id")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .ok()
            .flatten()
            .ok_or_else(|| Error::bad_input("workty_id is required", entity.clone()))?;
        let workty = self
            .store
            .get_workty_by_id(workty_id)
            .await?
            .ok_or_else(|| Error::not_found("workty", workty_id))?;

        // language type must be known to the dictionaries context
        if let Some(dictionaries) = self
            .locator
            .upgrade()
            .and_then(|locator| locator.get(self.account_id, ContextName::Dictionaries))
            .and_then(|ctx| ctx.into_dictionaries())
        {
            if !dictionaries.contains("language-types", &workty.language_type) {
                return Err(Error::bad_input(
                    format!("unknown language type: {}", workty.language_type),
                    entity,
                ));
            }
        }

        let name = entity
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&workty.name)
            .to_string();

        // the workflow must be mirrored before the instance is persisted,
        // or an unknown id would orphan the stored instance
        if !self.workflows.lock().await.contains_key(&workflow_id) {
            return Err(Error::not_found("workflow", workflow_id));
        }
        let instance =
            WorktyInstance::new(workflow_id, workty_id, name, workty.properties.clone());
        let persisted = self.store.add_workty_instance(instance.clone()).await?;

        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| Error::not_found("workflow", workflow_id))?;
        let events = orchestrator.add_instance(instance);
        drop(workflows);
        self.process_events(events).await;
        Ok(json!({ "worktyInstance": persisted }))
    }

    pub async fn update_workty_instance(
        self: &Arc<Self>,
        workflow_id: Uuid,
        instance_id: Uuid,
        patch: Value,
    ) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        let patch: InstancePatch = serde_json::from_value(patch.clone())
            .map_err(|e| Error::bad_input(format!("invalid instance patch: {e}"), patch))?;

        // persist the patched shape before mutating the live instance
        let persisted = {
            let workflows = self.workflows.lock().await;
            let orchestrator = workflows
                .get(&workflow_id)
                .ok_or_else(|| Error::not_found("workflow", workflow_id))?;
            let mut preview = orchestrator.instance(instance_id)?.clone();
            preview.update(patch.clone());
            preview
        };
        self.store.update_workty_instance(persisted.clone()).await?;

        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| Error::not_found("workflow", workflow_id))?;
        let events = orchestrator.update_instance(instance_id, patch)?;
        drop(workflows);
        self.process_events(events).await;
        Ok(json!({ "worktyInstance": persisted }))
    }

    pub async fn update_workty_instance_property(
        self: &Arc<Self>,
        workflow_id: Uuid,
        instance_id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| Error::not_found("workflow", workflow_id))?;
        let events = orchestrator.update_instance_property(instance_id, name, value)?;
        let snapshot = orchestrator.instance(instance_id)?.clone();
        drop(workflows);
        if !events.is_empty() {
            // identical name/value is a no-op: no store write, no broadcast
            self.store.update_workty_instance(snapshot.clone()).await?;
            self.process_events(events).await;
        }
        Ok(json!({ "worktyInstance": snapshot }))
    }

    pub async fn del_workty_instance(
        self: &Arc<Self>,
        workflow_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Value> {
        check_permission(&self.store, self.account_id, "workflows", "update").await?;
        if !self.workflows.lock().await.contains_key(&workflow_id) {
            return Err(Error::not_found("workflow", workflow_id));
        }
        self.store.del_workty_instance(instance_id).await?;
        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| Error::not_found("workflow", workflow_id))?;
        let events = orchestrator.del_instance(instance_id)?;
        drop(workflows);
        self.process_events(events).await;
        Ok(json!({ "worktyInstance": { "id": instance_id, "deleted": true } }))
    }

    /// Resume every workflow with a waiting instance, one at a time.
    ///
    /// Sequential on purpose: concurrent resumption would hammer the device
    /// pool with borrow attempts. Sweeps are mutually exclusive.
    pub async fn sweep(self: &Arc<Self>) {
        if self
            .sweep_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("resumption sweep already in flight, skipping");
            return;
        }

        let resumable: Vec<Uuid> = {
            let workflows = self.workflows.lock().await;
            workflows
                .values()
                .filter(|orchestrator| orchestrator.is_resumable())
                .map(|orchestrator| orchestrator.id())
                .collect()
        };
        debug!(count = resumable.len(), "workflow resumption sweep");
        for id in resumable {
            // a failed run pauses the workflow again; nothing to do here
            if let Err(err) = self.run(id).await {
                debug!(workflow_id = %id, error = %err, "resumption attempt failed");
            }
        }

        self.sweep_in_flight.store(false, Ordering::SeqCst);
    }

    /// Act on orchestrator events: broadcast changes, persist instance
    /// state, dispatch executions, release devices on completion.
    ///
    /// Boxed rather than an `async fn`: completing an instance feeds the
    /// next instance's events back through here, and the resulting future
    /// type must not contain itself.
    fn process_events<'a>(
        self: &'a Arc<Self>,
        events: Vec<WorkflowEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for event in events {
                match event {
                    WorkflowEvent::InstanceChanged(instance) => {
                        if let Err(err) = self.store.update_workty_instance(instance.clone()).await
                        {
                            warn!(instance_id = %instance.id, error = %err, "instance state persist failed");
                        }
                        self.room.push_ok(json!({ "worktyInstance": instance }));
                    }
                    WorkflowEvent::InstanceDeleted(instance) => {
                        self.room
                            .push_ok(json!({ "worktyInstanceDeleted": instance }));
                    }
                    WorkflowEvent::Execute(request) => {
                        let ctx = Arc::clone(self);
                        tokio::spawn(async move {
                            ctx.dispatch_execute(request).await;
                        });
                    }
                    WorkflowEvent::ExecutionFailed { instance_id, message } => {
                        warn!(%instance_id, %message, "execution failed, pausing workflow");
                        self.room.push(ChannelResponse::error(
                            None,
                            ErrorObject {
                                code: workty_protocol::error_codes::DEVICE_OFFLINE,
                                message,
                                link: None,
                                input: None,
                            },
                        ));
                    }
                    WorkflowEvent::Completed { workflow_id } => {
                        let device_id = {
                            let mut workflows = self.workflows.lock().await;
                            workflows
                                .get_mut(&workflow_id)
                                .and_then(|orchestrator| orchestrator.device_id.take())
                        };
                        if let Some(device_id) = device_id {
                            self.release_device(device_id).await;
                        }
                        info!(%workflow_id, "workflow completed");
                        self.room.push_ok(
                            json!({ "workflow": { "id": workflow_id, "workflowCompleted": true } }),
                        );
                    }
                }
            }
        })
    }

    /// Fetch the workty's code and run it on the workflow's borrowed
    /// device; route the outcome back into the orchestrator
    async fn dispatch_execute(self: &Arc<Self>, request: ExecutionRequest) {
        let device_id = {
            let workflows = self.workflows.lock().await;
            workflows
                .get(&request.workflow_id)
                .and_then(|orchestrator| orchestrator.device_id)
        };
        let Some(device_id) = device_id else {
            // paused or stopped between run() and dispatch; the generation
            // guard would discard the result anyway
            debug!(workflow_id = %request.workflow_id, "no device held, dropping execute request");
            return;
        };

        let outcome = match self.fetch_code(&request).await {
            Ok(payload) => match self.devices() {
                Ok(devices) => devices.execute_code(device_id, payload).await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(result) => {
                self.complete_execution(request, result).await;
            }
            Err(err) => {
                self.complete_execution(request.clone(), ExecutionResult::failure(err.to_string()))
                    .await;
            }
        }
    }

    async fn fetch_code(&self, request: &ExecutionRequest) -> Result<ExecutePayload> {
        let workty = self
            .store
            .get_workty_by_id(request.workty_id)
            .await?
            .ok_or_else(|| Error::not_found("workty", request.workty_id))?;
        let properties: Value = serde_json::to_value(&request.properties)
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(ExecutePayload {
            instance_id: request.instance_id,
            workflow_id: request.workflow_id,
            workty_id: request.workty_id,
            code: workty.code,
            properties,
        })
    }

    /// Feed an execution result back to the instance. Stale results (the
    /// workflow moved on via pause/stop) are recognized and discarded; a
    /// failure pauses the owning workflow so a broken device is not
    /// hammered with retries.
    async fn complete_execution(self: &Arc<Self>, request: ExecutionRequest, result: ExecutionResult) {
        let events = {
            let mut workflows = self.workflows.lock().await;
            match workflows.get_mut(&request.workflow_id) {
                Some(orchestrator) => {
                    orchestrator.complete_instance(request.instance_id, request.generation, result)
                }
                None => Vec::new(),
            }
        };

        let failed = events
            .iter()
            .any(|event| matches!(event, WorkflowEvent::ExecutionFailed { .. }));
        self.process_events(events).await;
        if failed {
            if let Err(err) = self.pause_internal(request.workflow_id).await {
                warn!(workflow_id = %request.workflow_id, error = %err, "pause after failure failed");
            }
        }
    }

    /// Pause without the permission pre-check; used on internal failure paths
    async fn pause_internal(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let mut workflows = self.workflows.lock().await;
        let orchestrator = workflows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("workflow", id))?;
        let device_id = orchestrator.device_id.take();
        let events = orchestrator.pause();
        drop(workflows);
        if let Some(device_id) = device_id {
            self.release_device(device_id).await;
        }
        self.process_events(events).await;
        Ok(())
    }

    async fn release_device(&self, device_id: Uuid) {
        match self.devices() {
            Ok(devices) => {
                if let Err(err) = devices.release(device_id).await {
                    warn!(%device_id, error = %err, "device release failed");
                }
            }
            Err(err) => warn!(%device_id, error = %err, "device pool unavailable for release"),
        }
    }

    /// Teardown on tenant destruction: every held device is released and
    /// every orchestrator dropped; dropping the room disconnects subscribers
    pub async fn destroy(&self) {
        let mut workflows = self.workflows.lock().await;
        let held: Vec<Uuid> = workflows
            .values_mut()
            .filter_map(|orchestrator| orchestrator.device_id.take())
            .collect();
        workflows.clear();
        drop(workflows);
        for device_id in held {
            self.release_device(device_id).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn held_device(&self, id: Uuid) -> Option<Uuid> {
        self.workflows
            .lock()
            .await
            .get(&id)
            .and_then(|orchestrator| orchestrator.device_id)
    }

    #[cfg(test)]
    pub(crate) async fn instance_states(
        &self,
        id: Uuid,
    ) -> Vec<crate::instance::InstanceState> {
        self.workflows
            .lock()
            .await
            .get(&id)
            .map(|o| o.instances().iter().map(|i| i.state).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::locator::AccountEvent;
    use crate::contexts::ContextRef;
    use crate::instance::InstanceState;
    use crate::model::{Account, DeviceState, Workty};
    use crate::store::MemoryStore;
    use crate::test_support::{test_account, test_device, StubConnector};
    use std::time::Duration;

    struct Fixture {
        locator: Arc<ContextLocator>,
        store: Arc<dyn Store>,
        account: Account,
    }

    impl Fixture {
        async fn new(connector: StubConnector) -> Self {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let account = store.add_account(test_account("admin")).await.unwrap();
            let locator = ContextLocator::new(
                Arc::clone(&store),
                Arc::new(connector),
                Duration::from_millis(200),
            );
            locator
                .upsert_root_context(AccountEvent::Added(account.clone()))
                .await
                .unwrap();
            Self {
                locator,
                store,
                account,
            }
        }

        fn workflows(&self) -> Arc<WorkflowsContext> {
            self.locator
                .get(self.account.id, ContextName::Workflows)
                .and_then(ContextRef::into_workflows)
                .unwrap()
        }

        async fn seed_workty(&self, language_type: &str) -> Workty {
            seed_workty(&self.store, self.account.id, language_type).await
        }

        /// New workflow with `steps` instances of the given workty
        async fn seed_workflow(&self, workty: &Workty, steps: usize) -> Uuid {
            let ctx = self.workflows();
            let added = ctx.add(json!({ "name": "pipeline" })).await.unwrap();
            let workflow_id: Uuid =
                serde_json::from_value(added["workflow"]["id"].clone()).unwrap();
            for n in 0..steps {
                ctx.add_workty_instance(
                    workflow_id,
                    json!({ "workty_id": workty.id, "name": format!("step-{n}") }),
                )
                .await
                .unwrap();
            }
            workflow_id
        }
    }

    async fn seed_workty(store: &Arc<dyn Store>, account_id: Uuid, language_type: &str) -> Workty {
        store
            .add_workty(Workty {
                id: Uuid::new_v4(),
                account_id,
                name: "counter".into(),
                description: String::new(),
                category: "default".into(),
                language_type: language_type.into(),
                code: "module.exports = 42;".into(),
                properties: vec![],
                price: 0,
                created: chrono::Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn wait_for_states(
        ctx: &Arc<WorkflowsContext>,
        id: Uuid,
        expected: &[InstanceState],
    ) {
        for _ in 0..200 {
            if ctx.instance_states(id).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "instances never reached {expected:?}, got {:?}",
            ctx.instance_states(id).await
        );
    }

    #[tokio::test]
    async fn run_executes_all_instances_and_releases_device() {
        let fixture = Fixture::new(StubConnector::healthy()).await;
        let device = fixture.store.add_device(test_device()).await.unwrap();
        let workty = fixture.seed_workty("default").await;
        let ctx = fixture.workflows();
        let id = fixture.seed_workflow(&workty, 2).await;

        ctx.run(id).await.unwrap();
        wait_for_states(&ctx, id, &[InstanceState::Completed, InstanceState::Completed]).await;

        // register completion broadcasts releasing the device
        for _ in 0..200 {
            if ctx.held_device(id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.held_device(id).await.is_none());
        assert_eq!(
            fixture
                .store
                .get_device_by_id(device.id)
                .await
                .unwrap()
                .unwrap()
                .state,
            DeviceState::Waiting
        );
    }

    #[tokio::test]
    async fn borrow_failure_pauses_until_sweep_finds_a_device() {
        let fixture = Fixture::new(StubConnector::healthy()).await;
        let workty = fixture.seed_workty("default").await;
        let ctx = fixture.workflows();
        let id = fixture.seed_workflow(&workty, 1).await;

        // empty pool: run degrades to waiting
        let err = ctx.run(id).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable));
        wait_for_states(&ctx, id, &[InstanceState::Waiting]).await;

        fixture.store.add_device(test_device()).await.unwrap();
        ctx.sweep().await;
        wait_for_states(&ctx, id, &[InstanceState::Completed]).await;
    }

    #[tokio::test]
    async fn execution_failure_pauses_workflow_and_frees_device() {
        let fixture = Fixture::new(StubConnector::failing_execute("socket reset")).await;
        fixture.store.add_device(test_device()).await.unwrap();
        let workty = fixture.seed_workty("default").await;
        let ctx = fixture.workflows();
        let id = fixture.seed_workflow(&workty, 1).await;
        let mut room = ctx.room().subscribe();

        ctx.run(id).await.unwrap();
        wait_for_states(&ctx, id, &[InstanceState::Waiting]).await;
        assert!(ctx.held_device(id).await.is_none());

        // an error envelope went out to subscribers
        let mut saw_error = false;
        while let Ok(response) = room.try_recv() {
            if response.err.is_some() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn stop_discards_late_completion() {
        let fixture = Fixture::new(StubConnector::hanging_execute()).await;
        fixture.store.add_device(test_device()).await.unwrap();
        let workty = fixture.seed_workty("default").await;
        let ctx = fixture.workflows();
        let id = fixture.seed_workflow(&workty, 1).await;

        ctx.run(id).await.unwrap();
        ctx.stop(id).await.unwrap();
        assert_eq!(ctx.instance_states(id).await, vec![InstanceState::Initial]);

        // the hung execution times out after the fixture's 200ms; its stale
        // failure must not disturb the stopped workflow
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ctx.instance_states(id).await, vec![InstanceState::Initial]);
        assert!(ctx.held_device(id).await.is_none());
    }

    #[tokio::test]
    async fn instance_rejects_unknown_language_type() {
        let fixture = Fixture::new(StubConnector::healthy()).await;
        let workty = fixture.seed_workty("cobol").await;
        let ctx = fixture.workflows();
        let added = ctx.add(json!({ "name": "pipeline" })).await.unwrap();
        let workflow_id: Uuid =
            serde_json::from_value(added["workflow"]["id"].clone()).unwrap();

        let err = ctx
            .add_workty_instance(workflow_id, json!({ "workty_id": workty.id }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadDigest { .. }));
    }

    #[tokio::test]
    async fn identical_property_value_is_a_silent_no_op() {
        let fixture = Fixture::new(StubConnector::healthy()).await;
        let mut workty = fixture.seed_workty("default").await;
        workty.properties = vec![crate::model::Property {
            name: "input".into(),
            value: json!("a"),
        }];
        fixture.store.update_workty(workty.clone()).await.unwrap();
        let ctx = fixture.workflows();
        let id = fixture.seed_workflow(&workty, 1).await;
        let instance_id: Uuid = {
            let snapshot = ctx.get_by_id(id).await.unwrap();
            serde_json::from_value(snapshot["workflow"]["instances"][0]["id"].clone()).unwrap()
        };
        let mut room = ctx.room().subscribe();

        ctx.update_workty_instance_property(id, instance_id, "input", json!("a"))
            .await
            .unwrap();
        assert!(room.try_recv().is_err());

        ctx.update_workty_instance_property(id, instance_id, "input", json!("b"))
            .await
            .unwrap();
        assert!(room.try_recv().is_ok());
    }

    #[tokio::test]
    async fn persisted_waiting_workflow_resumes_after_restart() {
        // everything lives only in the store, as after a process restart
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let account = store.add_account(test_account("admin")).await.unwrap();
        store.add_device(test_device()).await.unwrap();
        let workty = seed_workty(&store, account.id, "default").await;
        let record = store
            .add_workflow(WorkflowRecord {
                id: Uuid::new_v4(),
                account_id: account.id,
                name: "leftover".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        let mut instance = WorktyInstance::new(record.id, workty.id, "step-0", vec![]);
        instance.load_state(InstanceState::Waiting);
        store.add_workty_instance(instance).await.unwrap();

        let locator = ContextLocator::new(
            Arc::clone(&store),
            Arc::new(StubConnector::healthy()),
            Duration::from_millis(200),
        );
        locator
            .upsert_root_context(AccountEvent::Added(account.clone()))
            .await
            .unwrap();
        let ctx = locator
            .get(account.id, ContextName::Workflows)
            .and_then(ContextRef::into_workflows)
            .unwrap();

        // registration hydrated the mirror; the sweep picks the workflow up
        ctx.sweep().await;
        wait_for_states(&ctx, record.id, &[InstanceState::Completed]).await;
    }

    #[tokio::test]
    async fn worker_reported_error_pauses_workflow() {
        let connector = StubConnector::healthy();
        connector
            .push_result(ExecutionResult::failure("division by zero"))
            .await;
        let fixture = Fixture::new(connector).await;
        let device = fixture.store.add_device(test_device()).await.unwrap();
        let workty = fixture.seed_workty("default").await;
        let ctx = fixture.workflows();
        let id = fixture.seed_workflow(&workty, 1).await;
        let mut room = ctx.room().subscribe();

        ctx.run(id).await.unwrap();
        wait_for_states(&ctx, id, &[InstanceState::Waiting]).await;
        assert!(ctx.held_device(id).await.is_none());

        // the transport was fine: the device is released, not disconnected
        assert_eq!(
            fixture
                .store
                .get_device_by_id(device.id)
                .await
                .unwrap()
                .unwrap()
                .state,
            DeviceState::Waiting
        );
        let mut saw_error = false;
        while let Ok(response) = room.try_recv() {
            if response.err.is_some() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn unknown_workflow_rejects_instance_without_store_write() {
        let fixture = Fixture::new(StubConnector::healthy()).await;
        let workty = fixture.seed_workty("default").await;
        let ctx = fixture.workflows();
        let ghost = Uuid::new_v4();

        let err = ctx
            .add_workty_instance(ghost, json!({ "workty_id": workty.id }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
        assert!(fixture
            .store
            .get_workty_instances(ghost)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_of_unmirrored_workflow_leaves_store_untouched() {
        let fixture = Fixture::new(StubConnector::healthy()).await;
        let ctx = fixture.workflows();
        // lands in the store after hydration, so the mirror has never seen it
        let record = fixture
            .store
            .add_workflow(WorkflowRecord {
                id: Uuid::new_v4(),
                account_id: fixture.account.id,
                name: "original".into(),
                description: String::new(),
            })
            .await
            .unwrap();

        let err = ctx
            .update(record.id, json!({ "name": "renamed" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
        let stored = fixture
            .store
            .get_workflow_by_id(record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "original");
    }
}
