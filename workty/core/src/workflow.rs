//! Workflow orchestrator
//!
//! Owns the ordered sequence of workty instances and the position cursor,
//! advances instances sequentially and aggregates completion. The
//! orchestrator never talks to the device pool itself; it reports what has
//! to happen through [`WorkflowEvent`] values and the owning workflows
//! context couples those to device borrow/release and execution dispatch.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::instance::{
    CompletionOutcome, ExecutionRequest, ExecutionResult, InstanceEffect, InstancePatch,
    InstanceState, WorktyInstance,
};
use crate::model::WorkflowRecord;

/// Side effect produced by an orchestrator operation
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// An instance changed; carries the full snapshot for broadcasting
    InstanceChanged(WorktyInstance),
    /// An instance was removed
    InstanceDeleted(WorktyInstance),
    /// An instance entered `running` and requests execution on the
    /// workflow's borrowed device
    Execute(ExecutionRequest),
    /// The device reported an execution error; the owning context must
    /// pause the workflow and surface the error
    ExecutionFailed { instance_id: Uuid, message: String },
    /// The last instance completed
    Completed { workflow_id: Uuid },
}

/// Serialized shape broadcast for workflow-level changes
#[derive(Debug, Serialize)]
pub struct WorkflowSnapshot<'a> {
    #[serde(flatten)]
    pub record: &'a WorkflowRecord,
    pub instances: &'a [WorktyInstance],
    pub cursor: usize,
    pub stopped: bool,
    pub completed: bool,
}

pub struct WorkflowOrchestrator {
    record: WorkflowRecord,
    instances: Vec<WorktyInstance>,
    /// Always within `[0, instances.len()]`
    cursor: usize,
    stopped: bool,
    completed: bool,
    /// Device currently borrowed for this workflow, managed by the owning
    /// workflows context. At most one at a time.
    pub device_id: Option<Uuid>,
}

impl WorkflowOrchestrator {
    pub fn new(record: WorkflowRecord) -> Self {
        Self {
            record,
            instances: Vec::new(),
            cursor: 0,
            stopped: false,
            completed: false,
            device_id: None,
        }
    }

    /// Mirror a persisted workflow: instances keep their stored state
    /// without replaying entry side effects
    pub fn load(record: WorkflowRecord, instances: Vec<WorktyInstance>) -> Self {
        let mut orchestrator = Self::new(record);
        orchestrator.instances = instances;
        orchestrator
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn record(&self) -> &WorkflowRecord {
        &self.record
    }

    pub fn update_record(&mut self, name: Option<String>, description: Option<String>) {
        if let Some(name) = name {
            self.record.name = name;
        }
        if let Some(description) = description {
            self.record.description = description;
        }
    }

    pub fn instances(&self) -> &[WorktyInstance] {
        &self.instances
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// A workflow with a waiting instance and no borrowed device is eligible
    /// for the resumption sweep
    pub fn is_resumable(&self) -> bool {
        self.device_id.is_none()
            && self
                .instances
                .iter()
                .any(|i| i.state == InstanceState::Waiting)
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(WorkflowSnapshot {
            record: &self.record,
            instances: &self.instances,
            cursor: self.cursor,
            stopped: self.stopped,
            completed: self.completed,
        })
        .unwrap_or(Value::Null)
    }

    fn map_effects(&self, effects: Vec<InstanceEffect>) -> Vec<WorkflowEvent> {
        effects
            .into_iter()
            .map(|effect| match effect {
                InstanceEffect::Changed(snapshot) => WorkflowEvent::InstanceChanged(snapshot),
                InstanceEffect::Deleted(snapshot) => WorkflowEvent::InstanceDeleted(snapshot),
                InstanceEffect::Execute(request) => WorkflowEvent::Execute(request),
            })
            .collect()
    }

    /// Start or resume the workflow.
    ///
    /// Resumes at the first instance in `waiting`; with none waiting this is
    /// a fresh run from position 0. An empty workflow completes immediately.
    pub fn run(&mut self) -> Vec<WorkflowEvent> {
        self.stopped = false;
        self.completed = false;

        if self.instances.is_empty() {
            self.completed = true;
            return vec![WorkflowEvent::Completed {
                workflow_id: self.record.id,
            }];
        }

        let resume_at = self
            .instances
            .iter()
            .position(|i| i.state == InstanceState::Waiting)
            .unwrap_or(0);
        self.cursor = resume_at;

        let effects = self.instances[self.cursor].run();
        self.map_effects(effects)
    }

    /// Transition the cursor instance to `waiting`; the stopped flag is left
    /// untouched
    pub fn pause(&mut self) -> Vec<WorkflowEvent> {
        match self.instances.get_mut(self.cursor) {
            Some(instance) => {
                let effects = instance.wait();
                self.map_effects(effects)
            }
            None => Vec::new(),
        }
    }

    /// Cancel the workflow: every instance returns to `initial`, the cursor
    /// resets, and any in-flight completion becomes stale
    pub fn stop(&mut self) -> Vec<WorkflowEvent> {
        self.stopped = true;
        self.completed = false;
        self.cursor = 0;
        let mut events = Vec::new();
        for instance in &mut self.instances {
            let effects = instance.init();
            events.extend(effects.into_iter().map(InstanceEffect::into));
        }
        events
    }

    /// Route an execution result to its instance; on success the cursor
    /// advances and the next instance starts, or the workflow completes
    pub fn complete_instance(
        &mut self,
        instance_id: Uuid,
        generation: u64,
        result: ExecutionResult,
    ) -> Vec<WorkflowEvent> {
        let Some(index) = self.instances.iter().position(|i| i.id == instance_id) else {
            debug!(%instance_id, "completion for unknown instance discarded");
            return Vec::new();
        };

        match self.instances[index].complete(generation, result) {
            CompletionOutcome::Stale => {
                debug!(%instance_id, generation, "stale completion discarded");
                Vec::new()
            }
            CompletionOutcome::Failed(message) => {
                vec![WorkflowEvent::ExecutionFailed {
                    instance_id,
                    message,
                }]
            }
            CompletionOutcome::Completed(effects) => {
                let mut events = self.map_effects(effects);
                if index == self.cursor {
                    self.cursor += 1;
                    if self.cursor < self.instances.len() {
                        let next = self.instances[self.cursor].run();
                        events.extend(self.map_effects(next));
                    } else {
                        self.completed = true;
                        events.push(WorkflowEvent::Completed {
                            workflow_id: self.record.id,
                        });
                    }
                }
                events
            }
        }
    }

    /// Append an instance; newly added instances are initialized immediately
    pub fn add_instance(&mut self, mut instance: WorktyInstance) -> Vec<WorkflowEvent> {
        instance.workflow_id = self.record.id;
        let effects = instance.init();
        let events = self.map_effects(effects);
        self.instances.push(instance);
        events
    }

    pub fn instance(&self, instance_id: Uuid) -> Result<&WorktyInstance> {
        self.instances
            .iter()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| Error::not_found("workty instance", instance_id))
    }

    fn instance_mut(&mut self, instance_id: Uuid) -> Result<&mut WorktyInstance> {
        self.instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| Error::not_found("workty instance", instance_id))
    }

    pub fn update_instance(
        &mut self,
        instance_id: Uuid,
        patch: InstancePatch,
    ) -> Result<Vec<WorkflowEvent>> {
        let effects = self.instance_mut(instance_id)?.update(patch);
        Ok(self.map_effects(effects))
    }

    pub fn update_instance_property(
        &mut self,
        instance_id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<Vec<WorkflowEvent>> {
        let effects = self.instance_mut(instance_id)?.update_property(name, value);
        Ok(self.map_effects(effects))
    }

    pub fn del_instance(&mut self, instance_id: Uuid) -> Result<Vec<WorkflowEvent>> {
        let index = self
            .instances
            .iter()
            .position(|i| i.id == instance_id)
            .ok_or_else(|| Error::not_found("workty instance", instance_id))?;
        let removed = self.instances.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor > self.instances.len() {
            self.cursor = self.instances.len();
        }
        Ok(vec![WorkflowEvent::InstanceDeleted(removed)])
    }
}

impl From<InstanceEffect> for WorkflowEvent {
    fn from(effect: InstanceEffect) -> Self {
        match effect {
            InstanceEffect::Changed(snapshot) => WorkflowEvent::InstanceChanged(snapshot),
            InstanceEffect::Deleted(snapshot) => WorkflowEvent::InstanceDeleted(snapshot),
            InstanceEffect::Execute(request) => WorkflowEvent::Execute(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow_with(steps: usize) -> WorkflowOrchestrator {
        let record = WorkflowRecord {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            name: "pipeline".into(),
            description: String::new(),
        };
        let mut orchestrator = WorkflowOrchestrator::new(record);
        for n in 0..steps {
            let instance = WorktyInstance::new(
                orchestrator.id(),
                Uuid::new_v4(),
                format!("step-{n}"),
                Vec::new(),
            );
            orchestrator.add_instance(instance);
        }
        orchestrator
    }

    fn execute_request(events: &[WorkflowEvent]) -> ExecutionRequest {
        events
            .iter()
            .find_map(|e| match e {
                WorkflowEvent::Execute(req) => Some(req.clone()),
                _ => None,
            })
            .expect("expected an execute event")
    }

    #[test]
    fn two_instances_run_to_completion() {
        let mut wf = workflow_with(2);
        let events = wf.run();
        let first = execute_request(&events);

        let events = wf.complete_instance(
            first.instance_id,
            first.generation,
            ExecutionResult::success(json!(1)),
        );
        // second instance auto-starts
        let second = execute_request(&events);
        assert_ne!(second.instance_id, first.instance_id);
        assert_eq!(wf.cursor(), 1);

        let events = wf.complete_instance(
            second.instance_id,
            second.generation,
            ExecutionResult::success(json!(2)),
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::Completed { .. })));
        assert!(wf.is_completed());
        assert_eq!(wf.cursor(), 2);
    }

    #[test]
    fn pause_leaves_cursor_instance_waiting() {
        let mut wf = workflow_with(2);
        let events = wf.run();
        let req = execute_request(&events);
        wf.pause();
        assert_eq!(wf.instances()[0].state, InstanceState::Waiting);

        // the in-flight completion is now stale
        let events =
            wf.complete_instance(req.instance_id, req.generation, ExecutionResult::success(json!(0)));
        assert!(events.is_empty());
        assert_eq!(wf.instances()[0].state, InstanceState::Waiting);
    }

    #[test]
    fn run_resumes_at_first_waiting_instance() {
        let mut wf = workflow_with(3);
        let events = wf.run();
        let req = execute_request(&events);
        wf.complete_instance(req.instance_id, req.generation, ExecutionResult::success(json!(0)));
        wf.pause();
        assert_eq!(wf.instances()[1].state, InstanceState::Waiting);

        let events = wf.run();
        let resumed = execute_request(&events);
        assert_eq!(resumed.instance_id, wf.instances()[1].id);
        assert_eq!(wf.cursor(), 1);
    }

    #[test]
    fn stop_resets_cursor_and_reinitializes() {
        let mut wf = workflow_with(2);
        wf.run();
        wf.stop();
        assert!(wf.is_stopped());
        assert_eq!(wf.cursor(), 0);
        assert!(wf
            .instances()
            .iter()
            .all(|i| i.state == InstanceState::Initial));

        // run after stop restarts at position 0
        let events = wf.run();
        let req = execute_request(&events);
        assert_eq!(req.instance_id, wf.instances()[0].id);
        assert!(!wf.is_stopped());
    }

    #[test]
    fn failed_execution_reports_and_stays_running() {
        let mut wf = workflow_with(1);
        let events = wf.run();
        let req = execute_request(&events);
        let events = wf.complete_instance(
            req.instance_id,
            req.generation,
            ExecutionResult::failure("segfault"),
        );
        assert!(matches!(
            events.as_slice(),
            [WorkflowEvent::ExecutionFailed { .. }]
        ));
        assert_eq!(wf.instances()[0].state, InstanceState::Running);
        assert!(!wf.is_completed());
    }

    #[test]
    fn empty_workflow_completes_immediately() {
        let mut wf = workflow_with(0);
        let events = wf.run();
        assert!(matches!(
            events.as_slice(),
            [WorkflowEvent::Completed { .. }]
        ));
    }

    #[test]
    fn cursor_stays_in_bounds_after_deletes() {
        let mut wf = workflow_with(3);
        let events = wf.run();
        let req = execute_request(&events);
        wf.complete_instance(req.instance_id, req.generation, ExecutionResult::success(json!(0)));
        assert_eq!(wf.cursor(), 1);

        let first = wf.instances()[0].id;
        wf.del_instance(first).unwrap();
        assert_eq!(wf.cursor(), 0);

        let remaining: Vec<Uuid> = wf.instances().iter().map(|i| i.id).collect();
        for id in remaining {
            wf.del_instance(id).unwrap();
        }
        assert!(wf.cursor() <= wf.instances().len());
    }

    #[test]
    fn resumable_requires_waiting_instance_and_no_device() {
        let mut wf = workflow_with(1);
        assert!(!wf.is_resumable());
        wf.run();
        wf.pause();
        assert!(wf.is_resumable());
        wf.device_id = Some(Uuid::new_v4());
        assert!(!wf.is_resumable());
    }
}
