//! Workty-instance state machine
//!
//! One instance is a single step of a workflow. The machine is deliberately
//! pure: every operation mutates the instance synchronously and returns the
//! side effects ([`InstanceEffect`]) for the owner to act on, instead of
//! firing listeners. Completion is guarded by a per-run generation counter so
//! results of a run that was cancelled in the meantime are recognized as
//! stale and discarded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::Property;

/// States of the workty-instance machine.
///
/// `Initializing` exists only between construction and the first `init()`;
/// "deleted" is signaled through [`InstanceEffect::Deleted`] rather than a
/// state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Initializing,
    Initial,
    Waiting,
    Running,
    Completed,
}

/// Result of a device execution, success payload or error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ExecutionResult {
    pub fn success(data: Value) -> Self {
        Self {
            err: None,
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            err: Some(message.into()),
            data: None,
        }
    }
}

/// Execution handoff payload emitted when an instance enters `running`
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub instance_id: Uuid,
    pub workflow_id: Uuid,
    pub workty_id: Uuid,
    pub properties: Vec<Property>,
    /// Run generation; completions carrying an older generation are stale
    pub generation: u64,
}

/// Side effect produced by an instance transition
#[derive(Debug, Clone)]
pub enum InstanceEffect {
    /// State or content changed; carries a full snapshot for broadcasting
    Changed(WorktyInstance),
    /// Control handoff to the device pool via the owning workflow
    Execute(ExecutionRequest),
    /// Instance was removed from its workflow
    Deleted(WorktyInstance),
}

/// Outcome of feeding an execution result back into the machine
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Generation or state mismatch; the result belongs to a cancelled run
    Stale,
    /// The device reported an error; instance stays in `running` and the
    /// owning workflow is expected to pause
    Failed(String),
    /// Instance reached `completed`
    Completed(Vec<InstanceEffect>),
}

/// Partial update applied by `update`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub desc: Option<String>,
    pub properties: Option<Vec<Property>>,
}

/// A single configured step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktyInstance {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workty_id: Uuid,
    pub name: String,
    pub desc: String,
    pub state: InstanceState,
    pub properties: Vec<Property>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default)]
    pub generation: u64,
}

impl WorktyInstance {
    pub fn new(
        workflow_id: Uuid,
        workty_id: Uuid,
        name: impl Into<String>,
        properties: Vec<Property>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            workty_id,
            name: name.into(),
            desc: String::new(),
            state: InstanceState::Initializing,
            properties,
            result: None,
            generation: 0,
        }
    }

    /// Direct transition to a stored state, bypassing entry side effects.
    /// Used when mirroring persisted records into memory.
    pub fn load_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    /// Transition to `initial`. No-op (and no effect) if already there.
    /// Any in-flight run is invalidated by bumping the generation.
    pub fn init(&mut self) -> Vec<InstanceEffect> {
        if self.state == InstanceState::Initial {
            return Vec::new();
        }
        if self.state == InstanceState::Running {
            self.generation += 1;
        }
        self.state = InstanceState::Initial;
        self.result = None;
        vec![InstanceEffect::Changed(self.clone())]
    }

    /// Transition to `waiting`
    pub fn wait(&mut self) -> Vec<InstanceEffect> {
        if self.state == InstanceState::Waiting {
            return Vec::new();
        }
        if self.state == InstanceState::Running {
            self.generation += 1;
        }
        self.state = InstanceState::Waiting;
        vec![InstanceEffect::Changed(self.clone())]
    }

    /// Transition to `running` and emit the execution handoff.
    ///
    /// A second `run()` while already running is ignored; the cursor advance
    /// in the orchestrator is the only legitimate trigger for the next run.
    pub fn run(&mut self) -> Vec<InstanceEffect> {
        if self.state == InstanceState::Running {
            return Vec::new();
        }
        self.state = InstanceState::Running;
        self.generation += 1;
        vec![
            InstanceEffect::Changed(self.clone()),
            InstanceEffect::Execute(ExecutionRequest {
                instance_id: self.id,
                workflow_id: self.workflow_id,
                workty_id: self.workty_id,
                properties: self.properties.clone(),
                generation: self.generation,
            }),
        ]
    }

    /// Feed an execution result back into the machine.
    ///
    /// On error the result is stored but the state does not advance; the
    /// owning workflow reacts by pausing.
    pub fn complete(&mut self, generation: u64, result: ExecutionResult) -> CompletionOutcome {
        if self.state != InstanceState::Running || generation != self.generation {
            return CompletionOutcome::Stale;
        }
        let failed = result.err.clone();
        self.result = Some(result);
        match failed {
            Some(message) => CompletionOutcome::Failed(message),
            None => {
                self.state = InstanceState::Completed;
                CompletionOutcome::Completed(vec![InstanceEffect::Changed(self.clone())])
            }
        }
    }

    /// Set a single named property; identical name/value is suppressed
    pub fn update_property(&mut self, name: &str, value: Value) -> Vec<InstanceEffect> {
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(existing) if existing.value == value => Vec::new(),
            Some(existing) => {
                existing.value = value;
                vec![InstanceEffect::Changed(self.clone())]
            }
            None => {
                self.properties.push(Property {
                    name: name.to_string(),
                    value,
                });
                vec![InstanceEffect::Changed(self.clone())]
            }
        }
    }

    /// Apply a partial update. Unlike `update_property` this always
    /// re-normalizes and emits, even when nothing differs.
    pub fn update(&mut self, patch: InstancePatch) -> Vec<InstanceEffect> {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(desc) = patch.desc {
            self.desc = desc;
        }
        if let Some(properties) = patch.properties {
            self.properties = properties;
        }
        vec![InstanceEffect::Changed(self.clone())]
    }

    /// Deletion marker; there is no persisted "deleted" state
    pub fn deleted(&self) -> InstanceEffect {
        InstanceEffect::Deleted(self.clone())
    }
}
