//! Core orchestration engine of the workty supervisor
//!
//! A *workty* is a reusable unit of work whose code runs on a borrowed
//! remote device; workflows chain workty instances and run them one at a
//! time. This crate holds the domain model, the pure workflow/instance
//! state machines, the [`store::Store`] persistence trait, and the
//! per-tenant contexts that mirror the store and broadcast live changes.
//! Transport (websockets, HTTP) lives in the supervisor binary; device
//! sockets hide behind [`link::DeviceConnector`].

pub mod contexts;
pub mod error;
pub mod instance;
pub mod link;
pub mod model;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod test_support;

/// Prelude to import all relevant models and functions
pub mod prelude {
    pub use super::contexts::{
        AccountEvent, ContextLocator, ContextName, ContextRef, Room,
    };
    pub use super::error::{Error, Result};
    pub use super::instance::{ExecutionResult, InstanceState, WorktyInstance};
    pub use super::link::{DeviceConnector, DeviceHandle, ExecutePayload};
    pub use super::model::*;
    pub use super::store::{DeviceCriteria, Store};
    pub use super::workflow::{WorkflowEvent, WorkflowOrchestrator};
}
