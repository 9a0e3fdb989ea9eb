//! Shared stubs for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;
use workty_protocol::Platform;

use crate::error::{Error, Result};
use crate::instance::ExecutionResult;
use crate::link::{DeviceConnector, DeviceHandle, ExecutePayload};
use crate::model::{Account, Device, DeviceState};

pub(crate) fn test_device() -> Device {
    Device {
        id: Uuid::new_v4(),
        name: "worker-1".into(),
        address: "127.0.0.1".into(),
        port: 3131,
        protocol: "ws".into(),
        state: DeviceState::Waiting,
        platform: None,
    }
}

pub(crate) fn test_account(role: &str) -> Account {
    Account {
        id: Uuid::new_v4(),
        name: "tester".into(),
        email: "tester@example.com".into(),
        role: role.into(),
        balance: 100,
        created: chrono::Utc::now(),
    }
}

enum Mode {
    /// Connects and executes successfully (scripted results, default echo)
    Healthy,
    /// Connects, then every execute fails with the given transport error
    FailingExecute(String),
    /// Connects, then execute never returns
    HangingExecute,
    /// Connects and executes fine, but never answers a ping
    FailingPing,
    /// Connection attempts count, sleep, and fail
    SlowConnect(Duration),
}

pub(crate) struct StubConnector {
    mode: Mode,
    pub(crate) connect_attempts: Arc<AtomicUsize>,
    results: Arc<Mutex<VecDeque<ExecutionResult>>>,
}

impl StubConnector {
    pub(crate) fn healthy() -> Self {
        Self::with_mode(Mode::Healthy)
    }

    pub(crate) fn failing_execute(message: &str) -> Self {
        Self::with_mode(Mode::FailingExecute(message.to_string()))
    }

    pub(crate) fn hanging_execute() -> Self {
        Self::with_mode(Mode::HangingExecute)
    }

    pub(crate) fn failing_ping() -> Self {
        Self::with_mode(Mode::FailingPing)
    }

    pub(crate) fn slow_connect(delay: Duration, attempts: Arc<AtomicUsize>) -> Self {
        let mut connector = Self::with_mode(Mode::SlowConnect(delay));
        connector.connect_attempts = attempts;
        connector
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            connect_attempts: Arc::new(AtomicUsize::new(0)),
            results: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue an execution result; once drained, executes echo their payload
    pub(crate) async fn push_result(&self, result: ExecutionResult) {
        self.results.lock().await.push_back(result);
    }
}

#[async_trait]
impl DeviceConnector for StubConnector {
    async fn connect(&self, _device: &Device) -> Result<Arc<dyn DeviceHandle>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            Mode::SlowConnect(delay) => {
                tokio::time::sleep(*delay).await;
                Err(Error::DeviceOffline("connection refused".into()))
            }
            Mode::FailingExecute(message) => Ok(Arc::new(StubHandle {
                execute_error: Some(message.clone()),
                hang: false,
                drop_pings: false,
                results: Arc::clone(&self.results),
            })),
            Mode::HangingExecute => Ok(Arc::new(StubHandle {
                execute_error: None,
                hang: true,
                drop_pings: false,
                results: Arc::clone(&self.results),
            })),
            Mode::FailingPing => Ok(Arc::new(StubHandle {
                execute_error: None,
                hang: false,
                drop_pings: true,
                results: Arc::clone(&self.results),
            })),
            Mode::Healthy => Ok(Arc::new(StubHandle {
                execute_error: None,
                hang: false,
                drop_pings: false,
                results: Arc::clone(&self.results),
            })),
        }
    }
}

struct StubHandle {
    execute_error: Option<String>,
    hang: bool,
    drop_pings: bool,
    results: Arc<Mutex<VecDeque<ExecutionResult>>>,
}

#[async_trait]
impl DeviceHandle for StubHandle {
    async fn configuration(&self) -> Result<Platform> {
        Ok(Platform {
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "stub".into(),
        })
    }

    async fn execute(&self, payload: ExecutePayload) -> Result<ExecutionResult> {
        if let Some(message) = &self.execute_error {
            return Err(Error::DeviceOffline(message.clone()));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(result) = self.results.lock().await.pop_front() {
            return Ok(result);
        }
        Ok(ExecutionResult::success(json!({
            "instance_id": payload.instance_id,
            "echo": payload.properties,
        })))
    }

    async fn ping(&self) -> Result<()> {
        if self.drop_pings {
            return Err(Error::DeviceOffline("pong timed out".into()));
        }
        Ok(())
    }

    async fn close(&self) {}
}
