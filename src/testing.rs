//! In-memory doubles for the runtime gateway and the audit sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bans::BanList;
use crate::notify::{AuditEvent, AuditSink};
use crate::runtime::{CreateSpec, InstanceSummary, RuntimeError, RuntimeGateway, RuntimeStatus};
use crate::state::{AppState, LabConfig};

#[derive(Debug, Clone)]
struct FakeInstance {
    owner: String,
    host_port: u16,
    status: RuntimeStatus,
    history: String,
}

/// Pause/resume hook for one `create` call, used to interleave other
/// operations mid-provisioning.
pub struct CreateGate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct FakeRuntime {
    instances: Mutex<HashMap<String, FakeInstance>>,
    counter: AtomicUsize,
    fail_next_create: AtomicBool,
    fail_exec: AtomicBool,
    fail_status: AtomicBool,
    gate: Mutex<Option<Arc<CreateGate>>>,
}

impl FakeRuntime {
    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Register a container the server never created, occupying `port`.
    pub fn add_orphan(&self, port: u16) {
        let handle = format!("orphan-{}", port);
        self.instances.lock().unwrap().insert(
            handle,
            FakeInstance {
                owner: String::new(),
                host_port: port,
                status: RuntimeStatus::Running,
                history: String::new(),
            },
        );
    }

    pub fn set_history(&self, owner: &str, history: &str) {
        let mut instances = self.instances.lock().unwrap();
        for instance in instances.values_mut() {
            if instance.owner == owner {
                instance.history = history.to_string();
            }
        }
    }

    /// Simulate an out-of-band `docker rm` of the owner's container.
    pub fn vanish(&self, owner: &str) {
        self.instances
            .lock()
            .unwrap()
            .retain(|_, i| i.owner != owner);
    }

    /// Simulate a crash: the container stays listed but is no longer running.
    pub fn crash(&self, owner: &str) {
        let mut instances = self.instances.lock().unwrap();
        for instance in instances.values_mut() {
            if instance.owner == owner {
                instance.status = RuntimeStatus::Exited;
            }
        }
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Make the next `create` call block until released.
    pub fn gate_next_create(&self) -> Arc<CreateGate> {
        let gate = Arc::new(CreateGate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl RuntimeGateway for FakeRuntime {
    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::Api("create refused".to_string()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = format!("container-{}", n);
        self.instances.lock().unwrap().insert(
            handle.clone(),
            FakeInstance {
                owner: spec.owner.clone(),
                host_port: spec.host_port,
                status: RuntimeStatus::Running,
                history: String::new(),
            },
        );
        Ok(handle)
    }

    async fn status(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("inspect failed".to_string()));
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(handle)
            .map(|i| i.status)
            .unwrap_or(RuntimeStatus::Missing))
    }

    async fn exec_capture(&self, handle: &str, _cmd: &[&str]) -> Result<String, RuntimeError> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("exec failed".to_string()));
        }
        self.instances
            .lock()
            .unwrap()
            .get(handle)
            .map(|i| i.history.clone())
            .ok_or_else(|| RuntimeError::Api("no such instance".to_string()))
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(handle) {
            instance.status = RuntimeStatus::Exited;
        }
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        self.instances.lock().unwrap().remove(handle);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceSummary>, RuntimeError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(handle, i)| InstanceSummary {
                handle: handle.clone(),
                host_port: Some(i.host_port),
            })
            .collect())
    }
}

/// Records every audit event for later assertions.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CaptureSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for CaptureSink {
    async fn send(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct TestHarness {
    pub state: AppState,
    pub runtime: Arc<FakeRuntime>,
    pub audit: Arc<CaptureSink>,
    // Keeps the ban-file directory alive for the test's duration.
    #[allow(dead_code)]
    pub ban_dir: tempfile::TempDir,
}

pub fn state_with(config: LabConfig) -> TestHarness {
    let runtime = Arc::new(FakeRuntime::default());
    let audit = Arc::new(CaptureSink::default());
    let ban_dir = tempfile::tempdir().unwrap();
    let bans = BanList::load(&ban_dir.path().join("bans.json"));
    let state = AppState::new(config, runtime.clone(), bans, audit.clone());
    TestHarness {
        state,
        runtime,
        audit,
        ban_dir,
    }
}
