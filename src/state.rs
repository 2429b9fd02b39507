//! Shared application state, session records and server configuration.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::bans::BanList;
use crate::notify::AuditSink;
use crate::runtime::RuntimeGateway;

/// One owner's provisioned lab: the container handle plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct Session {
    pub owner: String,
    pub handle: String,
    pub port: u16,
    pub started_at: Instant,
    pub display_name: String,
}

/// Thread-safe session registry, keyed by owner id.
pub type Sessions = Arc<RwLock<HashMap<String, Session>>>;

/// Server configuration, filled from CLI flags in `main`.
#[derive(Debug, Clone)]
pub struct LabConfig {
    /// Public address users connect to.
    pub host_ip: String,
    /// Docker image the lab containers run.
    pub image: String,
    /// First host port; labs use `[base_port, base_port + capacity)`.
    pub base_port: u16,
    /// Maximum simultaneous labs.
    pub capacity: usize,
    /// Lab lifetime in seconds.
    pub session_secs: u64,
    /// Extra slack before the expiry task fires.
    pub grace_secs: u64,
    /// Watchdog sweep interval in seconds.
    pub watchdog_secs: u64,
    /// Bearer token required on admin routes. `None` disables them.
    pub admin_token: Option<String>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            image: "lab-image".to_string(),
            base_port: 9500,
            capacity: 5,
            session_secs: 3600,
            grace_secs: 60,
            watchdog_secs: 60,
            admin_token: None,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LabConfig>,
    pub sessions: Sessions,
    pub runtime: Arc<dyn RuntimeGateway>,
    pub bans: Arc<BanList>,
    pub audit: Arc<dyn AuditSink>,
    /// Serializes the capacity/port decision during provisioning.
    pub provision_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        config: LabConfig,
        runtime: Arc<dyn RuntimeGateway>,
        bans: BanList,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            runtime,
            bans: Arc::new(bans),
            audit,
            provision_lock: Arc::new(Mutex::new(())),
        }
    }
}
