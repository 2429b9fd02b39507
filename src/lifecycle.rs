//! Session lifecycle: provisioning gates, the single teardown routine, the
//! per-session expiry timer and port allocation.

use std::time::Duration;

use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::notify::{AuditEvent, Severity};
use crate::runtime::{CreateSpec, InstanceSummary, RuntimeError, CONTAINER_PORT};
use crate::state::{AppState, Session};

/// Per-container resource caps.
const MEMORY_BYTES: i64 = 512 * 1024 * 1024;
const NANO_CPUS: i64 = 500_000_000;
const PIDS_LIMIT: i64 = 100;

/// Where the lab image records every command the user types.
const HISTORY_PATH: &str = "/var/log/cmd.log";

/// Length of the one-time access secret.
const SECRET_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("access denied: {0}")]
    Denied(String),
    #[error("owner already has an active lab")]
    AlreadyActive,
    #[error("no lab slots available")]
    CapacityExhausted,
    #[error("no free ports available")]
    PortsExhausted,
    #[error("no active lab for this owner")]
    NotFound,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl LifecycleError {
    /// Stable outcome kind for the API surface.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Denied(_) => "denied",
            LifecycleError::AlreadyActive => "already-active",
            LifecycleError::CapacityExhausted => "capacity-exhausted",
            LifecycleError::PortsExhausted => "ports-exhausted",
            LifecycleError::NotFound => "not-found",
            LifecycleError::Runtime(_) => "runtime-error",
        }
    }
}

/// Why a session is being torn down. Every teardown path carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    UserRequested,
    AdminForced,
    Banned,
    Expired,
    /// Watchdog found the container stopped but still present.
    Crashed,
    /// Watchdog found the container gone entirely; nothing left to stop
    /// or fetch history from.
    Vanished,
}

impl TeardownReason {
    pub fn title(self) -> &'static str {
        match self {
            TeardownReason::UserRequested => "Lab stopped",
            TeardownReason::AdminForced => "Admin force stop",
            TeardownReason::Banned => "Ban",
            TeardownReason::Expired => "Session expired",
            TeardownReason::Crashed => "Crash detected",
            TeardownReason::Vanished => "Instance vanished",
        }
    }

    fn severity(self) -> Severity {
        match self {
            TeardownReason::UserRequested => Severity::Info,
            TeardownReason::Expired => Severity::Warning,
            _ => Severity::Urgent,
        }
    }

    fn history_prefix(self) -> &'static str {
        match self {
            TeardownReason::UserRequested | TeardownReason::Expired => "history",
            TeardownReason::AdminForced => "nuked",
            TeardownReason::Banned => "banned",
            TeardownReason::Crashed => "crash",
            TeardownReason::Vanished => "vanished",
        }
    }
}

/// Returned to the caller on successful provisioning. The secret appears
/// here once and is stored nowhere else.
#[derive(Debug)]
pub struct Provisioned {
    pub port: u16,
    pub url: String,
    pub secret: String,
    pub expires_in_secs: u64,
}

/// Forensic record produced by teardown, forwarded to the audit channel.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub owner: String,
    pub display_name: String,
    pub port: u16,
    pub reason: TeardownReason,
    /// `None` when the instance was already gone.
    pub history: Option<String>,
}

/// Provision a lab for `owner`. Gates, in order: ban, duplicate, capacity,
/// port, runtime creation. The whole sequence holds the provision lock so
/// concurrent calls cannot double-book a port or overshoot capacity.
pub async fn provision(
    state: &AppState,
    owner: &str,
    display_name: &str,
) -> Result<Provisioned, LifecycleError> {
    let _guard = state.provision_lock.lock().await;
    let config = &state.config;

    if let Some(reason) = state.bans.reason_for(owner).await {
        state
            .audit
            .send(AuditEvent::new(
                "Ban block",
                format!("{} (banned) tried to start a lab", display_name),
                Severity::Warning,
            ))
            .await;
        return Err(LifecycleError::Denied(reason));
    }

    if state.sessions.read().await.contains_key(owner) {
        state
            .audit
            .send(AuditEvent::new(
                "Duplicate attempt",
                format!("{} tried to start a second lab", display_name),
                Severity::Warning,
            ))
            .await;
        return Err(LifecycleError::AlreadyActive);
    }

    // Capacity and port come from the runtime's own listing, not the
    // registry: containers orphaned out of band still consume both.
    let live = state.runtime.list().await?;
    if live.len() >= config.capacity {
        return Err(LifecycleError::CapacityExhausted);
    }
    let port = free_port(&live, config.base_port, config.capacity)
        .ok_or(LifecycleError::PortsExhausted)?;

    let secret = access_secret();
    let spec = CreateSpec {
        name: container_name(owner),
        image: config.image.clone(),
        entrypoint: vec![
            "ttyd".to_string(),
            "-W".to_string(),
            "-p".to_string(),
            CONTAINER_PORT.to_string(),
            "-c".to_string(),
            format!("student:{}", secret),
            "/usr/local/bin/entrypoint.sh".to_string(),
        ],
        host_port: port,
        owner: owner.to_string(),
        memory_bytes: MEMORY_BYTES,
        nano_cpus: NANO_CPUS,
        pids_limit: PIDS_LIMIT,
        cap_drop: vec!["NET_RAW".to_string()],
    };

    let handle = state.runtime.create(&spec).await?;

    // A ban may have landed while the container was coming up. It must win:
    // roll the fresh container back instead of registering it.
    if let Some(reason) = state.bans.reason_for(owner).await {
        if let Err(e) = state.runtime.stop(&handle).await {
            warn!("rollback stop failed for {}: {}", handle, e);
        }
        if let Err(e) = state.runtime.remove(&handle).await {
            warn!("rollback remove failed for {}: {}", handle, e);
        }
        return Err(LifecycleError::Denied(reason));
    }

    let session = Session {
        owner: owner.to_string(),
        handle: handle.clone(),
        port,
        started_at: Instant::now(),
        display_name: display_name.to_string(),
    };
    state
        .sessions
        .write()
        .await
        .insert(owner.to_string(), session);

    arm_expiry(state.clone(), owner.to_string(), handle);

    info!("provisioned lab for {} on port {}", owner, port);
    state
        .audit
        .send(AuditEvent::new(
            "Lab started",
            format!("{} started a lab on port {}", display_name, port),
            Severity::Info,
        ))
        .await;

    Ok(Provisioned {
        port,
        url: format!("http://{}:{}", config.host_ip, port),
        secret,
        expires_in_secs: config.session_secs,
    })
}

/// Tear down `owner`'s lab. Idempotent: a second call finds no registry
/// entry and returns `NotFound` without touching anything.
pub async fn teardown(
    state: &AppState,
    owner: &str,
    reason: TeardownReason,
) -> Result<Diagnostic, LifecycleError> {
    teardown_matching(state, owner, None, reason).await
}

/// Teardown that only proceeds when the registry still maps `owner` to
/// `expected_handle`. Stale callers (an old expiry timer, a watchdog sweep
/// racing a manual stop) get `NotFound` and must not touch the newer lab.
pub async fn teardown_matching(
    state: &AppState,
    owner: &str,
    expected_handle: Option<&str>,
    reason: TeardownReason,
) -> Result<Diagnostic, LifecycleError> {
    // Claiming the entry first makes concurrent teardowns collapse to one
    // winner, and means a wedged runtime call can never leave the owner
    // stuck in "active" forever.
    let session = {
        let mut sessions = state.sessions.write().await;
        match sessions.get(owner) {
            Some(s) if expected_handle.map_or(true, |h| h == s.handle) => {
                sessions.remove(owner)
            }
            _ => None,
        }
    }
    .ok_or(LifecycleError::NotFound)?;

    let history = if reason == TeardownReason::Vanished {
        None
    } else {
        Some(fetch_history(state, &session.handle).await)
    };

    if reason != TeardownReason::Vanished {
        if let Err(e) = state.runtime.stop(&session.handle).await {
            warn!("stop failed for {}: {}", session.handle, e);
        }
        if let Err(e) = state.runtime.remove(&session.handle).await {
            warn!("remove failed for {}: {}", session.handle, e);
        }
    }

    info!("tore down lab for {} ({:?})", owner, reason);
    Ok(Diagnostic {
        owner: session.owner,
        display_name: session.display_name,
        port: session.port,
        reason,
        history,
    })
}

/// Best-effort command-history retrieval; failure degrades to a placeholder
/// so it never blocks the teardown it is attached to.
pub async fn fetch_history(state: &AppState, handle: &str) -> String {
    match state.runtime.exec_capture(handle, &["cat", HISTORY_PATH]).await {
        Ok(output) => output,
        Err(e) => format!("unable to read command history: {}", e),
    }
}

/// Time left on `owner`'s lab, clamped to zero. `None` when there is none.
pub async fn remaining_time(state: &AppState, owner: &str) -> Option<Duration> {
    let sessions = state.sessions.read().await;
    let session = sessions.get(owner)?;
    let full = Duration::from_secs(state.config.session_secs);
    Some(full.saturating_sub(session.started_at.elapsed()))
}

/// Ban `owner` and immediately destroy any active lab they hold. Returns
/// the teardown diagnostic when a lab was destroyed.
pub async fn ban_owner(state: &AppState, owner: &str, reason: &str) -> Option<Diagnostic> {
    state.bans.ban(owner, reason).await;

    let diag = match teardown(state, owner, TeardownReason::Banned).await {
        Ok(diag) => Some(diag),
        Err(LifecycleError::NotFound) => None,
        Err(e) => {
            warn!("teardown after ban failed for {}: {}", owner, e);
            None
        }
    };

    let mut event = AuditEvent::new(
        "Ban",
        match &diag {
            Some(d) => format!("{} was banned and their lab destroyed. Reason: {}", d.display_name, reason),
            None => format!("{} was banned. Reason: {}", owner, reason),
        },
        Severity::Urgent,
    );
    if let Some(d) = &diag {
        if let Some(history) = &d.history {
            event = event.with_attachment(
                format!("banned_{}.txt", d.display_name),
                history.clone(),
            );
        }
    }
    state.audit.send(event).await;

    diag
}

/// Lift a ban. Returns false when the owner was not banned.
pub async fn unban_owner(state: &AppState, owner: &str) -> bool {
    let removed = state.bans.unban(owner).await;
    if removed {
        state
            .audit
            .send(AuditEvent::new(
                "Unban",
                format!("{} was unbanned", owner),
                Severity::Info,
            ))
            .await;
    }
    removed
}

/// Audit event for a completed teardown, with the history attached under a
/// trigger-specific filename.
pub fn teardown_event(diag: &Diagnostic) -> AuditEvent {
    let message = match diag.reason {
        TeardownReason::UserRequested => {
            format!("{} stopped their lab cleanly", diag.display_name)
        }
        TeardownReason::AdminForced => {
            format!("the lab of {} was forcefully destroyed", diag.display_name)
        }
        TeardownReason::Banned => {
            format!("the lab of {} was destroyed by a ban", diag.display_name)
        }
        TeardownReason::Expired => {
            format!("the lab of {} has expired", diag.display_name)
        }
        TeardownReason::Crashed => format!(
            "the container of {} (port {}) stopped unexpectedly (crash or OOM kill)",
            diag.display_name, diag.port
        ),
        TeardownReason::Vanished => format!(
            "the container of {} (port {}) disappeared (removed out of band?)",
            diag.display_name, diag.port
        ),
    };

    let mut event = AuditEvent::new(diag.reason.title(), message, diag.reason.severity());
    if let Some(history) = &diag.history {
        event = event.with_attachment(
            format!("{}_{}.txt", diag.reason.history_prefix(), diag.display_name),
            history.clone(),
        );
    }
    event
}

/// Arm the deferred expiry for one session. The task re-validates that the
/// registry still holds the same handle before acting, so a timer armed for
/// a lab that was stopped and replaced is a silent no-op.
fn arm_expiry(state: AppState, owner: String, handle: String) {
    let wait = Duration::from_secs(state.config.session_secs + state.config.grace_secs);
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        match teardown_matching(&state, &owner, Some(&handle), TeardownReason::Expired).await {
            Ok(diag) => {
                state.audit.send(teardown_event(&diag)).await;
            }
            Err(LifecycleError::NotFound) => {} // stale timer
            Err(e) => warn!("expiry teardown failed for {}: {}", owner, e),
        }
    });
}

/// Lowest free port in `[base, base + capacity)` given the runtime's report
/// of occupied host ports.
fn free_port(live: &[InstanceSummary], base: u16, capacity: usize) -> Option<u16> {
    let used: Vec<u16> = live.iter().filter_map(|i| i.host_port).collect();
    (base..base.saturating_add(capacity as u16)).find(|p| !used.contains(p))
}

fn access_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

fn container_name(owner: &str) -> String {
    let safe: String = owner
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("lab-{}-{}", safe.to_ascii_lowercase(), &suffix[..8])
}
