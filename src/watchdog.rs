//! Periodic reconciliation between the registry and the runtime's truth.
//!
//! The event-driven paths (user stop, expiry, ban) cannot see crashes or
//! out-of-band deletions; this sweep is the safety net that repairs them.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::warn;

use crate::lifecycle::{self, LifecycleError, TeardownReason};
use crate::runtime::RuntimeStatus;
use crate::state::AppState;

pub fn spawn_watchdog(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.watchdog_secs);
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            sweep(&state).await;
        }
    })
}

/// One full pass over the registry. Each entry is checked in isolation: a
/// failure on one session never stops the rest of the sweep.
pub async fn sweep(state: &AppState) {
    let entries: Vec<(String, String)> = state
        .sessions
        .read()
        .await
        .iter()
        .map(|(owner, s)| (owner.clone(), s.handle.clone()))
        .collect();

    for (owner, handle) in entries {
        let status = match state.runtime.status(&handle).await {
            Ok(status) => status,
            Err(e) => {
                warn!("watchdog cannot inspect {} for {}: {}", handle, owner, e);
                continue;
            }
        };

        let reason = match status {
            RuntimeStatus::Running => continue,
            RuntimeStatus::Exited => TeardownReason::Crashed,
            RuntimeStatus::Missing => TeardownReason::Vanished,
        };

        // Handle-matched so a sweep racing a manual stop plus re-provision
        // cannot destroy the newer lab.
        match lifecycle::teardown_matching(state, &owner, Some(&handle), reason).await {
            Ok(diag) => {
                state.audit.send(lifecycle::teardown_event(&diag)).await;
            }
            Err(LifecycleError::NotFound) => {} // lost the race, nothing to repair
            Err(e) => warn!("watchdog teardown failed for {}: {}", owner, e),
        }
    }
}
