//! Per-agent exit watcher.
//!
//! Owns the agent's `Child`. Confirms liveness once the startup grace has
//! passed, then waits for the exit and applies it to the record. Kills do
//! not go through the watcher; they signal the process group directly, and
//! the watcher only observes the resulting exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::cgroup;
use super::lifecycle;
use super::signal;
use super::table::AgentTable;
use crate::models::agent::{AgentId, ExitStatusInfo};

/// How long a cancelled watcher waits for the killed child to be reaped.
pub const CANCEL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the watcher needs about one launched agent.
#[derive(Debug)]
pub struct WatchedProcess {
    /// Agent being watched.
    pub agent_id: AgentId,
    /// Child handle.
    pub child: Child,
    /// Cgroup to clean up after exit.
    pub cgroup: Option<PathBuf>,
    /// Launched through the cgroup trampoline.
    pub trampoline: bool,
}

/// Spawn the watcher task on `tracker`.
///
/// On `cancel` the watcher kills the child, reaps it within
/// [`CANCEL_REAP_TIMEOUT`] and removes the agent's cgroup.
pub fn spawn_watcher(
    tracker: &TaskTracker,
    table: Arc<AgentTable>,
    process: WatchedProcess,
    startup_grace: Duration,
    cancel: CancellationToken,
) {
    tracker.spawn(watch(table, process, startup_grace, cancel));
}

async fn watch(
    table: Arc<AgentTable>,
    process: WatchedProcess,
    startup_grace: Duration,
    cancel: CancellationToken,
) {
    let WatchedProcess {
        agent_id,
        mut child,
        cgroup,
        trampoline,
    } = process;

    let Some(status) = wait_for_exit(&table, agent_id, &mut child, startup_grace, &cancel).await
    else {
        reap_on_cancel(agent_id, &mut child).await;
        if let Some(scope) = cgroup {
            cgroup::remove_scope(&scope).await;
        }
        return;
    };

    let info = match status {
        Ok(status) => ExitStatusInfo::from(status),
        Err(err) => {
            warn!(agent_id, %err, "error waiting for agent process");
            ExitStatusInfo::unknown()
        }
    };

    match table
        .with_agent(agent_id, |agent| {
            lifecycle::observe_exit(agent, info, trampoline, Utc::now())
        })
        .await
    {
        Ok(state) => info!(agent_id, status = %info, %state, "agent process exited"),
        Err(err) => warn!(agent_id, %err, "exit observed for unknown agent"),
    }

    if let Some(scope) = cgroup {
        cgroup::remove_scope(&scope).await;
    }
}

/// Wait out the startup grace, confirm liveness, then wait for the exit.
///
/// Returns `None` when cancelled first.
async fn wait_for_exit(
    table: &AgentTable,
    agent_id: AgentId,
    child: &mut Child,
    startup_grace: Duration,
    cancel: &CancellationToken,
) -> Option<std::io::Result<std::process::ExitStatus>> {
    let early_exit = tokio::select! {
        status = child.wait() => Some(status),
        () = tokio::time::sleep(startup_grace) => None,
        () = cancel.cancelled() => {
            info!(agent_id, "watcher cancelled during startup");
            return None;
        }
    };
    if early_exit.is_some() {
        return early_exit;
    }

    match table.with_agent(agent_id, lifecycle::confirm_alive).await {
        Ok(Some(pid)) => {
            info!(agent_id, pid, "agent running; delivering latched kill");
            if let Err(err) = signal::terminate_group(pid) {
                warn!(agent_id, pid, %err, "failed to signal agent process group");
            }
        }
        Ok(None) => info!(agent_id, "agent running"),
        Err(err) => warn!(agent_id, %err, "agent vanished from table"),
    }

    tokio::select! {
        status = child.wait() => Some(status),
        () = cancel.cancelled() => {
            info!(agent_id, "watcher cancelled");
            None
        }
    }
}

/// Kill a child left running at cancellation, along with its process
/// group, and reap it so its cgroup empties.
async fn reap_on_cancel(agent_id: AgentId, child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(err) = signal::kill_group(pid) {
            debug!(agent_id, pid, %err, "process group already gone");
        }
    }
    if let Err(err) = child.start_kill() {
        debug!(agent_id, %err, "child already gone");
    }
    if tokio::time::timeout(CANCEL_REAP_TIMEOUT, child.wait())
        .await
        .is_err()
    {
        warn!(agent_id, "killed agent not reaped in time");
    }
}
