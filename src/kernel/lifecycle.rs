//! Lifecycle state machine.
//!
//! Every state change of an [`Agent`] goes through this module. Each
//! function takes the record by `&mut`, which the caller only has while
//! holding that record's lock, so a transition and its side fields (`pid`,
//! timestamps, `exit_reason`) land together and readers never see a torn
//! record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::agent::{Agent, AgentState, ExitReason, ExitStatusInfo, LaunchErrorKind};
use crate::{AppError, Result};

/// Trampoline exit codes, reported while `starting`.
const TRAMPOLINE_CGROUP_FAILED: i32 = 125;
const TRAMPOLINE_NOT_EXECUTABLE: i32 = 126;
const TRAMPOLINE_EXEC_FAILED: i32 = 127;

/// What a kill request did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Moved to `stopping`; the process group must be signalled.
    Signal(u32),
    /// Liveness not yet confirmed; the kill fires once it is.
    Latched,
    /// A previous kill is still in flight; nothing to do.
    AlreadyStopping,
}

impl KillOutcome {
    /// Wire name of the outcome.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signal(_) => "signalled",
            Self::Latched => "latched",
            Self::AlreadyStopping => "already_stopping",
        }
    }
}

fn transition(agent: &mut Agent, next: AgentState) -> bool {
    if !agent.state.can_transition_to(next) {
        debug!(
            agent_id = agent.id,
            from = %agent.state,
            to = %next,
            "ignoring illegal transition"
        );
        return false;
    }
    debug!(agent_id = agent.id, from = %agent.state, to = %next, "agent transition");
    agent.state = next;
    agent.history.push(next);
    true
}

fn finish(agent: &mut Agent, next: AgentState, reason: ExitReason, now: DateTime<Utc>) -> bool {
    if !transition(agent, next) {
        return false;
    }
    agent.stopped_at = Some(now);
    if agent.exit_reason.is_none() {
        agent.exit_reason = Some(reason);
    }
    true
}

/// `created → starting` once the program has been exec'd.
///
/// # Errors
///
/// Returns `AppError::InvalidArgument` if the agent is not `created`.
pub fn begin_start(
    agent: &mut Agent,
    pid: u32,
    cgroup: Option<PathBuf>,
    now: DateTime<Utc>,
) -> Result<()> {
    if !transition(agent, AgentState::Starting) {
        return Err(AppError::InvalidArgument(format!(
            "agent {} cannot start from {}",
            agent.id, agent.state
        )));
    }
    agent.pid = Some(pid);
    agent.started_at = Some(now);
    agent.cgroup = cgroup;
    Ok(())
}

/// Record a launch failure: `created → starting → failed`.
///
/// No OS process exists for such an agent, so `pid` stays unset.
pub fn fail_launch(agent: &mut Agent, reason: LaunchErrorKind, now: DateTime<Utc>) {
    if agent.state == AgentState::Created {
        transition(agent, AgentState::Starting);
    }
    finish(
        agent,
        AgentState::Failed,
        ExitReason::LaunchError { reason },
        now,
    );
}

/// `starting → running` after the first successful liveness read.
///
/// Returns the pid to signal when a kill was latched while starting; the
/// agent is then already `stopping`.
pub fn confirm_alive(agent: &mut Agent) -> Option<u32> {
    if !transition(agent, AgentState::Running) {
        return None;
    }
    if agent.kill_requested && transition(agent, AgentState::Stopping) {
        return agent.pid;
    }
    None
}

/// Apply a kill request.
///
/// # Errors
///
/// Returns `AppError::AlreadyTerminal` for `stopped`/`failed` agents.
pub fn request_kill(agent: &mut Agent) -> Result<KillOutcome> {
    match agent.state {
        AgentState::Stopped | AgentState::Failed => Err(AppError::AlreadyTerminal(format!(
            "agent {} is already {}",
            agent.id, agent.state
        ))),
        AgentState::Stopping => Ok(KillOutcome::AlreadyStopping),
        AgentState::Created | AgentState::Starting => {
            agent.kill_requested = true;
            Ok(KillOutcome::Latched)
        }
        AgentState::Running => {
            agent.kill_requested = true;
            transition(agent, AgentState::Stopping);
            match agent.pid {
                Some(pid) => Ok(KillOutcome::Signal(pid)),
                None => Ok(KillOutcome::AlreadyStopping),
            }
        }
    }
}

fn launch_failure_from_trampoline(status: ExitStatusInfo) -> Option<LaunchErrorKind> {
    match status.code? {
        TRAMPOLINE_CGROUP_FAILED => Some(LaunchErrorKind::ResourceLimitRejected),
        TRAMPOLINE_NOT_EXECUTABLE => Some(LaunchErrorKind::PermissionDenied),
        TRAMPOLINE_EXEC_FAILED => Some(LaunchErrorKind::ExecFailed),
        _ => None,
    }
}

/// Apply an observed process exit and return the resulting state.
///
/// `trampoline` marks processes launched through the cgroup trampoline,
/// whose 125–127 exit codes while `starting` are launch failures.
/// Exits on already-terminal agents are no-ops.
pub fn observe_exit(
    agent: &mut Agent,
    status: ExitStatusInfo,
    trampoline: bool,
    now: DateTime<Utc>,
) -> AgentState {
    match agent.state {
        AgentState::Starting => {
            if trampoline {
                if let Some(reason) = launch_failure_from_trampoline(status) {
                    finish(agent, AgentState::Failed, ExitReason::LaunchError { reason }, now);
                    return agent.state;
                }
            }
            if status.success() {
                // It ran to completion inside the startup grace window.
                transition(agent, AgentState::Running);
                transition(agent, AgentState::Stopping);
                finish(agent, AgentState::Stopped, ExitReason::Completed, now);
            } else {
                finish(agent, AgentState::Failed, ExitReason::ExitFailure { status }, now);
            }
        }
        AgentState::Running => {
            if status.success() {
                transition(agent, AgentState::Stopping);
                finish(agent, AgentState::Stopped, ExitReason::Completed, now);
            } else {
                finish(agent, AgentState::Failed, ExitReason::ExitFailure { status }, now);
            }
        }
        AgentState::Stopping => {
            if status.is_requested_stop() {
                finish(agent, AgentState::Stopped, ExitReason::Requested { status }, now);
            } else {
                finish(agent, AgentState::Failed, ExitReason::ExitFailure { status }, now);
            }
        }
        AgentState::Created | AgentState::Stopped | AgentState::Failed => {
            debug!(agent_id = agent.id, state = %agent.state, "exit ignored");
        }
    }
    agent.state
}

/// Record a heartbeat. Never changes state.
///
/// # Errors
///
/// Returns `AppError::AlreadyTerminal` for finished agents.
pub fn heartbeat(agent: &mut Agent, now: DateTime<Utc>) -> Result<()> {
    if agent.state.is_terminal() {
        return Err(AppError::AlreadyTerminal(format!(
            "agent {} is already {}",
            agent.id, agent.state
        )));
    }
    agent.last_heartbeat_at = Some(now);
    Ok(())
}

/// Add LLM usage. Counters only grow; terminal agents are frozen.
///
/// # Errors
///
/// Returns `AppError::InvalidArgument` for negative deltas and
/// `AppError::AlreadyTerminal` for finished agents. Counters are left
/// unchanged on error.
pub fn add_llm_usage(agent: &mut Agent, requests_delta: i64, tokens_delta: i64) -> Result<()> {
    let (Ok(requests), Ok(tokens)) = (u64::try_from(requests_delta), u64::try_from(tokens_delta))
    else {
        return Err(AppError::InvalidArgument(format!(
            "usage deltas must be non-negative (requests={requests_delta}, tokens={tokens_delta})"
        )));
    };
    if agent.state.is_terminal() {
        return Err(AppError::AlreadyTerminal(format!(
            "agent {} is already {}; usage is frozen",
            agent.id, agent.state
        )));
    }
    agent.llm_requests = agent.llm_requests.saturating_add(requests);
    agent.llm_tokens = agent.llm_tokens.saturating_add(tokens);
    Ok(())
}
