//! Agent record and lifecycle vocabulary.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kernel-assigned agent identifier. Never reused while the kernel runs.
pub type AgentId = u64;

/// Lifecycle state of a supervised agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Spawn request accepted; no process yet.
    Created,
    /// Program exec'd; liveness not yet confirmed.
    Starting,
    /// Process confirmed alive.
    Running,
    /// Termination requested; waiting for the exit.
    Stopping,
    /// Exited as requested (or completed cleanly).
    Stopped,
    /// Launch failure or abnormal exit.
    Failed,
}

impl AgentState {
    /// All states in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Created,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Failed,
    ];

    /// `stopped` and `failed` accept no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Starting, Self::Running | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Stopped | Self::Failed)
        )
    }

    /// Wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl Display for AgentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failure to start an agent program.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchErrorKind {
    /// Program name could not be resolved on `PATH`.
    NotFound,
    /// Program exists but may not be executed.
    PermissionDenied,
    /// Requested resource limits could not be applied.
    ResourceLimitRejected,
    /// The OS refused to exec the program.
    ExecFailed,
}

impl LaunchErrorKind {
    /// Wire name of the failure.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceLimitRejected => "resource_limit_rejected",
            Self::ExecFailed => "exec_failed",
        }
    }
}

impl Display for LaunchErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process ended, as reported by the OS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExitStatusInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when killed by a signal.
    pub signal: Option<i32>,
}

/// `SIGINT`, `SIGKILL` and `SIGTERM` on every Unix we target.
const STOP_SIGNALS: [i32; 3] = [2, 9, 15];

impl ExitStatusInfo {
    /// Status returned when waiting on the child failed.
    #[must_use]
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Clean exit with status 0.
    #[must_use]
    pub fn success(self) -> bool {
        self.code == Some(0)
    }

    /// Whether this exit is the expected outcome of a termination request.
    ///
    /// Shells report a signalled child as `128 + signo`, so 130/137/143
    /// count as well.
    #[must_use]
    pub fn is_requested_stop(self) -> bool {
        if let Some(signal) = self.signal {
            return STOP_SIGNALS.contains(&signal);
        }
        matches!(self.code, Some(0 | 130 | 137 | 143))
    }
}

impl From<std::process::ExitStatus> for ExitStatusInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl Display for ExitStatusInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("status unknown"),
        }
    }
}

/// Why an agent reached a terminal state. Set exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// Stopped after a kill request.
    Requested {
        /// Exit status observed.
        status: ExitStatusInfo,
    },
    /// Exited with status 0 without being asked to.
    Completed,
    /// Exited with an abnormal status.
    ExitFailure {
        /// Exit status observed.
        status: ExitStatusInfo,
    },
    /// Never got running.
    LaunchError {
        /// Failure classification.
        reason: LaunchErrorKind,
    },
}

/// Agent record owned by the agent table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    /// Kernel-assigned identifier.
    pub id: AgentId,
    /// Caller-supplied label.
    pub name: String,
    /// Program that was launched.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// OS process id once exec'd.
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub state: AgentState,
    /// States entered so far, in order.
    pub history: Vec<AgentState>,
    /// Spawning agent; `None` for kernel-level spawns.
    pub parent_id: Option<AgentId>,
    /// Agents spawned by this one, in spawn order.
    pub child_ids: Vec<AgentId>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Exec time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last sampled resident memory.
    pub memory_bytes: u64,
    /// Memory limit applied at launch.
    pub memory_limit_bytes: Option<u64>,
    /// Reported LLM request count.
    pub llm_requests: u64,
    /// Reported LLM token count.
    pub llm_tokens: u64,
    /// Terminal reason.
    pub exit_reason: Option<ExitReason>,
    /// Last heartbeat received from the agent.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Kill requested before liveness was confirmed.
    pub kill_requested: bool,
    /// Control group holding the agent's process group.
    pub cgroup: Option<PathBuf>,
}

impl Agent {
    /// Construct a fresh `created` record.
    #[must_use]
    pub fn new(
        id: AgentId,
        name: String,
        command: String,
        args: Vec<String>,
        parent_id: Option<AgentId>,
        memory_limit_bytes: Option<u64>,
    ) -> Self {
        Self {
            id,
            name,
            command,
            args,
            pid: None,
            state: AgentState::Created,
            history: vec![AgentState::Created],
            parent_id,
            child_ids: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            memory_bytes: 0,
            memory_limit_bytes,
            llm_requests: 0,
            llm_tokens: 0,
            exit_reason: None,
            last_heartbeat_at: None,
            kill_requested: false,
            cgroup: None,
        }
    }

    /// Whether the agent can still change state.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}
