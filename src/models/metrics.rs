//! Read-only snapshots handed to callers outside the agent table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::{Agent, AgentId, AgentState, ExitReason};

/// Point-in-time metrics for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetrics {
    /// Agent identifier.
    pub id: AgentId,
    /// Caller-supplied label.
    pub name: String,
    /// OS process id, once exec'd.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: AgentState,
    /// Seconds since exec; frozen once terminal.
    pub uptime_seconds: u64,
    /// Last sampled resident memory.
    pub memory_bytes: u64,
    /// Reported LLM requests.
    pub llm_requests: u64,
    /// Reported LLM tokens.
    pub llm_tokens: u64,
    /// Spawning agent, `null` for kernel-level agents.
    pub parent_id: Option<AgentId>,
    /// Spawned agents in spawn order.
    pub child_ids: Vec<AgentId>,
    /// Terminal reason.
    pub exit_reason: Option<ExitReason>,
    /// States entered so far.
    ///
    /// An agent whose launch failed passes through `starting` without ever
    /// getting a `pid`.
    pub state_history: Vec<AgentState>,
    /// Program launched.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Memory limit applied at launch.
    pub memory_limit_bytes: Option<u64>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Exec time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last heartbeat.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    /// Project an agent record at `now`.
    #[must_use]
    pub fn from_agent(agent: &Agent, now: DateTime<Utc>) -> Self {
        Self {
            id: agent.id,
            name: agent.name.clone(),
            pid: agent.pid,
            state: agent.state,
            uptime_seconds: uptime_seconds(agent, now),
            memory_bytes: agent.memory_bytes,
            llm_requests: agent.llm_requests,
            llm_tokens: agent.llm_tokens,
            parent_id: agent.parent_id,
            child_ids: agent.child_ids.clone(),
            exit_reason: agent.exit_reason,
            state_history: agent.history.clone(),
            command: agent.command.clone(),
            args: agent.args.clone(),
            memory_limit_bytes: agent.memory_limit_bytes,
            created_at: agent.created_at,
            started_at: agent.started_at,
            stopped_at: agent.stopped_at,
            last_heartbeat_at: agent.last_heartbeat_at,
        }
    }
}

/// Uptime in whole seconds: 0 before exec, frozen at `stopped_at` once
/// terminal.
#[must_use]
pub fn uptime_seconds(agent: &Agent, now: DateTime<Utc>) -> u64 {
    let Some(started) = agent.started_at else {
        return 0;
    };
    let end = agent.stopped_at.unwrap_or(now);
    u64::try_from((end - started).num_seconds()).unwrap_or(0)
}

/// Per-state agent counts plus population-wide sums.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Totals {
    /// All agents in the table.
    pub total: u64,
    /// Agents in `created`.
    pub created: u64,
    /// Agents in `starting`.
    pub starting: u64,
    /// Agents in `running`.
    pub running: u64,
    /// Agents in `stopping`.
    pub stopping: u64,
    /// Agents in `stopped`.
    pub stopped: u64,
    /// Agents in `failed`.
    pub failed: u64,
    /// Sum of `llm_requests`.
    pub llm_requests: u64,
    /// Sum of `llm_tokens`.
    pub llm_tokens: u64,
    /// Sum of `memory_bytes`.
    pub memory_bytes: u64,
}

impl Totals {
    /// Fold one agent into the totals.
    pub fn add(&mut self, metrics: &AgentMetrics) {
        self.total += 1;
        let bucket = match metrics.state {
            AgentState::Created => &mut self.created,
            AgentState::Starting => &mut self.starting,
            AgentState::Running => &mut self.running,
            AgentState::Stopping => &mut self.stopping,
            AgentState::Stopped => &mut self.stopped,
            AgentState::Failed => &mut self.failed,
        };
        *bucket += 1;
        self.llm_requests = self.llm_requests.saturating_add(metrics.llm_requests);
        self.llm_tokens = self.llm_tokens.saturating_add(metrics.llm_tokens);
        self.memory_bytes = self.memory_bytes.saturating_add(metrics.memory_bytes);
    }

    /// Count for a single state.
    #[must_use]
    pub fn count(&self, state: AgentState) -> u64 {
        match state {
            AgentState::Created => self.created,
            AgentState::Starting => self.starting,
            AgentState::Running => self.running,
            AgentState::Stopping => self.stopping,
            AgentState::Stopped => self.stopped,
            AgentState::Failed => self.failed,
        }
    }
}

/// Every agent plus totals, taken in one pass over the table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Agents ordered by id.
    pub agents: Vec<AgentMetrics>,
    /// Aggregate counts.
    pub totals: Totals,
}

impl Snapshot {
    /// Build a snapshot from already-projected metrics.
    #[must_use]
    pub fn from_metrics(agents: Vec<AgentMetrics>) -> Self {
        let mut totals = Totals::default();
        for metrics in &agents {
            totals.add(metrics);
        }
        Self { agents, totals }
    }

    /// Look up one agent in the snapshot.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&AgentMetrics> {
        self.agents.iter().find(|m| m.id == id)
    }
}

/// Counter values after a usage report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmUsage {
    /// Agent the usage belongs to.
    pub agent_id: AgentId,
    /// Total requests after the report.
    pub llm_requests: u64,
    /// Total tokens after the report.
    pub llm_tokens: u64,
}

/// Kernel liveness summary returned by `ping`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelStatus {
    /// Crate version.
    pub version: String,
    /// Seconds since the kernel started.
    pub uptime_seconds: u64,
    /// Agents currently in the table.
    pub agents: u64,
}
