//! Command/query service: the kernel's public operations.
//!
//! Every IPC command lands on one method of [`Kernel`]. The kernel owns the
//! agent table, the launcher, the metrics aggregator and the watcher tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::accountant::ResourceAccountant;
use super::aggregator::MetricsAggregator;
use super::cgroup::CgroupManager;
use super::launcher::{LaunchSpec, ProcessLauncher};
use super::lifecycle::{self, KillOutcome};
use super::signal;
use super::table::{AgentTable, NewAgent};
use super::watcher::{spawn_watcher, WatchedProcess};
use crate::config::KernelConfig;
use crate::models::agent::AgentId;
use crate::models::metrics::{AgentMetrics, KernelStatus, LlmUsage, Snapshot};
use crate::{AppError, Result};

/// Parameters of a spawn request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Label for the agent.
    pub name: String,
    /// Program path, or a bare name looked up on `PATH`.
    pub program: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Spawning agent, if any.
    #[serde(default)]
    pub parent_id: Option<AgentId>,
    /// Memory limit; falls back to `launch.default_memory_max_bytes`.
    #[serde(default)]
    pub memory_max_bytes: Option<u64>,
}

/// Agent supervisor and metrics kernel.
#[derive(Debug)]
pub struct Kernel {
    table: Arc<AgentTable>,
    launcher: ProcessLauncher,
    metrics: Arc<MetricsAggregator>,
    default_memory_max_bytes: Option<u64>,
    startup_grace: Duration,
    watchers: TaskTracker,
    watcher_cancel: CancellationToken,
    started_at: Instant,
}

impl Kernel {
    /// Build a kernel with an empty agent table.
    #[must_use]
    pub fn new(config: &KernelConfig) -> Arc<Self> {
        let table = Arc::new(AgentTable::new());
        let accountant = ResourceAccountant::new(config.metrics.sample_timeout());
        let metrics = Arc::new(MetricsAggregator::new(Arc::clone(&table), accountant));
        let launcher = ProcessLauncher::new(
            config.launch.clone(),
            CgroupManager::new(&config.cgroup),
            config.ipc_name.clone(),
        );

        Arc::new(Self {
            table,
            launcher,
            metrics,
            default_memory_max_bytes: config.launch.default_memory_max_bytes,
            startup_grace: config.launch.startup_grace(),
            watchers: TaskTracker::new(),
            watcher_cancel: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// The metrics aggregator, for the background sampler.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.metrics)
    }

    /// Launch a new agent and return its id.
    ///
    /// Returns once the program has been exec'd; the agent is `starting`
    /// and becomes `running` after the startup grace period.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidArgument` for an empty program.
    /// - `AppError::NotFound` for an unknown `parent_id`.
    /// - `AppError::Launch` when the program cannot be started. Failures
    ///   after id allocation carry the `agent_id`, which stays in the
    ///   table as `failed`.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentId> {
        if request.program.trim().is_empty() {
            return Err(AppError::InvalidArgument("program must not be empty".into()));
        }
        if let Some(parent_id) = request.parent_id {
            if self.table.get(parent_id).await.is_none() {
                return Err(AppError::NotFound(format!(
                    "parent agent {parent_id} not found"
                )));
            }
        }

        let program = self.launcher.resolve_program(&request.program)?;
        let memory_max_bytes = request.memory_max_bytes.or(self.default_memory_max_bytes);
        let args = request.args.clone();

        let id = self
            .table
            .insert(NewAgent {
                name: request.name,
                command: request.program,
                args: request.args,
                parent_id: request.parent_id,
                memory_limit_bytes: memory_max_bytes,
            })
            .await?;

        let spec = LaunchSpec {
            agent_id: id,
            parent_id: request.parent_id,
            program: &program,
            args: &args,
            memory_max_bytes,
        };

        let process = match self.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(err) => {
                warn!(agent_id = id, reason = %err.reason, error = %err.message, "agent launch failed");
                self.table
                    .with_agent(id, |agent| lifecycle::fail_launch(agent, err.reason, Utc::now()))
                    .await?;
                return Err(AppError::Launch(err.for_agent(id)));
            }
        };

        let pid = process.pid;
        let cgroup = process.cgroup.clone();
        self.table
            .with_agent(id, |agent| lifecycle::begin_start(agent, pid, cgroup, Utc::now()))
            .await??;

        spawn_watcher(
            &self.watchers,
            Arc::clone(&self.table),
            WatchedProcess {
                agent_id: id,
                child: process.child,
                cgroup: process.cgroup,
                trampoline: process.trampoline,
            },
            self.startup_grace,
            self.watcher_cancel.clone(),
        );

        info!(agent_id = id, pid, parent_id = ?request.parent_id, "agent spawned");
        Ok(id)
    }

    /// Request termination of an agent's process group.
    ///
    /// A kill while `created`/`starting` is remembered and delivered once
    /// the agent is confirmed running. A second kill while `stopping` is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids and
    /// `AppError::AlreadyTerminal` for finished agents.
    pub async fn kill(&self, id: AgentId) -> Result<KillOutcome> {
        let outcome = self
            .table
            .with_agent(id, |agent| -> Result<KillOutcome> {
                let outcome = lifecycle::request_kill(agent)?;
                if let KillOutcome::Signal(pid) = outcome {
                    // Signal under the record lock so the exit watcher cannot
                    // finish the agent between the transition and the signal.
                    if let Err(err) = signal::terminate_group(pid) {
                        warn!(agent_id = id, pid, %err, "failed to signal agent process group");
                    }
                }
                Ok(outcome)
            })
            .await??;

        info!(agent_id = id, ?outcome, "kill requested");
        Ok(outcome)
    }

    /// Metrics for every agent plus totals.
    pub async fn list(&self) -> Snapshot {
        self.metrics.snapshot_all().await
    }

    /// Metrics for one agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub async fn describe(&self, id: AgentId) -> Result<AgentMetrics> {
        self.metrics
            .snapshot(id)
            .await
            .ok_or_else(|| AppError::agent_not_found(id))
    }

    /// Add LLM usage to an agent's counters and return the new totals.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::InvalidArgument` for
    /// negative deltas, or `AppError::AlreadyTerminal`.
    pub async fn report_llm_usage(
        &self,
        id: AgentId,
        requests_delta: i64,
        tokens_delta: i64,
    ) -> Result<LlmUsage> {
        self.table
            .with_agent(id, |agent| -> Result<LlmUsage> {
                lifecycle::add_llm_usage(agent, requests_delta, tokens_delta)?;
                Ok(LlmUsage {
                    agent_id: agent.id,
                    llm_requests: agent.llm_requests,
                    llm_tokens: agent.llm_tokens,
                })
            })
            .await?
    }

    /// Record a heartbeat from an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::AlreadyTerminal`.
    pub async fn heartbeat(&self, id: AgentId) -> Result<()> {
        self.table
            .with_agent(id, |agent| lifecycle::heartbeat(agent, Utc::now()))
            .await?
    }

    /// Drop fully-terminal agent trees from the table.
    pub async fn prune(&self) -> Vec<AgentId> {
        self.table.prune().await
    }

    /// Kernel liveness summary.
    pub async fn ping(&self) -> KernelStatus {
        KernelStatus {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            agents: u64::try_from(self.table.len().await).unwrap_or(u64::MAX),
        }
    }

    /// Kill every live agent and wait up to `grace` for the exits.
    ///
    /// Watchers still running after `grace` are cancelled, which drops and
    /// force-kills their children.
    pub async fn shutdown(&self, grace: Duration) {
        let live = self.table.live_ids().await;
        info!(count = live.len(), "killing live agents");
        for id in live {
            if let Err(err) = self.kill(id).await {
                warn!(agent_id = id, %err, "kill during shutdown failed");
            }
        }

        self.watchers.close();
        if tokio::time::timeout(grace, self.watchers.wait()).await.is_err() {
            warn!(
                remaining = self.watchers.len(),
                "agents still running after shutdown grace; force killing"
            );
            self.watcher_cancel.cancel();
            self.watchers.wait().await;
        }
        info!("kernel shut down");
    }
}
