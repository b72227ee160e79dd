//! Metrics aggregator.
//!
//! Builds [`AgentMetrics`] and [`Snapshot`] values from the agent table,
//! refreshing `memory_bytes` for live agents through the resource
//! accountant first. Sampling happens without any table lock held; results
//! are written back only while the agent is still live, so terminal
//! records stay frozen.
//!
//! Totals come from one O(n) pass over the table per call. That is fine for
//! the populations a single kernel supervises; much larger tables would
//! want incremental counters instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::accountant::ResourceAccountant;
use super::table::AgentTable;
use crate::models::agent::{Agent, AgentId};
use crate::models::metrics::{AgentMetrics, Snapshot};

/// Computes snapshots over the agent table.
#[derive(Debug)]
pub struct MetricsAggregator {
    table: Arc<AgentTable>,
    accountant: ResourceAccountant,
}

struct SampleTarget {
    id: AgentId,
    pid: Option<u32>,
    cgroup: Option<PathBuf>,
}

impl SampleTarget {
    fn of(agent: &Agent) -> Option<Self> {
        agent.is_live().then(|| Self {
            id: agent.id,
            pid: agent.pid,
            cgroup: agent.cgroup.clone(),
        })
    }
}

impl MetricsAggregator {
    /// Aggregator over `table`.
    #[must_use]
    pub fn new(table: Arc<AgentTable>, accountant: ResourceAccountant) -> Self {
        Self { table, accountant }
    }

    /// Metrics for one agent, or `None` if it is unknown.
    pub async fn snapshot(&self, id: AgentId) -> Option<AgentMetrics> {
        let agent = self.table.read(id).await?;
        if let Some(target) = SampleTarget::of(&agent) {
            self.sample_and_store(&target).await;
        }
        let agent = self.table.read(id).await?;
        Some(AgentMetrics::from_agent(&agent, Utc::now()))
    }

    /// Metrics for every agent plus totals.
    pub async fn snapshot_all(&self) -> Snapshot {
        let targets: Vec<SampleTarget> = self
            .table
            .records()
            .await
            .iter()
            .filter_map(SampleTarget::of)
            .collect();
        join_all(targets.iter().map(|target| self.sample_and_store(target))).await;

        let now = Utc::now();
        let agents = self
            .table
            .records()
            .await
            .iter()
            .map(|agent| AgentMetrics::from_agent(agent, now))
            .collect();
        Snapshot::from_metrics(agents)
    }

    /// Sample every live agent once. Returns how many samples were stored.
    pub async fn sample_live(&self) -> usize {
        let targets: Vec<SampleTarget> = self
            .table
            .records()
            .await
            .iter()
            .filter_map(SampleTarget::of)
            .collect();
        join_all(targets.iter().map(|target| self.sample_and_store(target)))
            .await
            .into_iter()
            .filter(|stored| *stored)
            .count()
    }

    async fn sample_and_store(&self, target: &SampleTarget) -> bool {
        let Some(bytes) = self
            .accountant
            .sample(target.pid, target.cgroup.as_deref())
            .await
        else {
            debug!(agent_id = target.id, "memory accounting unavailable; keeping last value");
            return false;
        };

        self.table
            .with_agent(target.id, |agent| {
                if agent.is_live() {
                    agent.memory_bytes = bytes;
                    true
                } else {
                    false
                }
            })
            .await
            .unwrap_or(false)
    }

    /// Spawn the periodic sampler. Runs until `cancel` fires.
    #[must_use]
    pub fn spawn_sampler(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("metrics sampler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let stored = self.sample_live().await;
                        debug!(stored, "memory sample pass complete");
                    }
                }
            }
        })
    }
}
