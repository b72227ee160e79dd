//! Agent table: the single owner of every agent record.
//!
//! Records live in an id-keyed arena; hierarchy links are ids. The map is
//! guarded by an `RwLock` and each record by its own `Mutex`. Lock order is
//! always map then record, and no record lock is held while acquiring the
//! map, so mutations on distinct agents only contend on the brief map read.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::models::agent::{Agent, AgentId};
use crate::{AppError, Result};

/// Shared handle to one record.
pub type AgentRecord = Arc<Mutex<Agent>>;

/// Fields needed to create a record.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    /// Caller-supplied label.
    pub name: String,
    /// Program to launch.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Spawning agent.
    pub parent_id: Option<AgentId>,
    /// Memory limit to apply.
    pub memory_limit_bytes: Option<u64>,
}

/// Concurrent registry of all known agents.
#[derive(Debug)]
pub struct AgentTable {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    next_id: Mutex<AgentId>,
}

impl Default for AgentTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentTable {
    /// Create an empty table. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Allocate an id and insert a `created` record, linking it into its
    /// parent's `child_ids` in the same critical section.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `parent_id` names an unknown agent.
    pub async fn insert(&self, new: NewAgent) -> Result<AgentId> {
        let mut agents = self.agents.write().await;

        let parent = match new.parent_id {
            Some(parent_id) => Some(
                agents
                    .get(&parent_id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("parent agent {parent_id} not found")))?,
            ),
            None => None,
        };

        let id = {
            let mut next = self.next_id.lock().await;
            let id = *next;
            *next += 1;
            id
        };

        if let Some(parent) = parent {
            let mut parent = parent.lock().await;
            if !parent.child_ids.contains(&id) {
                parent.child_ids.push(id);
            }
        }

        let agent = Agent::new(
            id,
            new.name,
            new.command,
            new.args,
            new.parent_id,
            new.memory_limit_bytes,
        );
        agents.insert(id, Arc::new(Mutex::new(agent)));
        Ok(id)
    }

    /// Shared handle to a record.
    pub async fn get(&self, id: AgentId) -> Option<AgentRecord> {
        self.agents.read().await.get(&id).cloned()
    }

    /// Run `f` with exclusive access to one record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub async fn with_agent<R>(&self, id: AgentId, f: impl FnOnce(&mut Agent) -> R) -> Result<R> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| AppError::agent_not_found(id))?;
        let mut agent = record.lock().await;
        Ok(f(&mut agent))
    }

    /// Copy of one record.
    pub async fn read(&self, id: AgentId) -> Option<Agent> {
        let record = self.get(id).await?;
        let agent = record.lock().await;
        Some(agent.clone())
    }

    /// Copies of every record, ordered by id, taken under one map read lock.
    pub async fn records(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut out = Vec::with_capacity(agents.len());
        for record in agents.values() {
            out.push(record.lock().await.clone());
        }
        out.sort_by_key(|agent| agent.id);
        out
    }

    /// Ids of agents that are not yet terminal.
    pub async fn live_ids(&self) -> Vec<AgentId> {
        self.records()
            .await
            .into_iter()
            .filter(Agent::is_live)
            .map(|agent| agent.id)
            .collect()
    }

    /// Number of agents in the table.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether the table holds no agents.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Remove kernel-rooted trees whose every member is terminal.
    ///
    /// Whole trees go at once, so no remaining record refers to a removed
    /// id. Removed ids are never handed out again.
    pub async fn prune(&self) -> Vec<AgentId> {
        let mut agents = self.agents.write().await;

        let mut snapshot: HashMap<AgentId, Agent> = HashMap::with_capacity(agents.len());
        for (id, record) in agents.iter() {
            snapshot.insert(*id, record.lock().await.clone());
        }

        let mut removed = Vec::new();
        let mut roots: Vec<AgentId> = snapshot
            .values()
            .filter(|agent| agent.parent_id.is_none())
            .map(|agent| agent.id)
            .collect();
        roots.sort_unstable();

        for root in roots {
            let tree = collect_tree(&snapshot, root);
            let all_terminal = tree
                .iter()
                .all(|id| snapshot.get(id).is_some_and(|agent| !agent.is_live()));
            if all_terminal {
                removed.extend(tree);
            }
        }

        for id in &removed {
            agents.remove(id);
        }
        removed.sort_unstable();
        if !removed.is_empty() {
            info!(count = removed.len(), "pruned terminal agent trees");
        }
        removed
    }
}

fn collect_tree(snapshot: &HashMap<AgentId, Agent>, root: AgentId) -> Vec<AgentId> {
    let mut tree = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        tree.push(id);
        if let Some(agent) = snapshot.get(&id) {
            stack.extend(agent.child_ids.iter().copied());
        }
    }
    tree
}
