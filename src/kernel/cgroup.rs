//! Per-agent control groups (cgroup v2, direct writes).
//!
//! Layout:
//!
//! ```text
//! <root>/                        # e.g. /sys/fs/cgroup/agent-kernel
//! +-- cgroup.controllers         # present only on a cgroup v2 hierarchy
//! +-- agent-<kernel pid>-<id>/
//!     +-- cgroup.procs           # written by the launch trampoline
//!     +-- memory.max             # created by the kernel, written before the program runs
//!     +-- memory.current         # read by the resource accountant
//! ```
//!
//! Scope names carry the kernel's pid so directories left behind by an
//! earlier kernel never collide with this run's agent ids.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::CgroupConfig;
use crate::errors::LaunchError;
use crate::models::agent::{AgentId, LaunchErrorKind};

/// Creates and removes agent cgroups under a configured root.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    enabled: bool,
    root: PathBuf,
    instance: u32,
}

impl CgroupManager {
    /// Manager for the configured hierarchy.
    #[must_use]
    pub fn new(config: &CgroupConfig) -> Self {
        Self {
            enabled: config.enabled,
            root: config.root.clone(),
            instance: std::process::id(),
        }
    }

    /// Manager that never creates cgroups.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            root: PathBuf::new(),
            instance: std::process::id(),
        }
    }

    /// Directory that would hold the given agent's cgroup.
    #[must_use]
    pub fn scope_path(&self, agent_id: AgentId) -> PathBuf {
        self.root.join(format!("agent-{}-{agent_id}", self.instance))
    }

    /// Create the agent's cgroup and apply `memory_max`.
    ///
    /// Returns `Ok(None)` when cgroups are disabled or unavailable and no
    /// limit was requested; the agent then runs unconfined. A limit only
    /// counts as applied when the kernel-provided `memory.max` accepted it.
    ///
    /// # Errors
    ///
    /// Returns `LaunchErrorKind::ResourceLimitRejected` when a limit was
    /// requested but could not be put in place.
    pub async fn create_scope(
        &self,
        agent_id: AgentId,
        memory_max: Option<u64>,
    ) -> Result<Option<PathBuf>, LaunchError> {
        if !self.enabled {
            return unconfined(agent_id, memory_max, "cgroups are disabled");
        }
        if !is_cgroup2_hierarchy(&self.root) {
            return unconfined(
                agent_id,
                memory_max,
                &format!("'{}' is not on a cgroup v2 hierarchy", self.root.display()),
            );
        }

        let scope = self.scope_path(agent_id);
        if let Err(err) = self.create_dir(&scope).await {
            return unconfined(
                agent_id,
                memory_max,
                &format!("cannot create '{}': {err}", scope.display()),
            );
        }

        if let Some(limit) = memory_max {
            if let Err(err) = write_existing(&scope.join("memory.max"), limit).await {
                remove_scope(&scope).await;
                return Err(LaunchError::new(
                    LaunchErrorKind::ResourceLimitRejected,
                    format!("cannot apply memory limit: {err}"),
                ));
            }
        }

        debug!(agent_id, cgroup = %scope.display(), "agent cgroup created");
        Ok(Some(scope))
    }

    async fn create_dir(&self, scope: &Path) -> std::io::Result<()> {
        if !self.root.exists() {
            tokio::fs::create_dir_all(&self.root).await?;
        }
        enable_memory_controller(&self.root).await;
        tokio::fs::create_dir(scope).await
    }
}

fn unconfined(
    agent_id: AgentId,
    memory_max: Option<u64>,
    why: &str,
) -> Result<Option<PathBuf>, LaunchError> {
    match memory_max {
        Some(_) => Err(LaunchError::new(
            LaunchErrorKind::ResourceLimitRejected,
            format!("memory limit requested but {why}"),
        )),
        None => {
            warn!(agent_id, reason = why, "cgroup unavailable, running agent unconfined");
            Ok(None)
        }
    }
}

/// Whether `root` lives on a cgroup v2 hierarchy.
///
/// A missing root is judged by its parent, where it would be created.
#[must_use]
pub fn is_cgroup2_hierarchy(root: &Path) -> bool {
    let anchor = if root.exists() {
        Some(root)
    } else {
        root.parent()
    };
    anchor.is_some_and(|dir| dir.join("cgroup.controllers").is_file())
}

/// Write `value` into an interface file the kernel already created.
async fn write_existing(path: &Path, value: u64) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.write_all(format!("{value}\n").as_bytes()).await?;
    file.flush().await
}

/// `cgroup.procs` inside a scope.
#[must_use]
pub fn procs_path(scope: &Path) -> PathBuf {
    scope.join("cgroup.procs")
}

/// Best-effort removal of an emptied scope.
pub async fn remove_scope(scope: &Path) {
    if let Err(err) = tokio::fs::remove_dir(scope).await {
        debug!(cgroup = %scope.display(), %err, "cgroup not removed");
    }
}

async fn enable_memory_controller(root: &Path) {
    let subtree_control = root.join("cgroup.subtree_control");
    if subtree_control.exists() {
        // Fails harmlessly when the controller is already on or unavailable.
        let _ = tokio::fs::write(&subtree_control, "+memory").await;
    }
}
