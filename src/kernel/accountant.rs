//! Resource accountant: resident memory per agent.
//!
//! Reads `memory.current` from the agent's cgroup when it has one, and
//! falls back to summing `VmRSS` over the agent's process group in `/proc`
//! otherwise. Agents lead their own group, so the group id is the agent pid.
//! Every read, including the whole `/proc` scan, is bounded by a timeout; a
//! missing entry, a parse failure or a timeout all yield `None`, which
//! callers treat as "keep the last known value".

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

const PROC_ROOT: &str = "/proc";

/// Bounded memory sampler.
#[derive(Debug, Clone)]
pub struct ResourceAccountant {
    timeout: Duration,
    proc_root: PathBuf,
}

impl ResourceAccountant {
    /// Sampler reading the host's `/proc`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_proc_root(timeout, PROC_ROOT)
    }

    /// Sampler reading an alternate proc tree.
    #[must_use]
    pub fn with_proc_root(timeout: Duration, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            timeout,
            proc_root: proc_root.into(),
        }
    }

    /// Current resident memory in bytes, or `None` when unavailable.
    pub async fn sample(&self, pid: Option<u32>, cgroup: Option<&Path>) -> Option<u64> {
        let read = async {
            if let Some(cgroup) = cgroup {
                if let Some(bytes) = read_memory_current(cgroup).await {
                    return Some(bytes);
                }
            }
            let pid = pid?;
            match read_group_rss(&self.proc_root, pid).await {
                Some(bytes) => Some(bytes),
                None => read_vm_rss(&self.proc_root.join(pid.to_string()).join("status")).await,
            }
        };

        if let Ok(value) = tokio::time::timeout(self.timeout, read).await {
            value
        } else {
            debug!(?pid, "memory sample timed out");
            None
        }
    }
}

async fn read_memory_current(cgroup: &Path) -> Option<u64> {
    let raw = tokio::fs::read_to_string(cgroup.join("memory.current"))
        .await
        .ok()?;
    raw.trim().parse().ok()
}

/// Sum of `VmRSS` over every process whose group id is `pgid`.
async fn read_group_rss(proc_root: &Path, pgid: u32) -> Option<u64> {
    let mut entries = tokio::fs::read_dir(proc_root).await.ok()?;
    let mut total: Option<u64> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.parse::<u32>().is_ok());
        if !is_pid {
            continue;
        }
        let dir = entry.path();
        let Ok(stat) = tokio::fs::read_to_string(dir.join("stat")).await else {
            continue;
        };
        if parse_stat_pgrp(&stat) != Some(pgid) {
            continue;
        }
        // Zombies have no VmRSS and count as nothing.
        if let Some(rss) = read_vm_rss(&dir.join("status")).await {
            total = Some(total.unwrap_or(0).saturating_add(rss));
        }
    }
    total
}

/// Extract the process group id from a `/proc/<pid>/stat` line.
///
/// The command name may hold spaces and parentheses, so fields are counted
/// from the last `)`.
#[must_use]
pub fn parse_stat_pgrp(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // state, ppid, pgrp
    rest.split_whitespace().nth(2)?.parse().ok()
}

async fn read_vm_rss(status_path: &Path) -> Option<u64> {
    let raw = tokio::fs::read_to_string(status_path).await.ok()?;
    parse_vm_rss(&raw)
}

/// Extract `VmRSS` (reported in kB) from a `/proc/<pid>/status` body.
#[must_use]
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value.saturating_mul(1024)),
        Some(_) => None,
    }
}
