//! Kernel configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_ipc_name() -> String {
    "agent-kernel".into()
}

fn default_startup_grace_ms() -> u64 {
    250
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/agent-kernel")
}

fn default_sample_interval_seconds() -> u64 {
    5
}

fn default_sample_timeout_ms() -> u64 {
    200
}

/// How agent programs are launched.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchConfig {
    /// Time a new process must stay alive before it counts as `running`.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Working directory for agents; inherits the kernel's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables passed through to agents.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Memory limit applied when a spawn request does not carry one.
    #[serde(default)]
    pub default_memory_max_bytes: Option<u64>,
    /// How long shutdown waits for killed agents before giving up.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: default_startup_grace_ms(),
            working_dir: None,
            env_allowlist: Vec::new(),
            default_memory_max_bytes: None,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl LaunchConfig {
    /// Startup grace as a [`Duration`].
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Shutdown grace as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Control-group placement of agent process groups.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CgroupConfig {
    /// Whether the kernel creates a cgroup per agent.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Parent directory for per-agent cgroups (cgroup v2 hierarchy).
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_cgroup_root(),
        }
    }
}

/// Memory sampling behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MetricsConfig {
    /// Background sampling period; 0 disables the sampler.
    #[serde(default = "default_sample_interval_seconds")]
    pub sample_interval_seconds: u64,
    /// Upper bound on a single accounting read.
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_seconds: default_sample_interval_seconds(),
            sample_timeout_ms: default_sample_timeout_ms(),
        }
    }
}

impl MetricsConfig {
    /// Sampler period, or `None` when disabled.
    #[must_use]
    pub fn sample_interval(&self) -> Option<Duration> {
        (self.sample_interval_seconds > 0).then(|| Duration::from_secs(self.sample_interval_seconds))
    }

    /// Accounting read timeout.
    #[must_use]
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

/// Kernel configuration parsed from `agent-kernel.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct KernelConfig {
    /// Local socket name for the command/query channel.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Launch settings.
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Cgroup settings.
    #[serde(default)]
    pub cgroup: CgroupConfig,
    /// Sampling settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ipc_name: default_ipc_name(),
            launch: LaunchConfig::default(),
            cgroup: CgroupConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants and canonicalize the working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated rule.
    pub fn validate(&mut self) -> Result<()> {
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        if self.metrics.sample_timeout_ms == 0 {
            return Err(AppError::Config(
                "metrics.sample_timeout_ms must be greater than zero".into(),
            ));
        }

        if let Some(ref dir) = self.launch.working_dir {
            let canonical = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("launch.working_dir invalid: {err}")))?;
            self.launch.working_dir = Some(canonical);
        }

        Ok(())
    }
}
