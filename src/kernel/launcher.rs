//! Process launcher.
//!
//! Starts agent programs with:
//! - their own process group, so a kill reaches everything the agent forks;
//! - `env_clear()` plus an allowlist, with the kernel's callback variables
//!   injected explicitly;
//! - resource limits in place before the program runs: when the agent has a
//!   cgroup, a `/bin/sh` trampoline moves itself into the cgroup and then
//!   `exec`s the program, so the program never executes unconfined;
//! - stdout/stderr forwarded line by line into the kernel log.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{info, warn};

use super::cgroup::{self, CgroupManager};
use crate::config::LaunchConfig;
use crate::errors::LaunchError;
use crate::models::agent::{AgentId, LaunchErrorKind};

/// Environment variables inherited by every agent.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM", "TMPDIR", "RUST_LOG"];

/// Agent id exported to the agent.
pub const ENV_AGENT_ID: &str = "AGENT_KERNEL_AGENT_ID";
/// Parent agent id exported to the agent, when it has one.
pub const ENV_PARENT_ID: &str = "AGENT_KERNEL_PARENT_ID";
/// Socket name the agent uses to call back into the kernel.
pub const ENV_IPC_NAME: &str = "AGENT_KERNEL_IPC_NAME";

/// Joins the cgroup named by `$1`, then becomes the agent program.
const TRAMPOLINE: &str = r#"echo $$ > "$1" || exit 125; shift; exec "$@""#;
const TRAMPOLINE_SHELL: &str = "/bin/sh";

/// Longest agent output line forwarded to the log.
const MAX_OUTPUT_LINE: usize = 16 * 1024;

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    /// Agent the process belongs to.
    pub agent_id: AgentId,
    /// Spawning agent, exported as environment.
    pub parent_id: Option<AgentId>,
    /// Resolved program path.
    pub program: &'a Path,
    /// Program arguments.
    pub args: &'a [String],
    /// Memory limit for the agent's cgroup.
    pub memory_max_bytes: Option<u64>,
}

/// A started agent process.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// OS process id (also the process group id).
    pub pid: u32,
    /// Child handle; dropping it kills the process.
    pub child: Child,
    /// Cgroup the process joins.
    pub cgroup: Option<PathBuf>,
    /// Whether the process started through the cgroup trampoline.
    pub trampoline: bool,
}

/// Starts agent programs.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: LaunchConfig,
    cgroups: CgroupManager,
    ipc_name: String,
}

impl ProcessLauncher {
    /// Launcher using the given settings.
    #[must_use]
    pub fn new(config: LaunchConfig, cgroups: CgroupManager, ipc_name: String) -> Self {
        Self {
            config,
            cgroups,
            ipc_name,
        }
    }

    /// Resolve `program` to a path.
    ///
    /// Names containing a `/` are taken as paths and checked at launch time.
    /// Bare names are looked up on the kernel's `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `LaunchErrorKind::NotFound` if a bare name is not on `PATH`.
    pub fn resolve_program(&self, program: &str) -> Result<PathBuf, LaunchError> {
        self.resolve_program_in(program, std::env::var_os("PATH"))
    }

    /// Resolve `program` against an explicit search path.
    ///
    /// Only executable files match, so a non-executable entry earlier on the
    /// search path does not shadow a later executable one.
    ///
    /// # Errors
    ///
    /// Returns `LaunchErrorKind::NotFound` if no executable `program` is on
    /// `search_path`.
    pub fn resolve_program_in(
        &self,
        program: &str,
        search_path: Option<OsString>,
    ) -> Result<PathBuf, LaunchError> {
        if program.contains('/') {
            return Ok(PathBuf::from(program));
        }
        let cwd = self
            .config
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        which::which_in(program, search_path, cwd).map_err(|err| {
            LaunchError::new(
                LaunchErrorKind::NotFound,
                format!("program '{program}' not found on PATH: {err}"),
            )
        })
    }

    /// Path the OS will exec for `program`.
    ///
    /// Relative paths are anchored at the agent's working directory, since
    /// that is where the exec resolves them.
    #[must_use]
    pub fn exec_path(&self, program: &Path) -> PathBuf {
        match self.config.working_dir {
            Some(ref dir) if program.is_relative() => dir.join(program),
            _ => program.to_path_buf(),
        }
    }

    /// Launch an agent program.
    ///
    /// # Errors
    ///
    /// - `exec_failed`: the program path does not exist or the OS refused it.
    /// - `permission_denied`: the program is not executable.
    /// - `resource_limit_rejected`: the memory limit could not be applied.
    pub async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<LaunchedProcess, LaunchError> {
        let program = self.exec_path(spec.program);
        check_executable(&program)?;

        let scope = self
            .cgroups
            .create_scope(spec.agent_id, spec.memory_max_bytes)
            .await?;

        let mut cmd = match scope {
            Some(ref scope) => trampoline_command(&cgroup::procs_path(scope), &program, spec.args),
            None => {
                let mut cmd = std::process::Command::new(&program);
                cmd.args(spec.args);
                cmd
            }
        };

        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        cmd.env_clear();
        for key in ALLOWED_ENV_VARS
            .iter()
            .copied()
            .chain(self.config.env_allowlist.iter().map(String::as_str))
        {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(ENV_AGENT_ID, spec.agent_id.to_string())
            .env(ENV_IPC_NAME, &self.ipc_name);
        if let Some(parent_id) = spec.parent_id {
            cmd.env(ENV_PARENT_ID, parent_id.to_string());
        }

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                if let Some(ref scope) = scope {
                    cgroup::remove_scope(scope).await;
                }
                return Err(classify_spawn_error(&err, &program));
            }
        };

        let Some(pid) = child.id() else {
            if let Some(ref scope) = scope {
                cgroup::remove_scope(scope).await;
            }
            return Err(LaunchError::new(
                LaunchErrorKind::ExecFailed,
                "process exited before its pid could be read",
            ));
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(spec.agent_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(spec.agent_id, "stderr", stderr));
        }

        info!(
            agent_id = spec.agent_id,
            pid,
            program = %program.display(),
            cgroup = ?scope,
            "agent process launched"
        );

        Ok(LaunchedProcess {
            pid,
            child,
            trampoline: scope.is_some(),
            cgroup: scope,
        })
    }
}

/// Command that joins the cgroup behind `procs`, then execs `program`.
///
/// Exits 125 without running `program` when the cgroup cannot be joined.
#[must_use]
pub fn trampoline_command(procs: &Path, program: &Path, args: &[String]) -> std::process::Command {
    let mut cmd = std::process::Command::new(TRAMPOLINE_SHELL);
    cmd.arg("-c")
        .arg(TRAMPOLINE)
        .arg("agent-kernel-trampoline")
        .arg(procs)
        .arg(program)
        .args(args);
    cmd
}

fn check_executable(program: &Path) -> Result<(), LaunchError> {
    let metadata = std::fs::metadata(program).map_err(|err| {
        LaunchError::new(
            LaunchErrorKind::ExecFailed,
            format!("cannot exec '{}': {err}", program.display()),
        )
    })?;

    if !metadata.is_file() {
        return Err(LaunchError::new(
            LaunchErrorKind::PermissionDenied,
            format!("'{}' is not a regular file", program.display()),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::new(
                LaunchErrorKind::PermissionDenied,
                format!("'{}' is not executable", program.display()),
            ));
        }
    }

    Ok(())
}

fn classify_spawn_error(err: &std::io::Error, program: &Path) -> LaunchError {
    let reason = match err.kind() {
        std::io::ErrorKind::PermissionDenied => LaunchErrorKind::PermissionDenied,
        _ => LaunchErrorKind::ExecFailed,
    };
    LaunchError::new(
        reason,
        format!("failed to spawn '{}': {err}", program.display()),
    )
}

/// Forward an agent output stream into the log, one event per line.
async fn forward_output<R>(agent_id: AgentId, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_OUTPUT_LINE));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => info!(target: "agent_output", agent_id, stream, "{line}"),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(agent_id, stream, "agent output line truncated");
            }
            Err(LinesCodecError::Io(err)) => {
                warn!(agent_id, stream, %err, "agent output stream error");
                break;
            }
        }
    }
}
