//! Error types shared across the kernel.

use std::fmt::{Display, Formatter};

use crate::models::agent::{AgentId, LaunchErrorKind};

/// Shared kernel result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// A failure to start an agent program.
///
/// `agent_id` is populated when the failure happened after an id was
/// allocated; such agents are recorded as `failed` in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchError {
    /// Failure classification.
    pub reason: LaunchErrorKind,
    /// Agent that was allocated for the launch, if any.
    pub agent_id: Option<AgentId>,
    /// Human-readable detail.
    pub message: String,
}

impl LaunchError {
    /// Build a launch error that has not been attributed to an agent yet.
    #[must_use]
    pub fn new(reason: LaunchErrorKind, message: impl Into<String>) -> Self {
        Self {
            reason,
            agent_id: None,
            message: message.into(),
        }
    }

    /// Attach the allocated agent id.
    #[must_use]
    pub fn for_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Kernel error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Agent program could not be started.
    Launch(LaunchError),
    /// Requested agent does not exist.
    NotFound(String),
    /// Agent already reached `stopped` or `failed`.
    AlreadyTerminal(String),
    /// Request carried a value the kernel refuses (e.g. a negative delta).
    InvalidArgument(String),
}

impl AppError {
    /// Stable wire identifier for this error class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Launch(_) => "launch_error",
            Self::Config(_) | Self::Ipc(_) | Self::Io(_) => "internal",
        }
    }

    /// Shorthand for an unknown agent id.
    #[must_use]
    pub fn agent_not_found(agent_id: AgentId) -> Self {
        Self::NotFound(format!("agent {agent_id} not found"))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Launch(err) => write!(f, "launch failed: {err}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyTerminal(msg) => write!(f, "already terminal: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<LaunchError> for AppError {
    fn from(err: LaunchError) -> Self {
        Self::Launch(err)
    }
}
