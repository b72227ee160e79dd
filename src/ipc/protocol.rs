//! Wire protocol for the command/query channel.
//!
//! One JSON object per line in each direction.
//!
//! ## Requests
//!
//! ```json
//! {"command": "spawn", "name": "a", "program": "/usr/bin/python3", "args": ["x.py"]}
//! {"command": "kill", "agent_id": 1}
//! {"command": "list"}
//! {"command": "describe", "agent_id": 1}
//! {"command": "report_llm_usage", "agent_id": 1, "requests_delta": 3, "tokens_delta": 150}
//! {"command": "heartbeat", "agent_id": 1}
//! {"command": "prune"}
//! {"command": "ping"}
//! ```
//!
//! ## Responses
//!
//! ```json
//! {"ok": true, "data": { ... }}
//! {"ok": false, "kind": "not_found", "error": "agent 9 not found"}
//! {"ok": false, "kind": "launch_error", "reason": "exec_failed", "agent_id": 4, "error": "..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::LaunchError;
use crate::kernel::SpawnRequest;
use crate::models::agent::{AgentId, LaunchErrorKind};
use crate::AppError;

/// Error kind for lines that are not a valid request.
pub const KIND_BAD_REQUEST: &str = "bad_request";

/// Inbound request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Launch a new agent.
    Spawn(SpawnRequest),
    /// Terminate an agent.
    Kill {
        /// Target agent.
        agent_id: AgentId,
    },
    /// Metrics for every agent.
    List,
    /// Metrics for one agent.
    Describe {
        /// Target agent.
        agent_id: AgentId,
    },
    /// Add LLM usage to an agent's counters.
    ReportLlmUsage {
        /// Target agent.
        agent_id: AgentId,
        /// Requests to add.
        requests_delta: i64,
        /// Tokens to add.
        tokens_delta: i64,
    },
    /// Liveness signal from an agent.
    Heartbeat {
        /// Reporting agent.
        agent_id: AgentId,
    },
    /// Remove finished agent trees.
    Prune,
    /// Kernel liveness.
    Ping,
}

impl IpcRequest {
    /// Command verb, for logging.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Kill { .. } => "kill",
            Self::List => "list",
            Self::Describe { .. } => "describe",
            Self::ReportLlmUsage { .. } => "report_llm_usage",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Prune => "prune",
            Self::Ping => "ping",
        }
    }
}

/// Outbound response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error class on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Launch failure classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<LaunchErrorKind>,
    /// Agent allocated before a launch failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

impl IpcResponse {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn success(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                ok: true,
                data: Some(data),
                kind: None,
                error: None,
                reason: None,
                agent_id: None,
            },
            Err(err) => Self::error("internal", format!("failed to encode response: {err}")),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            kind: Some(kind.into()),
            error: Some(message.into()),
            reason: None,
            agent_id: None,
        }
    }

    /// Failed response for an unparseable request line.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(KIND_BAD_REQUEST, message)
    }

    /// Convert back into a kernel result on the client side.
    ///
    /// # Errors
    ///
    /// Maps `ok: false` responses onto the matching `AppError` variant;
    /// unknown kinds become `AppError::Ipc`.
    pub fn into_result(self) -> crate::Result<Value> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_default();
        Err(match self.kind.as_deref() {
            Some("not_found") => AppError::NotFound(message),
            Some("already_terminal") => AppError::AlreadyTerminal(message),
            Some("invalid_argument") => AppError::InvalidArgument(message),
            Some("launch_error") => AppError::Launch(LaunchError {
                reason: self.reason.unwrap_or(LaunchErrorKind::ExecFailed),
                agent_id: self.agent_id,
                message,
            }),
            Some(kind) => AppError::Ipc(format!("{kind}: {message}")),
            None => AppError::Ipc(message),
        })
    }
}

impl From<&AppError> for IpcResponse {
    fn from(err: &AppError) -> Self {
        let message = match err {
            AppError::NotFound(msg) | AppError::AlreadyTerminal(msg) | AppError::InvalidArgument(msg) => {
                msg.clone()
            }
            AppError::Launch(launch) => launch.message.clone(),
            other => other.to_string(),
        };
        let mut response = Self::error(err.kind(), message);
        if let AppError::Launch(launch) = err {
            response.reason = Some(launch.reason);
            response.agent_id = launch.agent_id;
        }
        response
    }
}

impl<T: Serialize> From<crate::Result<T>> for IpcResponse {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::from(&err),
        }
    }
}
