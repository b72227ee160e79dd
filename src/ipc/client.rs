//! Async client for the command/query channel.
//!
//! Used by agents that want to call back into the kernel (spawn children,
//! report usage, heartbeat) and by the integration tests.

use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericNamespaced;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::codec::Framed;

use super::codec::IpcCodec;
use super::protocol::{IpcRequest, IpcResponse};
use crate::kernel::SpawnRequest;
use crate::models::agent::AgentId;
use crate::models::metrics::{AgentMetrics, KernelStatus, LlmUsage, Snapshot};
use crate::{AppError, Result};

#[derive(Deserialize)]
struct AgentIdPayload {
    agent_id: AgentId,
}

#[derive(Deserialize)]
struct KillPayload {
    outcome: String,
}

#[derive(Deserialize)]
struct PrunePayload {
    removed: Vec<AgentId>,
}

/// One connection to a running kernel.
pub struct KernelClient {
    framed: Framed<Stream, IpcCodec>,
}

impl KernelClient {
    /// Connect to the kernel listening on `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the name is invalid or nothing listens.
    pub async fn connect(name: &str) -> Result<Self> {
        let ns_name = name
            .to_owned()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;
        let stream = Stream::connect(ns_name)
            .await
            .map_err(|err| AppError::Ipc(format!("failed to connect to '{name}': {err}")))?;
        Ok(Self {
            framed: Framed::new(stream, IpcCodec::new()),
        })
    }

    /// Send one request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on transport failures or a closed connection.
    pub async fn request(&mut self, request: &IpcRequest) -> Result<IpcResponse> {
        let line = serde_json::to_string(request)
            .map_err(|err| AppError::Ipc(format!("failed to encode request: {err}")))?;
        self.framed.send(line).await?;
        let reply = self
            .framed
            .next()
            .await
            .ok_or_else(|| AppError::Ipc("connection closed by kernel".into()))??;
        serde_json::from_str(&reply)
            .map_err(|err| AppError::Ipc(format!("invalid response: {err}")))
    }

    async fn call<T: DeserializeOwned>(&mut self, request: &IpcRequest) -> Result<T> {
        let data = self.request(request).await?.into_result()?;
        serde_json::from_value(data)
            .map_err(|err| AppError::Ipc(format!("unexpected response payload: {err}")))
    }

    /// Launch an agent.
    ///
    /// # Errors
    ///
    /// Returns the kernel's error, e.g. `AppError::Launch`.
    pub async fn spawn(&mut self, request: SpawnRequest) -> Result<AgentId> {
        let payload: AgentIdPayload = self.call(&IpcRequest::Spawn(request)).await?;
        Ok(payload.agent_id)
    }

    /// Kill an agent; returns the outcome name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::AlreadyTerminal`.
    pub async fn kill(&mut self, agent_id: AgentId) -> Result<String> {
        let payload: KillPayload = self.call(&IpcRequest::Kill { agent_id }).await?;
        Ok(payload.outcome)
    }

    /// Metrics for every agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on transport failures.
    pub async fn list(&mut self) -> Result<Snapshot> {
        self.call(&IpcRequest::List).await
    }

    /// Metrics for one agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub async fn describe(&mut self, agent_id: AgentId) -> Result<AgentMetrics> {
        self.call(&IpcRequest::Describe { agent_id }).await
    }

    /// Report LLM usage.
    ///
    /// # Errors
    ///
    /// Returns the kernel's validation error.
    pub async fn report_llm_usage(
        &mut self,
        agent_id: AgentId,
        requests_delta: i64,
        tokens_delta: i64,
    ) -> Result<LlmUsage> {
        self.call(&IpcRequest::ReportLlmUsage {
            agent_id,
            requests_delta,
            tokens_delta,
        })
        .await
    }

    /// Send a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::AlreadyTerminal`.
    pub async fn heartbeat(&mut self, agent_id: AgentId) -> Result<()> {
        let _: AgentIdPayload = self.call(&IpcRequest::Heartbeat { agent_id }).await?;
        Ok(())
    }

    /// Prune finished agent trees; returns the removed ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on transport failures.
    pub async fn prune(&mut self) -> Result<Vec<AgentId>> {
        let payload: PrunePayload = self.call(&IpcRequest::Prune).await?;
        Ok(payload.removed)
    }

    /// Kernel liveness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on transport failures.
    pub async fn ping(&mut self) -> Result<KernelStatus> {
        self.call(&IpcRequest::Ping).await
    }
}
