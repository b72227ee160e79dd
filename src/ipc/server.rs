//! Local socket server for the command/query channel.
//!
//! Listens on an abstract-namespace Unix socket (Linux) or named pipe
//! (Windows) via `interprocess`, accepts line-delimited JSON requests and
//! routes each one to the [`Kernel`]. A malformed line gets a
//! `bad_request` response; an I/O error closes only that connection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::IpcCodec;
use super::protocol::{IpcRequest, IpcResponse};
use crate::kernel::Kernel;
use crate::{AppError, Result};

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    kernel: Arc<Kernel>,
    name: &str,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let kernel = Arc::clone(&kernel);
                                tokio::spawn(handle_connection(stream, kernel, ct.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Serve one client until EOF, an I/O error or shutdown.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    kernel: Arc<Kernel>,
    ct: CancellationToken,
) {
    let span = info_span!("ipc_conn");
    async move {
        let mut framed = Framed::new(stream, IpcCodec::new());

        loop {
            let next = tokio::select! {
                () = ct.cancelled() => break,
                next = framed.next() => next,
            };

            let response = match next {
                None => break,
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch(&kernel, request).await,
                        Err(err) => IpcResponse::bad_request(format!("invalid request: {err}")),
                    }
                }
                Some(Err(AppError::Ipc(msg))) => IpcResponse::bad_request(msg),
                Some(Err(err)) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            };

            let line = serde_json::to_string(&response).unwrap_or_else(|_| {
                r#"{"ok":false,"kind":"internal","error":"serialization failed"}"#.to_owned()
            });
            if let Err(err) = framed.send(line).await {
                warn!(%err, "failed to write ipc response");
                break;
            }
        }

        debug!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route one request to the kernel.
pub async fn dispatch(kernel: &Kernel, request: IpcRequest) -> IpcResponse {
    let span = info_span!("ipc_command", command = request.verb());
    async move {
        match request {
            IpcRequest::Spawn(spawn) => IpcResponse::from(
                kernel
                    .spawn(spawn)
                    .await
                    .map(|agent_id| serde_json::json!({ "agent_id": agent_id })),
            ),
            IpcRequest::Kill { agent_id } => IpcResponse::from(kernel.kill(agent_id).await.map(
                |outcome| serde_json::json!({ "agent_id": agent_id, "outcome": outcome.as_str() }),
            )),
            IpcRequest::List => IpcResponse::success(kernel.list().await),
            IpcRequest::Describe { agent_id } => IpcResponse::from(kernel.describe(agent_id).await),
            IpcRequest::ReportLlmUsage {
                agent_id,
                requests_delta,
                tokens_delta,
            } => IpcResponse::from(
                kernel
                    .report_llm_usage(agent_id, requests_delta, tokens_delta)
                    .await,
            ),
            IpcRequest::Heartbeat { agent_id } => IpcResponse::from(
                kernel
                    .heartbeat(agent_id)
                    .await
                    .map(|()| serde_json::json!({ "agent_id": agent_id })),
            ),
            IpcRequest::Prune => {
                IpcResponse::success(serde_json::json!({ "removed": kernel.prune().await }))
            }
            IpcRequest::Ping => IpcResponse::success(kernel.ping().await),
        }
    }
    .instrument(span)
    .await
}
