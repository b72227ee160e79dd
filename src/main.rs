#![forbid(unsafe_code)]

//! `agent-kernel`: agent process supervisor daemon.
//!
//! Loads configuration, starts the metrics sampler and the IPC server, and
//! on SIGINT/SIGTERM kills every live agent before exiting.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_kernel::ipc::server::spawn_ipc_server;
use agent_kernel::{AppError, Kernel, KernelConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-kernel", about = "Agent process supervisor and metrics kernel", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the IPC socket name from the configuration.
    #[arg(long)]
    ipc_name: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-kernel bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => KernelConfig::load_from_path(path)?,
        None => KernelConfig::default(),
    };
    if let Some(name) = args.ipc_name {
        config.ipc_name = name;
        config.validate()?;
    }
    info!(ipc_name = %config.ipc_name, cgroups = config.cgroup.enabled, "configuration loaded");

    let kernel = Kernel::new(&config);
    let ct = CancellationToken::new();

    // ── Start metrics sampler ───────────────────────────
    let sampler_handle = config
        .metrics
        .sample_interval()
        .map(|interval| kernel.metrics().spawn_sampler(interval, ct.clone()));

    // ── Start IPC server ────────────────────────────────
    let ipc_handle = spawn_ipc_server(std::sync::Arc::clone(&kernel), &config.ipc_name, ct.clone())?;
    info!("agent kernel ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    kernel.shutdown(config.launch.shutdown_grace()).await;

    if let Err(err) = ipc_handle.await {
        error!(%err, "ipc server task failed");
    }
    if let Some(handle) = sampler_handle {
        if let Err(err) = handle.await {
            error!(%err, "metrics sampler task failed");
        }
    }
    info!("agent-kernel shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
