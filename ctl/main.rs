#![forbid(unsafe_code)]

//! `agent-kernel-ctl`: local CLI companion for `agent-kernel`.
//!
//! Connects to the IPC socket, sends one JSON command and prints the
//! response. Exits non-zero when the kernel reports an error.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "agent-kernel-ctl",
    about = "Local CLI for the agent-kernel supervisor",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the kernel's `ipc_name` config).
    #[arg(long, default_value = "agent-kernel")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch an agent program.
    Spawn {
        /// Agent label.
        #[arg(long)]
        name: String,
        /// Spawning agent id.
        #[arg(long)]
        parent: Option<u64>,
        /// Memory limit in bytes.
        #[arg(long)]
        memory_max: Option<u64>,
        /// Program path or name on PATH.
        program: String,
        /// Program arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Terminate an agent and its process group.
    Kill {
        /// Agent id.
        agent_id: u64,
    },

    /// Show metrics for every agent.
    List,

    /// Show metrics for one agent.
    Describe {
        /// Agent id.
        agent_id: u64,
    },

    /// Add LLM usage to an agent's counters.
    ReportUsage {
        /// Agent id.
        agent_id: u64,
        /// Requests to add.
        #[arg(long, default_value_t = 0)]
        requests: i64,
        /// Tokens to add.
        #[arg(long, default_value_t = 0)]
        tokens: i64,
    },

    /// Record a heartbeat for an agent.
    Heartbeat {
        /// Agent id.
        agent_id: u64,
    },

    /// Remove finished agent trees.
    Prune,

    /// Check that the kernel is up.
    Ping,
}

impl Command {
    fn to_request(&self) -> serde_json::Value {
        match self {
            Self::Spawn {
                name,
                parent,
                memory_max,
                program,
                args,
            } => serde_json::json!({
                "command": "spawn",
                "name": name,
                "program": program,
                "args": args,
                "parent_id": parent,
                "memory_max_bytes": memory_max,
            }),
            Self::Kill { agent_id } => serde_json::json!({ "command": "kill", "agent_id": agent_id }),
            Self::List => serde_json::json!({ "command": "list" }),
            Self::Describe { agent_id } => {
                serde_json::json!({ "command": "describe", "agent_id": agent_id })
            }
            Self::ReportUsage {
                agent_id,
                requests,
                tokens,
            } => serde_json::json!({
                "command": "report_llm_usage",
                "agent_id": agent_id,
                "requests_delta": requests,
                "tokens_delta": tokens,
            }),
            Self::Heartbeat { agent_id } => {
                serde_json::json!({ "command": "heartbeat", "agent_id": agent_id })
            }
            Self::Prune => serde_json::json!({ "command": "prune" }),
            Self::Ping => serde_json::json!({ "command": "ping" }),
        }
    }
}

fn main() {
    let args = Cli::parse();
    let request_json = args.command.to_request();

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let kind = obj
                        .get("kind")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("error");
                    let err_msg = obj
                        .get("error")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown error");
                    match obj.get("reason").and_then(serde_json::Value::as_str) {
                        Some(reason) => eprintln!("Error ({kind}/{reason}): {err_msg}"),
                        None => eprintln!("Error ({kind}): {err_msg}"),
                    }
                    if let Some(agent_id) = obj.get("agent_id").and_then(serde_json::Value::as_u64) {
                        eprintln!("Agent {agent_id} recorded as failed");
                    }
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to kernel: {err}");
            eprintln!("Is agent-kernel running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
