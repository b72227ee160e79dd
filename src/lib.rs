#![forbid(unsafe_code)]

//! Agent process supervisor and metrics kernel.
//!
//! Launches agent programs as isolated process groups, tracks their
//! lifecycle and parent/child hierarchy, accounts memory and LLM usage per
//! agent, and serves commands and queries over a local socket.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod kernel;
pub mod models;

pub use config::KernelConfig;
pub use errors::{AppError, Result};
pub use kernel::{Kernel, SpawnRequest};
