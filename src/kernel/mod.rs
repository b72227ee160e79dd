//! Agent supervision: launching, lifecycle, accounting and the
//! command/query service built on top of them.

pub mod accountant;
pub mod aggregator;
pub mod cgroup;
pub mod launcher;
pub mod lifecycle;
pub mod service;
pub mod signal;
pub mod table;
pub mod watcher;

pub use service::{Kernel, SpawnRequest};
