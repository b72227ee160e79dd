//! Local command/query channel.
//!
//! A named pipe (Windows) or Unix domain socket (Linux/macOS) carrying
//! newline-delimited JSON between the kernel and its clients.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;
