//! bastiond — the Bastion file-sharing daemon.
//!
//! Library surface so integration tests can start a real server in-process;
//! the binary in `main.rs` is a thin wrapper.

pub mod connection;
pub mod handshake;
pub mod relay;
pub mod server;
pub mod transfer;

pub use server::{Server, ServerHandle, ServerState};
