//! bastion-core — wire format, cryptographic primitives, configuration,
//! and the protocol error taxonomy. All other Bastion crates depend on
//! this one.

pub mod config;
pub mod crypto;
pub mod error;
pub mod wire;

pub use error::ProtocolError;
pub use wire::{Envelope, MessageCode};
