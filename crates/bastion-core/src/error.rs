//! Protocol error taxonomy.
//!
//! One enum covers every failure class the server reports or acts on.
//! The propagation policy lives with the connection worker: handshake
//! failures tear the connection down, per-chunk integrity failures abort
//! only the transfer, and a forged relay reply is fatal for the owner's
//! connection but never the requester's.

use std::path::PathBuf;

/// Every failure class the protocol distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Bytes on the wire are not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    Framing(String),

    /// Authentication failed: bad challenge signature, missed deadline.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Username already has a live authenticated session.
    #[error("{0} is already connected")]
    DuplicateSession(String),

    /// No public key on file for the claimed username.
    #[error("no public key on file for {0}")]
    UnknownUser(String),

    /// Post-handshake integrity tag mismatch.
    #[error("integrity tag mismatch")]
    Integrity,

    /// Requested file absent from the store.
    #[error("no such file: {0}")]
    NotFound(String),

    /// I/O failure reading or writing stored file content.
    #[error("storage failure on {path}: {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Socket-level I/O failure.
    #[error("connection i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// An RSA operation failed (key wrapping, malformed key material).
    #[error("crypto operation failed: {0}")]
    Crypto(String),
}

impl ProtocolError {
    /// Failures that end the connection during the handshake phase.
    pub fn is_handshake_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Auth(_)
                | ProtocolError::DuplicateSession(_)
                | ProtocolError::UnknownUser(_)
        )
    }
}
