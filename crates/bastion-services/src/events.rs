//! Server event stream.
//!
//! The connection workers report everything observable through an
//! [`EventSink`] instead of logging directly, so a frontend (or a test)
//! can watch the server without touching its internals. The default sink
//! forwards to `tracing`.

use std::net::SocketAddr;

use tracing::{info, warn};

/// Everything the server announces about its own behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started { addr: SocketAddr },
    Stopped,
    Connected { peer: SocketAddr },
    Authenticated { username: String },
    AuthFailed { username: String, reason: String },
    Disconnected { username: String },
    UploadChunk { username: String, filename: String, bytes: usize },
    UploadComplete { username: String, filename: String },
    UploadRejected { username: String, filename: String },
    DownloadServed { username: String, filename: String },
    DownloadRefused { username: String, filename: String },
    RelayForwarded { requester: String, owner: String, filename: String },
    RelayApproved { requester: String, owner: String, filename: String },
    RelayRejected { requester: String, owner: String },
    RelayForged { owner: String },
    IntegrityFailure { username: String },
}

impl std::fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started { addr } => write!(f, "server listening on {addr}"),
            Self::Stopped => write!(f, "server stopped"),
            Self::Connected { peer } => write!(f, "connection from {peer}"),
            Self::Authenticated { username } => write!(f, "{username} authenticated"),
            Self::AuthFailed { username, reason } => {
                write!(f, "authentication failed for {username}: {reason}")
            }
            Self::Disconnected { username } => write!(f, "{username} disconnected"),
            Self::UploadChunk { username, filename, bytes } => {
                write!(f, "{username} uploaded {bytes} bytes of {filename}")
            }
            Self::UploadComplete { username, filename } => {
                write!(f, "{username} finished uploading {filename}")
            }
            Self::UploadRejected { username, filename } => {
                write!(f, "rejected upload chunk from {username} for {filename}")
            }
            Self::DownloadServed { username, filename } => {
                write!(f, "served {filename} to {username}")
            }
            Self::DownloadRefused { username, filename } => {
                write!(f, "refused download of {filename} to {username}")
            }
            Self::RelayForwarded { requester, owner, filename } => {
                write!(f, "forwarded {requester}'s request for {filename} to {owner}")
            }
            Self::RelayApproved { requester, owner, filename } => {
                write!(f, "{owner} approved {filename} for {requester}")
            }
            Self::RelayRejected { requester, owner } => {
                write!(f, "{owner} rejected {requester}'s request")
            }
            Self::RelayForged { owner } => {
                write!(f, "relay reply from {owner} failed integrity check")
            }
            Self::IntegrityFailure { username } => {
                write!(f, "message from {username} failed integrity check")
            }
        }
    }
}

/// Observer interface for server activity.
///
/// `user_list_changed` fires on every registration and removal with the
/// full sorted roster.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &ServerEvent);
    fn user_list_changed(&self, users: &[String]);
}

/// Default sink: events become `tracing` records.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::AuthFailed { .. }
            | ServerEvent::UploadRejected { .. }
            | ServerEvent::RelayForged { .. }
            | ServerEvent::IntegrityFailure { .. } => warn!("{event}"),
            _ => info!("{event}"),
        }
    }

    fn user_list_changed(&self, users: &[String]) {
        info!(online = users.len(), "online users: {}", users.join(", "));
    }
}
