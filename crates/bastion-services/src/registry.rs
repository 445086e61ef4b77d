//! Session registry — tracks connected, authenticated users.
//!
//! The registry is the only state mutated across connection workers: a
//! worker registers itself after the handshake and removes itself on
//! teardown. DashMap serializes those mutations; the whole session lives
//! under one key so removal is atomic.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use rsa::RsaPublicKey;
use tokio::sync::mpsc;

use bastion_core::crypto::SessionKey;
use bastion_core::ProtocolError;

/// One authenticated connection.
///
/// The socket itself is owned by the connection's reader/writer tasks; the
/// registry holds the outbound frame queue, the session key established by
/// the handshake, and the peer's public key.
pub struct Session {
    /// Encoded frames pushed here are written to the socket by the
    /// connection's writer task, in order.
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub session_key: SessionKey,
    pub public_key: RsaPublicKey,
    /// PEM form of `public_key`, forwarded verbatim in relay requests.
    pub public_key_pem: String,
}

/// The session table — shared across all connection workers.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Register a freshly authenticated session. Fails if the username
    /// already has a live session; the check and insert are one atomic
    /// entry operation.
    pub fn register(&self, username: &str, session: Session) -> Result<(), ProtocolError> {
        match self.inner.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ProtocolError::DuplicateSession(username.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Remove a session. Idempotent; returns whether anything was removed.
    pub fn remove(&self, username: &str) -> bool {
        self.inner.remove(username).is_some()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.inner.contains_key(username)
    }

    /// Clone out the session key for tagging/verification.
    pub fn session_key(&self, username: &str) -> Option<SessionKey> {
        self.inner.get(username).map(|s| s.session_key.clone())
    }

    /// Clone out the peer's public key for signature verification.
    pub fn public_key(&self, username: &str) -> Option<RsaPublicKey> {
        self.inner.get(username).map(|s| s.public_key.clone())
    }

    pub fn public_key_pem(&self, username: &str) -> Option<String> {
        self.inner.get(username).map(|s| s.public_key_pem.clone())
    }

    /// Queue an encoded frame for delivery to a user. Returns false if the
    /// user is offline or its writer has already shut down.
    pub fn send_to(&self, username: &str, frame: Bytes) -> bool {
        match self.inner.get(username) {
            Some(session) => session.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    /// Sorted usernames of everyone online, for observability.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Snapshot of outbound senders, for shutdown broadcasts.
    pub fn all_senders(&self) -> Vec<(String, mpsc::UnboundedSender<Bytes>)> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().outbound.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
