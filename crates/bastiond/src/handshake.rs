//! Challenge-response authentication.
//!
//! Four phases per connection, each under its own read deadline:
//!
//!   1. client claims a username; the server checks it is provisioned and
//!      not already connected
//!   2. server sends a random hex nonce (topic "RN")
//!   3. client returns an RSA signature over the exact nonce bytes sent
//!   4. server issues a fresh session key, OAEP-wrapped under the client's
//!      public key, inside a server-signed envelope
//!
//! The session is registered before the key leaves the server, so a client
//! that holds the key is always visible to its peers.

use std::time::Duration;

use bytes::Bytes;
use rsa::RsaPublicKey;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use bastion_core::crypto::{generate_nonce, sign_hex, verify_hex, wrap_session_key, SessionKey};
use bastion_core::wire::{read_envelope, Envelope, MessageCode};
use bastion_core::ProtocolError;
use bastion_services::{is_valid_username, ServerEvent, Session};

use crate::server::ServerState;

/// The outcome of a successful handshake, carried by the connection loop
/// for the rest of the session.
pub struct AuthedSession {
    pub username: String,
    pub session_key: SessionKey,
    pub public_key: RsaPublicKey,
}

/// Queue an envelope on the connection's writer.
pub(crate) fn queue(outbound: &mpsc::UnboundedSender<Bytes>, envelope: &Envelope) {
    // A closed writer means the connection is already tearing down; the
    // reader will notice on its next read.
    let _ = outbound.send(Bytes::from(envelope.encode()));
}

async fn read_phase<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout_secs: u64,
) -> Result<Envelope, ProtocolError> {
    if timeout_secs == 0 {
        return read_envelope(reader).await;
    }
    tokio::time::timeout(Duration::from_secs(timeout_secs), read_envelope(reader))
        .await
        .map_err(|_| ProtocolError::Auth("handshake phase timed out".into()))?
}

/// Run the handshake to completion. On success the session is registered
/// and the wrapped session key is on its way to the client.
pub async fn run<R: AsyncRead + Unpin>(
    state: &ServerState,
    reader: &mut R,
    outbound: &mpsc::UnboundedSender<Bytes>,
) -> Result<AuthedSession, ProtocolError> {
    let timeout_secs = state.config.network.phase_timeout_secs;

    // Phase 1: username claim.
    let claim = read_phase(reader, timeout_secs).await?;
    if claim.code != MessageCode::Request {
        return Err(ProtocolError::Framing(format!(
            "expected username request, got {:?}",
            claim.code
        )));
    }
    let username = claim.payload.trim().to_string();

    if !is_valid_username(&username) || !state.keys.is_known(&username) {
        queue(
            outbound,
            &Envelope::new(MessageCode::ErrorResponse, "User Name", "Unknown user"),
        );
        return Err(ProtocolError::UnknownUser(username));
    }
    if state.registry.is_online(&username) {
        queue(
            outbound,
            &Envelope::new(
                MessageCode::ErrorResponse,
                "User Name",
                "You are already connected",
            ),
        );
        return Err(ProtocolError::DuplicateSession(username));
    }
    let public_key = state.keys.public_key(&username)?;
    let public_key_pem = state.keys.public_key_pem(&username)?;
    queue(
        outbound,
        &Envelope::new(
            MessageCode::SuccessfulResponse,
            "User Name",
            "You connected successfully",
        ),
    );

    // Phase 2: challenge.
    let nonce_hex = hex::encode(generate_nonce());
    queue(
        outbound,
        &Envelope::new(MessageCode::Request, "RN", nonce_hex.clone()),
    );

    // Phase 3: signed challenge. The client signs the nonce payload bytes
    // exactly as they appeared on the wire.
    let response = read_phase(reader, timeout_secs).await?;
    if response.code != MessageCode::Request || response.topic != "RN" {
        return Err(ProtocolError::Framing(format!(
            "expected signed challenge, got {:?}/{}",
            response.code, response.topic
        )));
    }
    if let Err(e) = verify_hex(nonce_hex.as_bytes(), &public_key, &response.payload) {
        let inner = Envelope::new(
            MessageCode::ErrorResponse,
            "Session Key",
            "Negative Acknowledgement",
        );
        let inner_json = inner.encode_string();
        let sig = sign_hex(inner_json.as_bytes(), &state.identity.private);
        queue(
            outbound,
            &Envelope::new(
                MessageCode::Request,
                "Session Key",
                format!("{inner_json}{sig}"),
            ),
        );
        return Err(ProtocolError::Auth(format!(
            "challenge signature rejected for {username}: {e}"
        )));
    }

    // Phase 4: session key issue. Registration happens first so a client
    // holding the key is already addressable.
    let session_key = SessionKey::generate();
    let wrapped = wrap_session_key(&session_key, &public_key)?;
    state.registry.register(
        &username,
        Session {
            outbound: outbound.clone(),
            session_key: session_key.clone(),
            public_key: public_key.clone(),
            public_key_pem,
        },
    )?;

    let inner = Envelope::new(
        MessageCode::SuccessfulResponse,
        "Session Key",
        hex::encode(wrapped),
    );
    let inner_json = inner.encode_string();
    let sig = sign_hex(inner_json.as_bytes(), &state.identity.private);
    queue(
        outbound,
        &Envelope::new(
            MessageCode::Request,
            "Session Key",
            format!("{inner_json}{sig}"),
        ),
    );

    state.events.event(&ServerEvent::Authenticated {
        username: username.clone(),
    });
    state
        .events
        .user_list_changed(&state.registry.online_users());

    Ok(AuthedSession {
        username,
        session_key,
        public_key,
    })
}

/// Sign `message` with the server key and queue it as an `ErrorResponse`
/// whose payload is the message followed by the hex signature. Shared by
/// the transfer engine and the relay coordinator.
pub(crate) fn queue_signed_error(
    state: &ServerState,
    outbound: &mpsc::UnboundedSender<Bytes>,
    topic: &str,
    message: &str,
) {
    let sig = sign_hex(message.as_bytes(), &state.identity.private);
    queue(
        outbound,
        &Envelope::new(MessageCode::ErrorResponse, topic, format!("{message}{sig}")),
    );
}
