//! Relay coordination: downloads of another user's file.
//!
//! The server never holds the secret protecting a relayed file. It forwards
//! the requester's identity and public key to the owner, waits for the
//! owner's tagged verdict, and on approval streams the file with the
//! owner-supplied encrypted key material attached to every chunk. A forged
//! verdict tag means the owner's session key is in the wrong hands: that
//! session is torn down on the spot and the requester gets a generic error.

use bytes::Bytes;
use tokio::sync::mpsc;

use bastion_core::crypto::{sign_hex, tag, verify_tag};
use bastion_core::wire::{split_tagged, Envelope, MessageCode, RelayChunk, RequesterInfo};
use bastion_core::ProtocolError;
use bastion_services::{FileId, PendingRelay, ServerEvent};

use crate::handshake::{queue_signed_error, AuthedSession};
use crate::server::ServerState;
use crate::transfer::{stream_file, NOT_AVAILABLE};

const REQUEST_FAILED: &str = "Your request could not be completed";
const OWNER_REJECTED: &str = "The owner rejected your request";

/// Forward a verified download request for someone else's file to its
/// owner, and record the pending negotiation.
pub async fn forward_request(
    state: &ServerState,
    requester: &AuthedSession,
    id: &FileId,
    outbound: &mpsc::UnboundedSender<Bytes>,
) -> Result<(), ProtocolError> {
    let owner_key = state.registry.session_key(&id.owner);
    let known_file = id.seq < state.store.count_for(&id.owner);
    let (Some(owner_key), true) = (owner_key, known_file) else {
        state.events.event(&ServerEvent::DownloadRefused {
            username: requester.username.clone(),
            filename: id.name(),
        });
        queue_signed_error(state, outbound, "Download", NOT_AVAILABLE);
        return Ok(());
    };

    let requester_pem = state
        .registry
        .public_key_pem(&requester.username)
        .ok_or_else(|| ProtocolError::UnknownUser(requester.username.clone()))?;
    let info = RequesterInfo {
        filename: id.name(),
        requester: requester.username.clone(),
        requester_public_key: requester_pem,
    };
    let inner = Envelope::new(
        MessageCode::RelayedRequesterInfo,
        "Download Request",
        info.encode_string(),
    );
    let inner_json = inner.encode_string();
    let t = tag(inner_json.as_bytes(), &owner_key);
    let outer = Envelope::new(
        MessageCode::RelayedRequesterInfo,
        "Download Request",
        format!("{inner_json}{t}"),
    );

    if !state.registry.send_to(&id.owner, Bytes::from(outer.encode())) {
        queue_signed_error(state, outbound, "Download", NOT_AVAILABLE);
        return Ok(());
    }
    state.relays.push(
        &id.owner,
        PendingRelay {
            requester: requester.username.clone(),
            filename: id.name(),
        },
    );
    state.events.event(&ServerEvent::RelayForwarded {
        requester: requester.username.clone(),
        owner: id.owner.clone(),
        filename: id.name(),
    });
    Ok(())
}

/// Handle a `ClassifiedInfo` verdict arriving on the owner's connection.
/// An integrity failure here returns an error, which tears the owner's
/// session down.
pub async fn handle_owner_reply(
    state: &ServerState,
    owner: &AuthedSession,
    envelope: &Envelope,
) -> Result<(), ProtocolError> {
    let Some(pending) = state.relays.pop(&owner.username) else {
        return Err(ProtocolError::Framing(format!(
            "unsolicited relay verdict from {}",
            owner.username
        )));
    };

    let (body, tag_hex) = split_tagged(&envelope.payload)?;
    if verify_tag(body.as_bytes(), &owner.session_key, tag_hex).is_err() {
        state.events.event(&ServerEvent::RelayForged {
            owner: owner.username.clone(),
        });
        send_signed_error_to(state, &pending.requester, "Download", REQUEST_FAILED);
        return Err(ProtocolError::Integrity);
    }

    match envelope.topic.as_str() {
        "Rejected" => {
            state.events.event(&ServerEvent::RelayRejected {
                requester: pending.requester.clone(),
                owner: owner.username.clone(),
            });
            send_signed_error_to(state, &pending.requester, "Download", OWNER_REJECTED);
            Ok(())
        }
        "DownloadRequest" => {
            let inner = Envelope::decode_str(body)?;
            serve_relayed_file(state, owner, &pending, &inner.payload).await
        }
        other => Err(ProtocolError::Framing(format!(
            "unknown relay verdict topic {other:?}"
        ))),
    }
}

async fn serve_relayed_file(
    state: &ServerState,
    owner: &AuthedSession,
    pending: &PendingRelay,
    classified: &str,
) -> Result<(), ProtocolError> {
    // The filename was validated when the request was forwarded.
    let Some(id) = FileId::parse(&pending.filename) else {
        send_signed_error_to(state, &pending.requester, "Download", REQUEST_FAILED);
        return Ok(());
    };

    let streamed = stream_file(state, &id, |chunk_json| {
        let relayed = RelayChunk {
            classified: classified.to_string(),
            chunk: chunk_json.to_string(),
        };
        let body = relayed.encode_string();
        let sig = sign_hex(body.as_bytes(), &state.identity.private);
        let outer = Envelope::new(
            MessageCode::OtherFileSuccessfulDownload,
            "Download",
            format!("{body}{sig}"),
        );
        state
            .registry
            .send_to(&pending.requester, Bytes::from(outer.encode()))
    })
    .await;

    // The file can vanish between forwarding and approval.
    if let Err(ProtocolError::NotFound(_)) = streamed {
        send_signed_error_to(state, &pending.requester, "Download", NOT_AVAILABLE);
        return Ok(());
    }
    streamed?;

    state.events.event(&ServerEvent::RelayApproved {
        requester: pending.requester.clone(),
        owner: owner.username.clone(),
        filename: pending.filename.clone(),
    });
    Ok(())
}

/// Signed error delivered by username, for requesters waiting on a relay
/// verdict that arrives on a different connection.
pub(crate) fn send_signed_error_to(state: &ServerState, username: &str, topic: &str, message: &str) {
    let sig = sign_hex(message.as_bytes(), &state.identity.private);
    let envelope = Envelope::new(MessageCode::ErrorResponse, topic, format!("{message}{sig}"));
    state.registry.send_to(username, Bytes::from(envelope.encode()));
}
