//! Upload and download engine.
//!
//! Uploads arrive as a stream of `UploadRequest` envelopes, each payload an
//! `UploadChunk` JSON body with a trailing HMAC tag under the sender's
//! session key. A failed tag aborts the transfer (and discards the partial
//! file) but leaves the session up. Downloads of a user's own files are
//! served directly; requests naming another owner's file go to the relay
//! coordinator.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use bastion_core::crypto::{sign_hex, signature_hex_len, tag, verify_hex, verify_tag};
use bastion_core::wire::{split_signed, split_tagged, Envelope, MessageCode, UploadChunk};
use bastion_core::ProtocolError;
use bastion_services::{FileId, ServerEvent};

use crate::handshake::{queue, queue_signed_error, AuthedSession};
use crate::relay;
use crate::server::ServerState;

pub(crate) const NOT_AVAILABLE: &str =
    "Either the file does not exist or the owner is not connected";
const UPLOAD_TAG_REJECTED: &str = "Signature can't be verified during Upload";

/// Handle one chunk of an upload stream. `active` is the file the stream
/// is writing to; it is allocated on the first chunk and cleared when the
/// stream ends, by completion or by abort.
pub async fn upload_chunk(
    state: &ServerState,
    user: &AuthedSession,
    active: &mut Option<FileId>,
    envelope: &Envelope,
    outbound: &mpsc::UnboundedSender<Bytes>,
) -> Result<(), ProtocolError> {
    let (body, tag_hex) = split_tagged(&envelope.payload)?;

    if verify_tag(body.as_bytes(), &user.session_key, tag_hex).is_err() {
        state.events.event(&ServerEvent::IntegrityFailure {
            username: user.username.clone(),
        });
        if let Some(id) = active.take() {
            state.events.event(&ServerEvent::UploadRejected {
                username: user.username.clone(),
                filename: id.name(),
            });
            state.store.discard(&id).await;
        }
        let t = tag(UPLOAD_TAG_REJECTED.as_bytes(), &user.session_key);
        queue(
            outbound,
            &Envelope::new(
                MessageCode::ErrorResponse,
                "Upload",
                format!("{UPLOAD_TAG_REJECTED}{t}"),
            ),
        );
        return Ok(());
    }

    let chunk = UploadChunk::decode_str(body)?;
    let bytes = chunk.bytes()?;
    let id = match active {
        Some(id) => id.clone(),
        None => {
            let id = state.store.allocate(&user.username);
            *active = Some(id.clone());
            id
        }
    };
    state.store.append(&id, &bytes).await?;
    state.events.event(&ServerEvent::UploadChunk {
        username: user.username.clone(),
        filename: id.name(),
        bytes: bytes.len(),
    });

    if chunk.last {
        state.store.commit(&id);
        *active = None;

        let inner = Envelope::new(MessageCode::SuccessfulResponse, "File Name", id.name());
        let inner_json = inner.encode_string();
        let t = tag(inner_json.as_bytes(), &user.session_key);
        queue(
            outbound,
            &Envelope::new(
                MessageCode::SuccessfulResponse,
                "File Name",
                format!("{inner_json}{t}"),
            ),
        );
        state.events.event(&ServerEvent::UploadComplete {
            username: user.username.clone(),
            filename: id.name(),
        });
    }
    Ok(())
}

/// Handle a `DownloadRequest`: payload = hex(filename bytes) followed by
/// the requester's hex signature over those filename bytes.
pub async fn handle_download(
    state: &ServerState,
    user: &AuthedSession,
    envelope: &Envelope,
    outbound: &mpsc::UnboundedSender<Bytes>,
) -> Result<(), ProtocolError> {
    let sig_len = signature_hex_len(&user.public_key);
    let (name_hex, sig_hex) = split_signed(&envelope.payload, sig_len)?;

    let filename_bytes = match hex::decode(name_hex) {
        Ok(bytes) => bytes,
        Err(_) => {
            queue_signed_error(state, outbound, "Download", "Malformed file name");
            return Ok(());
        }
    };
    if verify_hex(&filename_bytes, &user.public_key, sig_hex).is_err() {
        state.events.event(&ServerEvent::IntegrityFailure {
            username: user.username.clone(),
        });
        queue_signed_error(state, outbound, "Download", "Signature can't be verified");
        return Ok(());
    }
    let filename = match String::from_utf8(filename_bytes) {
        Ok(name) => name,
        Err(_) => {
            queue_signed_error(state, outbound, "Download", "Malformed file name");
            return Ok(());
        }
    };
    let Some(id) = FileId::parse(&filename) else {
        queue_signed_error(state, outbound, "Download", "Malformed file name");
        return Ok(());
    };

    if id.owner == user.username {
        serve_own_file(state, user, &id, outbound).await
    } else {
        relay::forward_request(state, user, &id, outbound).await
    }
}

async fn serve_own_file(
    state: &ServerState,
    user: &AuthedSession,
    id: &FileId,
    outbound: &mpsc::UnboundedSender<Bytes>,
) -> Result<(), ProtocolError> {
    let streamed = stream_file(state, id, |chunk_json| {
        let inner = Envelope::new(MessageCode::SuccessfulResponse, "Download", chunk_json);
        let inner_json = inner.encode_string();
        let sig = sign_hex(inner_json.as_bytes(), &state.identity.private);
        let outer = Envelope::new(
            MessageCode::OwnFileSuccessfulDownload,
            "Download",
            format!("{inner_json}{sig}"),
        );
        queue(outbound, &outer);
        true
    })
    .await;

    if let Err(ProtocolError::NotFound(_)) = streamed {
        state.events.event(&ServerEvent::DownloadRefused {
            username: user.username.clone(),
            filename: id.name(),
        });
        queue_signed_error(state, outbound, "Download", NOT_AVAILABLE);
        return Ok(());
    }
    streamed?;

    state.events.event(&ServerEvent::DownloadServed {
        username: user.username.clone(),
        filename: id.name(),
    });
    Ok(())
}

/// Read `id` in configured chunk-size pieces and hand each chunk's
/// `UploadChunk` JSON to `emit`. The remaining-byte counter is a 32-bit
/// signed value; the stream ends the moment it drops to zero or below,
/// which is also what marks the final chunk. `emit` returning false stops
/// the stream early (receiver gone).
pub(crate) async fn stream_file(
    state: &ServerState,
    id: &FileId,
    mut emit: impl FnMut(&str) -> bool,
) -> Result<(), ProtocolError> {
    let size = state.store.size(id).await?;
    let mut file = state.store.open_file(id).await?;
    let mut remaining = size as i32;
    let mut buf = vec![0u8; state.config.transfer.chunk_size];
    let pace = Duration::from_millis(state.config.transfer.pace_ms);

    loop {
        let n = file.read(&mut buf).await.map_err(ProtocolError::Io)?;
        remaining -= n as i32;
        let last = remaining <= 0;

        let chunk = UploadChunk::from_bytes(&buf[..n], last);
        if !emit(&chunk.encode_string()) {
            return Ok(());
        }
        if last {
            return Ok(());
        }
        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
    }
}
