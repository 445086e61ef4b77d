//! Per-connection worker.
//!
//! Each accepted socket gets two tasks: this reader loop and a writer task
//! draining the session's outbound frame queue. The reader authenticates,
//! then dispatches envelopes until the client leaves, an error occurs, or
//! the server shuts down. Errors tear down this connection only.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use bastion_core::wire::{read_envelope, write_frame, MessageCode};
use bastion_core::ProtocolError;
use bastion_services::{FileId, ServerEvent};

use crate::handshake;
use crate::relay;
use crate::server::ServerState;
use crate::transfer;

pub async fn run(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    state.events.event(&ServerEvent::Connected { peer });

    let (mut reader, writer_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(writer_half, rx));

    let authed = match handshake::run(&state, &mut reader, &tx).await {
        Ok(authed) => authed,
        Err(e) => {
            if e.is_handshake_fatal() {
                state.events.event(&ServerEvent::AuthFailed {
                    username: auth_subject(&e),
                    reason: e.to_string(),
                });
            } else {
                // Framing noise and dropped sockets are not auth failures.
                debug!(%peer, error = %e, "connection ended before authentication");
            }
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let mut active_upload: Option<FileId> = None;
    let result: Result<(), ProtocolError> = loop {
        tokio::select! {
            _ = shutdown.recv() => break Ok(()),
            envelope = read_envelope(&mut reader) => {
                let envelope = match envelope {
                    Ok(envelope) => envelope,
                    Err(e) => break Err(e),
                };
                let handled = match envelope.code {
                    MessageCode::UploadRequest => {
                        transfer::upload_chunk(&state, &authed, &mut active_upload, &envelope, &tx)
                            .await
                    }
                    MessageCode::DownloadRequest => {
                        transfer::handle_download(&state, &authed, &envelope, &tx).await
                    }
                    MessageCode::ClassifiedInfo => {
                        relay::handle_owner_reply(&state, &authed, &envelope).await
                    }
                    MessageCode::DisconnectResponse => break Ok(()),
                    other => Err(ProtocolError::Framing(format!(
                        "unexpected message code {other:?}"
                    ))),
                };
                if let Err(e) = handled {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = &result {
        debug!(username = %authed.username, error = %e, "connection closed with error");
    }

    // Teardown: the session disappears, partial uploads are discarded, and
    // anyone waiting on this user as a relay owner gets told.
    if let Some(id) = active_upload.take() {
        state.store.discard(&id).await;
    }
    state.registry.remove(&authed.username);
    for pending in state.relays.drain_owner(&authed.username) {
        relay::send_signed_error_to(
            &state,
            &pending.requester,
            "Download",
            transfer::NOT_AVAILABLE,
        );
    }
    state.events.event(&ServerEvent::Disconnected {
        username: authed.username.clone(),
    });
    state
        .events
        .user_list_changed(&state.registry.online_users());

    drop(tx);
    let _ = writer.await;
}

/// Drain the outbound queue onto the socket. Exits when the queue closes
/// (teardown) or a write fails (peer gone).
async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = rx.recv().await {
        if write_frame(&mut half, &frame).await.is_err() {
            break;
        }
    }
    let _ = half.shutdown().await;
}

/// Best available name for who failed to authenticate.
fn auth_subject(error: &ProtocolError) -> String {
    match error {
        ProtocolError::DuplicateSession(name) | ProtocolError::UnknownUser(name) => name.clone(),
        _ => "<unauthenticated>".to_string(),
    }
}
