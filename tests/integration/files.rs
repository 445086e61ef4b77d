//! Upload and own-file download.

use crate::infra::*;

use bastion_core::crypto::{tag, verify_tag};
use bastion_core::wire::{split_tagged, Envelope, MessageCode, UploadChunk};

#[tokio::test]
async fn upload_then_download_round_trip() {
    let env = TestEnv::start("files-roundtrip").await.unwrap();
    let mut alice = env.connect_and_auth("alice").await.unwrap();

    let filename = alice.upload(&[b"He", b"llo"]).await.unwrap();
    assert_eq!(filename, "alice_0");

    let bytes = alice.download_own(&filename).await.unwrap();
    assert_eq!(bytes, b"Hello");
}

#[tokio::test]
async fn long_files_stream_in_multiple_chunks() {
    let env = TestEnv::start("files-multichunk").await.unwrap();
    let mut alice = env.connect_and_auth("alice").await.unwrap();

    // 20 bytes against the harness's 8-byte chunk size: three chunks down.
    let payload = b"The quick brown fox!";
    let filename = alice.upload(&[payload]).await.unwrap();
    let bytes = alice.download_own(&filename).await.unwrap();
    assert_eq!(bytes, payload);
}

#[tokio::test]
async fn sequences_increase_across_reconnect() {
    let env = TestEnv::start("files-sequences").await.unwrap();

    let mut alice = env.connect_and_auth("alice").await.unwrap();
    assert_eq!(alice.upload(&[b"first"]).await.unwrap(), "alice_0");
    alice.disconnect().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut alice = env.connect_and_auth("alice").await.unwrap();
    assert_eq!(alice.upload(&[b"second"]).await.unwrap(), "alice_1");
    assert_eq!(alice.download_own("alice_0").await.unwrap(), b"first");
}

#[tokio::test]
async fn tampered_upload_chunk_aborts_transfer_only() {
    let env = TestEnv::start("files-tamper").await.unwrap();
    let mut alice = env.connect_and_auth("alice").await.unwrap();

    // Valid chunk body, garbage tag.
    let body = UploadChunk::from_bytes(b"evil", true).encode_string();
    let forged = format!("{body}{}", "0".repeat(128));
    alice
        .send(&Envelope::new(MessageCode::UploadRequest, "Upload", forged))
        .await
        .unwrap();

    let reply = alice.recv().await.unwrap();
    assert_eq!(reply.code, MessageCode::ErrorResponse);
    let (message, tag_hex) = split_tagged(&reply.payload).unwrap();
    let key = alice.session_key.as_ref().unwrap();
    verify_tag(message.as_bytes(), key, tag_hex).unwrap();
    assert_eq!(message, "Signature can't be verified during Upload");

    // The session survives and the rejected chunk left nothing behind.
    assert_eq!(alice.upload(&[b"clean"]).await.unwrap(), "alice_0");
    assert_eq!(alice.download_own("alice_0").await.unwrap(), b"clean");
}

#[tokio::test]
async fn upload_ack_is_tagged_with_the_session_key() {
    let env = TestEnv::start("files-ack").await.unwrap();
    let mut alice = env.connect_and_auth("alice").await.unwrap();

    let body = UploadChunk::from_bytes(b"x", true).encode_string();
    let key = alice.session_key.as_ref().unwrap().clone();
    let t = tag(body.as_bytes(), &key);
    alice
        .send(&Envelope::new(
            MessageCode::UploadRequest,
            "Upload",
            format!("{body}{t}"),
        ))
        .await
        .unwrap();

    let reply = alice.recv().await.unwrap();
    assert_eq!(reply.code, MessageCode::SuccessfulResponse);
    let (inner_json, tag_hex) = split_tagged(&reply.payload).unwrap();
    verify_tag(inner_json.as_bytes(), &key, tag_hex).unwrap();
    let inner = Envelope::decode_str(inner_json).unwrap();
    assert_eq!(inner.topic, "File Name");
    assert_eq!(inner.payload, "alice_0");
}

#[tokio::test]
async fn missing_file_reports_not_available() {
    let env = TestEnv::start("files-missing").await.unwrap();
    let mut alice = env.connect_and_auth("alice").await.unwrap();

    let err = alice.download_own("alice_7").await.unwrap_err();
    assert!(
        err.to_string()
            .contains("Either the file does not exist or the owner is not connected"),
        "unexpected error: {err}"
    );
}
