//! Shared harness: an in-process server plus a client that performs the
//! real protocol — nonce signing, session-key unwrapping, chunk tagging.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::TcpStream;

use bastion_core::config::BastionConfig;
use bastion_core::crypto::{
    sign_hex, signature_hex_len, tag, unwrap_session_key, verify_hex, verify_tag, SessionKey,
};
use bastion_core::wire::{
    read_envelope, split_signed, split_tagged, write_frame, Envelope, MessageCode, RelayChunk,
    RequesterInfo, UploadChunk,
};
use bastion_services::{ServerIdentity, TracingSink};
use bastiond::{Server, ServerHandle};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Users provisioned in every test environment's key directory.
pub const PROVISIONED: [&str; 3] = ["alice", "bob", "carol"];

// ── Keys ──────────────────────────────────────────────────────────────────────

struct KeySet {
    server: RsaPrivateKey,
    users: Vec<(&'static str, RsaPrivateKey)>,
}

/// Key generation dominates startup, so every test shares one set.
/// "mallory" holds a key that is never provisioned on the server.
fn keys() -> &'static KeySet {
    static KEYS: OnceLock<KeySet> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::rngs::OsRng;
        let users = ["alice", "bob", "carol", "mallory"]
            .into_iter()
            .map(|name| (name, RsaPrivateKey::new(&mut rng, 2048).unwrap()))
            .collect();
        KeySet {
            server: RsaPrivateKey::new(&mut rng, 2048).unwrap(),
            users,
        }
    })
}

pub fn user_key(name: &str) -> RsaPrivateKey {
    keys()
        .users
        .iter()
        .find(|(n, _)| *n == name)
        .unwrap_or_else(|| panic!("no test key for {name}"))
        .1
        .clone()
}

pub fn server_public() -> RsaPublicKey {
    RsaPublicKey::from(&keys().server)
}

// ── Server environment ────────────────────────────────────────────────────────

pub struct TestEnv {
    pub handle: ServerHandle,
    root: PathBuf,
}

impl TestEnv {
    /// Start a server on a loopback port with a fresh storage root and the
    /// shared test users provisioned.
    pub async fn start(name: &str) -> Result<Self> {
        let root =
            std::env::temp_dir().join(format!("bastion-it-{name}-{}", std::process::id()));
        let key_dir = root.join("keys");
        std::fs::create_dir_all(&key_dir)?;
        for user in PROVISIONED {
            let pem = RsaPublicKey::from(&user_key(user)).to_public_key_pem(LineEnding::LF)?;
            std::fs::write(key_dir.join(format!("{user}_pub.pem")), pem)?;
        }

        let mut config = BastionConfig::default();
        config.network.listen_addr = "127.0.0.1".into();
        config.network.port = 0;
        config.network.phase_timeout_secs = 5;
        config.storage.root = root.join("files");
        config.keys.user_key_dir = key_dir;
        // Small chunks so short payloads still exercise multi-chunk streams.
        config.transfer.chunk_size = 8;

        let identity = ServerIdentity::from_private(keys().server.clone());
        let handle = Server::start(config, identity, Arc::new(TracingSink)).await?;
        Ok(Self { handle, root })
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub async fn connect(&self, username: &str) -> Result<TestClient> {
        TestClient::connect(self.addr(), username).await
    }

    pub async fn connect_and_auth(&self, username: &str) -> Result<TestClient> {
        let mut client = self.connect(username).await?;
        client.authenticate().await?;
        Ok(client)
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct TestClient {
    stream: TcpStream,
    pub username: String,
    key: RsaPrivateKey,
    pub session_key: Option<SessionKey>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, username: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        Ok(Self {
            stream,
            username: username.to_string(),
            key: user_key(username),
            session_key: None,
        })
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        write_frame(&mut self.stream, &envelope.encode()).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Envelope> {
        let envelope = tokio::time::timeout(RECV_TIMEOUT, read_envelope(&mut self.stream))
            .await
            .context("timed out waiting for the server")??;
        Ok(envelope)
    }

    fn session_key(&self) -> &SessionKey {
        self.session_key.as_ref().expect("client is authenticated")
    }

    /// Send the username claim and return the server's first reply.
    pub async fn claim_username(&mut self) -> Result<Envelope> {
        let claim = Envelope::new(MessageCode::Request, "User Name", self.username.clone());
        self.send(&claim).await?;
        self.recv().await
    }

    pub async fn authenticate(&mut self) -> Result<()> {
        let signer = self.key.clone();
        self.authenticate_signing_with(&signer).await
    }

    /// Full handshake, signing the challenge with `signer` — which is only
    /// the right key when `signer` matches the provisioned public key.
    pub async fn authenticate_signing_with(&mut self, signer: &RsaPrivateKey) -> Result<()> {
        let ack = self.claim_username().await?;
        if ack.code != MessageCode::SuccessfulResponse {
            bail!("username rejected: {}", ack.payload);
        }

        let challenge = self.recv().await?;
        if challenge.topic != "RN" {
            bail!("expected challenge, got topic {:?}", challenge.topic);
        }
        let sig = sign_hex(challenge.payload.as_bytes(), signer);
        self.send(&Envelope::new(MessageCode::Request, "RN", sig))
            .await?;

        let outer = self.recv().await?;
        let server_pub = server_public();
        let (inner_json, sig_hex) = split_signed(&outer.payload, signature_hex_len(&server_pub))?;
        verify_hex(inner_json.as_bytes(), &server_pub, sig_hex)
            .context("server signature on session key envelope")?;
        let inner = Envelope::decode_str(inner_json)?;
        if inner.code != MessageCode::SuccessfulResponse {
            bail!("authentication refused: {}", inner.payload);
        }
        let wrapped = hex::decode(&inner.payload)?;
        self.session_key = Some(unwrap_session_key(&wrapped, &self.key)?);
        Ok(())
    }

    /// Upload `chunks` as one stream and return the assigned file name.
    pub async fn upload(&mut self, chunks: &[&[u8]]) -> Result<String> {
        for (i, data) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            let body = UploadChunk::from_bytes(data, last).encode_string();
            let t = tag(body.as_bytes(), self.session_key());
            self.send(&Envelope::new(
                MessageCode::UploadRequest,
                "Upload",
                format!("{body}{t}"),
            ))
            .await?;
        }

        let reply = self.recv().await?;
        if reply.code != MessageCode::SuccessfulResponse {
            bail!("upload failed: {}", reply.payload);
        }
        let (inner_json, tag_hex) = split_tagged(&reply.payload)?;
        verify_tag(inner_json.as_bytes(), self.session_key(), tag_hex)?;
        let inner = Envelope::decode_str(inner_json)?;
        Ok(inner.payload)
    }

    /// Send a download request for `filename`, signed with this client's key.
    pub async fn request_download(&mut self, filename: &str) -> Result<()> {
        let sig = sign_hex(filename.as_bytes(), &self.key);
        self.send(&Envelope::new(
            MessageCode::DownloadRequest,
            "Download",
            format!("{}{sig}", hex::encode(filename)),
        ))
        .await
    }

    /// Download one of this client's own files, returning its bytes.
    pub async fn download_own(&mut self, filename: &str) -> Result<Vec<u8>> {
        self.request_download(filename).await?;
        let mut out = Vec::new();
        loop {
            let envelope = self.recv().await?;
            match envelope.code {
                MessageCode::OwnFileSuccessfulDownload => {
                    let chunk = verify_server_chunk(&envelope.payload)?;
                    out.extend(chunk.bytes()?);
                    if chunk.last {
                        return Ok(out);
                    }
                }
                MessageCode::ErrorResponse => {
                    bail!("download refused: {}", signed_error_message(&envelope)?)
                }
                other => bail!("unexpected message code {other:?} during download"),
            }
        }
    }

    /// Owner side: receive and verify a relayed download request.
    pub async fn recv_relay_request(&mut self) -> Result<RequesterInfo> {
        let envelope = self.recv().await?;
        if envelope.code != MessageCode::RelayedRequesterInfo {
            bail!("expected relayed request, got {:?}", envelope.code);
        }
        let (inner_json, tag_hex) = split_tagged(&envelope.payload)?;
        verify_tag(inner_json.as_bytes(), self.session_key(), tag_hex)?;
        let inner = Envelope::decode_str(inner_json)?;
        Ok(RequesterInfo::decode_str(&inner.payload)?)
    }

    /// Owner side: approve the oldest pending request, attaching the
    /// encrypted key material only the requester can open.
    pub async fn approve_relay(&mut self, classified: &str) -> Result<()> {
        let inner = Envelope::new(MessageCode::SuccessfulResponse, "DownloadRequest", classified);
        let body = inner.encode_string();
        let t = tag(body.as_bytes(), self.session_key());
        self.send(&Envelope::new(
            MessageCode::ClassifiedInfo,
            "DownloadRequest",
            format!("{body}{t}"),
        ))
        .await
    }

    /// Owner side: reject the oldest pending request.
    pub async fn reject_relay(&mut self) -> Result<()> {
        let body = "Rejected";
        let t = tag(body.as_bytes(), self.session_key());
        self.send(&Envelope::new(
            MessageCode::ClassifiedInfo,
            "Rejected",
            format!("{body}{t}"),
        ))
        .await
    }

    /// Requester side: collect a relayed file stream. Returns the
    /// owner-supplied classified string and the file bytes.
    pub async fn recv_relayed_file(&mut self) -> Result<(String, Vec<u8>)> {
        let mut classified = String::new();
        let mut out = Vec::new();
        loop {
            let envelope = self.recv().await?;
            match envelope.code {
                MessageCode::OtherFileSuccessfulDownload => {
                    let server_pub = server_public();
                    let (body, sig_hex) =
                        split_signed(&envelope.payload, signature_hex_len(&server_pub))?;
                    verify_hex(body.as_bytes(), &server_pub, sig_hex)?;
                    let relayed = RelayChunk::decode_str(body)?;
                    classified = relayed.classified;
                    let chunk = UploadChunk::decode_str(&relayed.chunk)?;
                    out.extend(chunk.bytes()?);
                    if chunk.last {
                        return Ok((classified, out));
                    }
                }
                MessageCode::ErrorResponse => {
                    bail!("relay failed: {}", signed_error_message(&envelope)?)
                }
                other => bail!("unexpected message code {other:?} during relay"),
            }
        }
    }

    /// Announce departure so the server tears the session down promptly.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&Envelope::new(
            MessageCode::DisconnectResponse,
            "Disconnect",
            "",
        ))
        .await
    }
}

/// Verify and unpack one server-signed download chunk:
/// inner envelope JSON followed by the server's hex signature.
pub fn verify_server_chunk(payload: &str) -> Result<UploadChunk> {
    let server_pub = server_public();
    let (inner_json, sig_hex) = split_signed(payload, signature_hex_len(&server_pub))?;
    verify_hex(inner_json.as_bytes(), &server_pub, sig_hex)?;
    let inner = Envelope::decode_str(inner_json)?;
    Ok(UploadChunk::decode_str(&inner.payload)?)
}

/// Verify a server-signed error payload and return its message.
pub fn signed_error_message(envelope: &Envelope) -> Result<String> {
    let server_pub = server_public();
    let (message, sig_hex) = split_signed(&envelope.payload, signature_hex_len(&server_pub))?;
    verify_hex(message.as_bytes(), &server_pub, sig_hex)?;
    Ok(message.to_string())
}
