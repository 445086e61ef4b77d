//! Bastion wire format — the envelope every peer exchange travels in.
//!
//! The envelope is a JSON object `{code, topic, payload}`. `code` is a u8
//! discriminator, `topic` a free-form routing string, `payload` an opaque
//! string whose meaning depends on code+topic. Post-handshake payloads carry
//! a trailing hex integrity tag or RSA signature that the receiver splits
//! off before decoding (`split_tagged` / `split_signed`).
//!
//! Frames on the socket are length-prefixed: a u32 big-endian byte count
//! followed by that many envelope bytes. Earlier protocol revisions read
//! fixed byte counts per phase instead; those sizes are kept below as
//! documented constants of the legacy framing, not used here.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

// ── Message codes ─────────────────────────────────────────────────────────────

/// Envelope discriminator. The u8 values are the wire representation and
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageCode {
    Request = 0,
    SuccessfulResponse = 1,
    ErrorResponse = 2,
    DisconnectResponse = 3,
    UploadRequest = 4,
    DownloadRequest = 5,
    OwnFileSuccessfulDownload = 6,
    OtherFileSuccessfulDownload = 7,
    RelayedRequesterInfo = 8,
    ClassifiedInfo = 9,
}

impl TryFrom<u8> for MessageCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::SuccessfulResponse),
            2 => Ok(Self::ErrorResponse),
            3 => Ok(Self::DisconnectResponse),
            4 => Ok(Self::UploadRequest),
            5 => Ok(Self::DownloadRequest),
            6 => Ok(Self::OwnFileSuccessfulDownload),
            7 => Ok(Self::OtherFileSuccessfulDownload),
            8 => Ok(Self::RelayedRequesterInfo),
            9 => Ok(Self::ClassifiedInfo),
            other => Err(ProtocolError::Framing(format!(
                "unknown message code {other}"
            ))),
        }
    }
}

impl From<MessageCode> for u8 {
    fn from(code: MessageCode) -> u8 {
        code as u8
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The wire envelope. Constructed per send/receive, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: MessageCode,
    pub topic: String,
    pub payload: String,
}

impl Envelope {
    pub fn new(code: MessageCode, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            code,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Serialize to envelope bytes (the content of one frame).
    pub fn encode(&self) -> Vec<u8> {
        // Envelope fields are plain strings and a u8; serialization cannot fail.
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }

    /// Serialize to a JSON string, for payloads that nest an inner envelope.
    pub fn encode_string(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Framing(e.to_string()))
    }

    pub fn decode_str(s: &str) -> Result<Self, ProtocolError> {
        Self::decode(s.as_bytes())
    }
}

// ── Chunk bodies ──────────────────────────────────────────────────────────────

/// One unit of a chunked transfer stream. `data` is base64 so arbitrary
/// bytes survive the JSON envelope; `last` terminates the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    pub data: String,
    pub last: bool,
}

impl UploadChunk {
    pub fn from_bytes(bytes: &[u8], last: bool) -> Self {
        use base64::Engine;
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            last,
        }
    }

    /// Decode the chunk body back to raw bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| ProtocolError::Framing(format!("chunk body is not base64: {e}")))
    }

    pub fn encode_string(&self) -> String {
        serde_json::to_string(self).expect("chunk serialization is infallible")
    }

    pub fn decode_str(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(|e| ProtocolError::Framing(e.to_string()))
    }
}

/// Forwarded to a file owner when another user requests their file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequesterInfo {
    pub filename: String,
    pub requester: String,
    /// PEM-encoded public key of the requester, so the owner can encrypt
    /// key material only the requester can open.
    pub requester_public_key: String,
}

impl RequesterInfo {
    pub fn encode_string(&self) -> String {
        serde_json::to_string(self).expect("requester info serialization is infallible")
    }

    pub fn decode_str(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(|e| ProtocolError::Framing(e.to_string()))
    }
}

/// One relayed download chunk: the owner-supplied encrypted key/IV material
/// travels alongside every chunk of the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayChunk {
    pub classified: String,
    /// Serialized [`UploadChunk`].
    pub chunk: String,
}

impl RelayChunk {
    pub fn encode_string(&self) -> String {
        serde_json::to_string(self).expect("relay chunk serialization is infallible")
    }

    pub fn decode_str(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(|e| ProtocolError::Framing(e.to_string()))
    }
}

// ── Tagged / signed payload splitting ─────────────────────────────────────────

/// Hex length of an HMAC-SHA-512 integrity tag: 64 bytes → 128 hex chars.
pub const TAG_HEX_LEN: usize = 128;

/// Split a payload into `(body, tag_hex)`, taking the trailing fixed-length
/// integrity tag off the end.
pub fn split_tagged(payload: &str) -> Result<(&str, &str), ProtocolError> {
    if payload.len() < TAG_HEX_LEN {
        return Err(ProtocolError::Framing(format!(
            "payload too short for integrity tag: {} < {TAG_HEX_LEN}",
            payload.len()
        )));
    }
    let at = payload.len() - TAG_HEX_LEN;
    // A multibyte character straddling the split point cannot be a hex tag.
    if !payload.is_char_boundary(at) {
        return Err(ProtocolError::Framing("trailing tag is not hex".into()));
    }
    Ok(payload.split_at(at))
}

/// Split a payload into `(body, signature_hex)`. The signature's hex length
/// is a function of the signing key's modulus (`key.size() * 2`) and is
/// passed in by the caller — never assumed.
pub fn split_signed(payload: &str, sig_hex_len: usize) -> Result<(&str, &str), ProtocolError> {
    if payload.len() < sig_hex_len {
        return Err(ProtocolError::Framing(format!(
            "payload too short for signature: {} < {sig_hex_len}",
            payload.len()
        )));
    }
    let at = payload.len() - sig_hex_len;
    if !payload.is_char_boundary(at) {
        return Err(ProtocolError::Framing(
            "trailing signature is not hex".into(),
        ));
    }
    Ok(payload.split_at(at))
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Maximum frame size accepted on the wire. Bounds memory per read and
/// comfortably covers a chunk body plus envelope overhead.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Hex signature length for the nominal 4096-bit server deployment:
/// 512-byte signature → 1024 hex chars. Informational; real splits derive
/// the length from the key in hand.
pub const RSA_4096_SIG_HEX_LEN: usize = 1024;

// Legacy fixed-size framing, kept as documentation. Each phase read exactly
// this many bytes and trimmed trailing NULs.
pub const LEGACY_USERNAME_FRAME: usize = 128;
pub const LEGACY_SIGNED_NONCE_FRAME: usize = 1088;
pub const LEGACY_BULK_FRAME: usize = 4_196_352;

/// Write one length-prefixed frame: u32 big-endian length, then the bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    if bytes.len() > MAX_FRAME {
        return Err(ProtocolError::Framing(format!(
            "outbound frame of {} bytes exceeds MAX_FRAME",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(ProtocolError::Framing(format!(
            "inbound frame of {len} bytes exceeds MAX_FRAME"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read one frame and decode it as an envelope.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Envelope, ProtocolError> {
    let frame = read_frame(reader).await?;
    Envelope::decode(&frame)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
