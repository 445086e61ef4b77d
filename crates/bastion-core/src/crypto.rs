//! Cryptographic primitives for Bastion.
//!
//! Three concerns live here:
//!   1. HMAC-SHA-512 integrity tags — every post-handshake message carries one
//!   2. RSA PKCS#1 v1.5 signatures (SHA-512) — handshake challenges and
//!      server-signed responses
//!   3. RSA-OAEP (SHA-256) session-key wrapping — the 256-bit session key
//!      travels to the client encrypted under its public key
//!
//! Earlier protocol revisions signed with SHA-256 but verified with SHA-512;
//! SHA-512 is used on both sides here. Session keys are zeroized on drop.
//! Signature lengths are always derived from the key in hand
//! (`signature_hex_len`), never assumed from a nominal modulus size.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ProtocolError;
use crate::wire::TAG_HEX_LEN;

type HmacSha512 = Hmac<Sha512>;

// ── Session keys and nonces ───────────────────────────────────────────────────

/// Byte length of a session key: 256 bits.
pub const SESSION_KEY_LEN: usize = 32;

/// Byte length of a handshake challenge nonce: 128 bits.
pub const NONCE_LEN: usize = 16;

/// Per-session symmetric key used to tag post-handshake traffic.
///
/// Generated exactly once per successful handshake, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a fresh random session key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in logs.
        f.write_str("SessionKey(..)")
    }
}

/// Generate a 128-bit challenge nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// ── Integrity tags ────────────────────────────────────────────────────────────

/// Compute the HMAC-SHA-512 integrity tag over `message`, lowercase hex.
/// Always [`TAG_HEX_LEN`] characters.
pub fn tag(message: &[u8], key: &SessionKey) -> String {
    let mut mac = HmacSha512::new_from_slice(key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an integrity tag. Exact-length, case-insensitive hex; the
/// underlying comparison is constant-time. Every failure mode reports
/// [`ProtocolError::Integrity`] — never silently ignored.
pub fn verify_tag(message: &[u8], key: &SessionKey, tag_hex: &str) -> Result<(), ProtocolError> {
    if tag_hex.len() != TAG_HEX_LEN {
        return Err(ProtocolError::Integrity);
    }
    let tag_bytes = hex::decode(tag_hex).map_err(|_| ProtocolError::Integrity)?;
    let mut mac = HmacSha512::new_from_slice(key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message);
    mac.verify_slice(&tag_bytes).map_err(|_| ProtocolError::Integrity)
}

// ── RSA signatures ────────────────────────────────────────────────────────────

/// Sign `message` with PKCS#1 v1.5 / SHA-512.
pub fn sign(message: &[u8], key: &RsaPrivateKey) -> Vec<u8> {
    let signing_key = SigningKey::<Sha512>::new(key.clone());
    signing_key.sign(message).to_vec()
}

/// Sign and return the lowercase hex encoding, ready to append to a payload.
pub fn sign_hex(message: &[u8], key: &RsaPrivateKey) -> String {
    hex::encode(sign(message, key))
}

/// Verify a PKCS#1 v1.5 / SHA-512 signature.
pub fn verify(message: &[u8], key: &RsaPublicKey, signature: &[u8]) -> Result<(), ProtocolError> {
    let verifying_key = VerifyingKey::<Sha512>::new(key.clone());
    let signature = Signature::try_from(signature)
        .map_err(|e| ProtocolError::Crypto(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| ProtocolError::Auth("signature verification failed".into()))
}

/// Verify a hex-encoded signature split off a payload.
pub fn verify_hex(message: &[u8], key: &RsaPublicKey, sig_hex: &str) -> Result<(), ProtocolError> {
    let bytes = hex::decode(sig_hex)
        .map_err(|_| ProtocolError::Auth("signature is not valid hex".into()))?;
    verify(message, key, &bytes)
}

/// Hex length of a signature produced by the holder of `key`.
/// `key.size()` is the modulus length in bytes; hex doubles it.
pub fn signature_hex_len(key: &RsaPublicKey) -> usize {
    key.size() * 2
}

// ── Session-key wrapping ──────────────────────────────────────────────────────

/// Encrypt a session key under the client's public key with RSA-OAEP-SHA-256.
pub fn wrap_session_key(
    key: &SessionKey,
    recipient: &RsaPublicKey,
) -> Result<Vec<u8>, ProtocolError> {
    recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| ProtocolError::Crypto(format!("session key wrap failed: {e}")))
}

/// Client-side inverse of [`wrap_session_key`].
pub fn unwrap_session_key(
    ciphertext: &[u8],
    key: &RsaPrivateKey,
) -> Result<SessionKey, ProtocolError> {
    let plaintext = key
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| ProtocolError::Crypto(format!("session key unwrap failed: {e}")))?;
    let bytes: [u8; SESSION_KEY_LEN] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::Crypto("unwrapped session key has wrong length".into()))?;
    Ok(SessionKey::from_bytes(bytes))
}

// ── Key loading ───────────────────────────────────────────────────────────────

/// Parse a PEM-encoded (SPKI) public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, ProtocolError> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| ProtocolError::Crypto(format!("malformed public key: {e}")))
}

/// Parse a PEM-encoded (PKCS#8) private key.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, ProtocolError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| ProtocolError::Crypto(format!("malformed private key: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
