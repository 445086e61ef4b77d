//! Key material: the server's identity pair and the directory of known
//! user public keys.
//!
//! Users are provisioned out of band by dropping `<username>_pub.pem`
//! (SPKI PEM) into the key directory. A username with no key file there
//! is unknown and cannot authenticate.

use std::path::PathBuf;

use rsa::{RsaPrivateKey, RsaPublicKey};

use bastion_core::crypto::{private_key_from_pem, public_key_from_pem};
use bastion_core::ProtocolError;

/// Usernames become file names (key files, stored uploads), so they are
/// restricted to a filesystem-safe alphabet.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Lookup of provisioned user public keys.
pub struct KeyRepository {
    dir: PathBuf,
}

impl KeyRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{username}_pub.pem"))
    }

    /// The PEM text of a user's public key, as provisioned.
    pub fn public_key_pem(&self, username: &str) -> Result<String, ProtocolError> {
        if !is_valid_username(username) {
            return Err(ProtocolError::UnknownUser(username.to_string()));
        }
        std::fs::read_to_string(self.path_for(username))
            .map_err(|_| ProtocolError::UnknownUser(username.to_string()))
    }

    /// A user's parsed public key. Unknown users and unparseable key files
    /// both fail; the caller never distinguishes them on the wire.
    pub fn public_key(&self, username: &str) -> Result<RsaPublicKey, ProtocolError> {
        let pem = self.public_key_pem(username)?;
        public_key_from_pem(&pem)
    }

    pub fn is_known(&self, username: &str) -> bool {
        is_valid_username(username) && self.path_for(username).exists()
    }
}

/// The server's own RSA identity.
pub struct ServerIdentity {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl ServerIdentity {
    /// Load the identity from PEM files on disk.
    pub fn load(private_path: &PathBuf, public_path: &PathBuf) -> Result<Self, ProtocolError> {
        let private_pem =
            std::fs::read_to_string(private_path).map_err(|source| ProtocolError::Storage {
                path: private_path.clone(),
                source,
            })?;
        let public_pem =
            std::fs::read_to_string(public_path).map_err(|source| ProtocolError::Storage {
                path: public_path.clone(),
                source,
            })?;
        let private = private_key_from_pem(&private_pem)?;
        let public = public_key_from_pem(&public_pem)?;
        Ok(Self { private, public })
    }

    /// Build an identity from an already-parsed private key.
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }
}
