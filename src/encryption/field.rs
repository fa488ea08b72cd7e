//! Encryption of individual credential strings at rest.
//!
//! Values are stored as `enc:<base64 nonce>:<base64 ciphertext>`. The nonce
//! is derived from the item identifier so re-encrypting the same item yields
//! the same ciphertext while different items never share one.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use derive_more::{Display, Error, From};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::secret::{SecretKey, SecretKeyError, SecretKeyManager};

/// Marks a value as ciphertext produced by [FieldEncryptor].
pub const ENCRYPTED_PREFIX: &str = "enc:";

const NONCE_LEN: usize = 12;

#[derive(Debug, Display, Error, From)]
pub enum FieldEncryptionError {
    #[display("Secret key unavailable: {_0}")]
    SecretKey(SecretKeyError),
    #[display("Encrypted value of item {_0} is malformed")]
    #[from(ignore)]
    Malformed(#[error(ignore)] Uuid),
    #[display("Encrypting the value of item {_0} failed")]
    #[from(ignore)]
    Encryption(#[error(ignore)] Uuid),
    #[display("Decrypting the value of item {_0} failed, wrong secret key or tampered value")]
    #[from(ignore)]
    Decryption(#[error(ignore)] Uuid),
    #[display("Decrypted value of item {_0} is not valid UTF-8")]
    #[from(ignore)]
    InvalidUtf8(#[error(ignore)] Uuid),
}

/// Encrypts and decrypts stored credentials with the master secret.
#[derive(Debug, Clone)]
pub struct FieldEncryptor {
    secrets: Arc<SecretKeyManager>,
}

impl FieldEncryptor {
    pub fn new(secrets: Arc<SecretKeyManager>) -> Self {
        Self { secrets }
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    /// Encrypts `plaintext` for the item `item_id`.
    ///
    /// Empty and already encrypted values are returned unchanged.
    pub fn encrypt(&self, item_id: Uuid, plaintext: &str) -> Result<String, FieldEncryptionError> {
        if plaintext.is_empty() || Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let secret = self.secrets.get_secret_key()?;
        let nonce = item_nonce(secret, item_id);
        let ciphertext = cipher(secret)
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| FieldEncryptionError::Encryption(item_id))?;

        Ok(format!(
            "{ENCRYPTED_PREFIX}{}:{}",
            BASE64.encode(nonce),
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypts a value produced by [encrypt](Self::encrypt).
    ///
    /// Values without the [ENCRYPTED_PREFIX] are legacy plaintext and are
    /// returned unchanged.
    pub fn decrypt(&self, item_id: Uuid, value: &str) -> Result<String, FieldEncryptionError> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };

        let malformed = || FieldEncryptionError::Malformed(item_id);
        let (nonce, ciphertext) = encoded.split_once(':').ok_or_else(malformed)?;
        let nonce = BASE64.decode(nonce).map_err(|_| malformed())?;
        let ciphertext = BASE64.decode(ciphertext).map_err(|_| malformed())?;
        if nonce.len() != NONCE_LEN {
            return Err(malformed());
        }

        let secret = self.secrets.get_secret_key()?;
        let plaintext = cipher(secret)
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| FieldEncryptionError::Decryption(item_id))?;

        String::from_utf8(plaintext).map_err(|_| FieldEncryptionError::InvalidUtf8(item_id))
    }
}

fn cipher(secret: &SecretKey) -> Aes256Gcm {
    let key = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(&key)
}

/// HMAC-SHA256 of the item id keyed with the secret, truncated to the nonce length.
fn item_nonce(secret: &SecretKey, item_id: Uuid) -> [u8; NONCE_LEN] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(item_id.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}
