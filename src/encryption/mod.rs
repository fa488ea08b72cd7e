//! Encryption built on the master secret of [SecretKeyManager](crate::secret::SecretKeyManager).
//!
//! - [field]: deterministic per-item encryption of stored credentials.
//! - [envelope]: randomized streaming encryption of backup payloads.

pub mod envelope;
pub mod field;

pub use envelope::{EnvelopeCipher, EnvelopeError, EnvelopeParams, EnvelopeReader, EnvelopeWriter};
pub use field::{FieldEncryptionError, FieldEncryptor};
