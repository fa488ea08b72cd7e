//! The storage port backups are streamed to and restored from.
//!
//! Remote backends (S3, SFTP, ...) live outside this crate and implement
//! [Storage]. [LocalStorage] keeps backups on a local or mounted disk.

pub mod local;

use std::io::{self, Read};

use derive_more::{Display, Error, From};
use uuid::Uuid;

use crate::encryption::{FieldEncryptionError, FieldEncryptor};
use crate::shutdown::{Cancellation, Cancelled};

pub use local::LocalStorage;

#[derive(Debug, Display, Error, From)]
pub enum StorageError {
    #[display("Storage I/O failed: {_0}")]
    Io(io::Error),
    #[display("Storage transfer aborted: {_0}")]
    Cancelled(Cancelled),
    #[display("Backup {_0} does not exist in storage")]
    #[from(ignore)]
    NotFound(#[error(ignore)] Uuid),
    #[display("Invalid storage configuration: {_0}")]
    #[from(ignore)]
    Invalid(#[error(ignore)] String),
    #[display("Storage credentials unavailable: {_0}")]
    Credentials(FieldEncryptionError),
}

impl StorageError {
    /// Cancellation may arrive directly or wrapped in an I/O error of the pipe.
    pub fn cancelled(&self) -> Option<Cancelled> {
        match self {
            Self::Cancelled(cancelled) => Some(*cancelled),
            Self::Io(err) => err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<Cancelled>())
                .copied(),
            _ => None,
        }
    }
}

/// Streaming read, write and delete of backup objects.
///
/// Credentials of a backend are stored encrypted with the [FieldEncryptor],
/// every operation receives it to decrypt them on demand.
pub trait Storage: Send + Sync {
    /// Streams `reader` to the object of `backup_id` until EOF.
    ///
    /// An error from `reader` aborts the upload, no complete object must be
    /// left behind in that case.
    fn save_file(
        &self,
        cancel: &Cancellation,
        encryptor: &FieldEncryptor,
        backup_id: Uuid,
        reader: &mut dyn Read,
    ) -> Result<(), StorageError>;

    fn get_file(
        &self,
        encryptor: &FieldEncryptor,
        backup_id: Uuid,
    ) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Removes the object of `backup_id`, including partial uploads.
    /// Deleting a missing object is not an error.
    fn delete_file(&self, encryptor: &FieldEncryptor, backup_id: Uuid) -> Result<(), StorageError>;

    /// Sanity checks the configuration without touching the backend.
    fn validate(&self, encryptor: &FieldEncryptor) -> Result<(), StorageError>;

    /// Checks the backend is reachable and writable.
    fn test_connection(&self, encryptor: &FieldEncryptor) -> Result<(), StorageError>;

    /// Redacts credentials before the configuration leaves the service.
    fn hide_sensitive_data(&mut self);

    fn encrypt_sensitive_data(&mut self, encryptor: &FieldEncryptor) -> Result<(), StorageError>;
}
