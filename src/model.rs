//! Records produced and consumed by the streaming pipelines.

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encryption::{EnvelopeError, EnvelopeParams};

/// Lifecycle of a [Backup] or [Restore].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[display("PENDING")]
    Pending,
    #[display("IN_PROGRESS")]
    InProgress,
    #[display("COMPLETED")]
    Completed,
    #[display("FAILED")]
    Failed,
    #[display("CANCELLED")]
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

pub type BackupStatus = OperationStatus;
pub type RestoreStatus = OperationStatus;

#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionMode {
    #[default]
    #[display("NONE")]
    None,
    #[display("ENCRYPTED")]
    Encrypted,
}

/// Per-database backup settings, owned by the configuration API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub database_id: Uuid,
    #[serde(default)]
    pub is_backups_enabled: bool,
    pub storage_id: Uuid,
    #[serde(default)]
    pub encryption: EncryptionMode,
}

#[derive(Debug, Display, Error, From)]
pub enum EncryptionMetadataError {
    /// An encrypted backup lost its salt or nonce, it can't be decrypted.
    #[display("Backup {_0} is encrypted but has no salt/nonce metadata")]
    #[from(ignore)]
    Missing(#[error(ignore)] Uuid),
    /// A plaintext backup carries encryption metadata.
    #[display("Backup {_0} is not encrypted but carries salt/nonce metadata")]
    #[from(ignore)]
    Unexpected(#[error(ignore)] Uuid),
    #[display("Backup encryption metadata is invalid: {_0}")]
    Invalid(EnvelopeError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub database_id: Uuid,
    pub storage_id: Uuid,
    pub status: BackupStatus,
    pub size_mb: f64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub encryption: EncryptionMode,
    /// Base64 salt, present iff `encryption` is [EncryptionMode::Encrypted].
    pub encryption_salt: Option<String>,
    /// Base64 nonce, present iff `encryption` is [EncryptionMode::Encrypted].
    pub encryption_iv: Option<String>,
    pub fail_message: Option<String>,
}

impl Backup {
    /// Creates a [OperationStatus::Pending] backup, generating fresh
    /// encryption metadata when `encryption` asks for it.
    pub fn new(database_id: Uuid, storage_id: Uuid, encryption: EncryptionMode) -> Self {
        let (encryption_salt, encryption_iv) = match encryption {
            EncryptionMode::None => (None, None),
            EncryptionMode::Encrypted => {
                let params = EnvelopeParams::generate();
                (Some(params.salt_base64()), Some(params.nonce_base64()))
            }
        };

        Self {
            id: Uuid::new_v4(),
            database_id,
            storage_id,
            status: OperationStatus::Pending,
            size_mb: 0.0,
            duration_ms: 0,
            created_at: Utc::now(),
            encryption,
            encryption_salt,
            encryption_iv,
            fail_message: None,
        }
    }

    /// Parameters of the envelope cipher, `None` for plaintext backups.
    pub fn envelope_params(&self) -> Result<Option<EnvelopeParams>, EncryptionMetadataError> {
        match (self.encryption, &self.encryption_salt, &self.encryption_iv) {
            (EncryptionMode::Encrypted, Some(salt), Some(iv)) => {
                Ok(Some(EnvelopeParams::from_base64(salt, iv)?))
            }
            (EncryptionMode::Encrypted, _, _) => Err(EncryptionMetadataError::Missing(self.id)),
            (EncryptionMode::None, None, None) => Ok(None),
            (EncryptionMode::None, _, _) => Err(EncryptionMetadataError::Unexpected(self.id)),
        }
    }

    pub(crate) fn mark_in_progress(&mut self) {
        debug_assert_eq!(self.status, OperationStatus::Pending);
        self.status = OperationStatus::InProgress;
    }

    pub(crate) fn complete(&mut self, size_mb: f64, duration_ms: u64) {
        self.size_mb = size_mb;
        self.finish(OperationStatus::Completed, duration_ms, None);
    }

    pub(crate) fn finish(
        &mut self,
        status: OperationStatus,
        duration_ms: u64,
        message: Option<String>,
    ) {
        debug_assert!(!self.status.is_terminal(), "terminal status is set exactly once");
        self.status = status;
        self.duration_ms = duration_ms;
        self.fail_message = message;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restore {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub status: RestoreStatus,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub fail_message: Option<String>,
}

impl Restore {
    pub fn new(backup_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            duration_ms: 0,
            fail_message: None,
        }
    }

    pub(crate) fn mark_in_progress(&mut self) {
        debug_assert_eq!(self.status, OperationStatus::Pending);
        self.status = OperationStatus::InProgress;
    }

    pub(crate) fn finish(
        &mut self,
        status: OperationStatus,
        duration_ms: u64,
        message: Option<String>,
    ) {
        debug_assert!(!self.status.is_terminal(), "terminal status is set exactly once");
        self.status = status;
        self.duration_ms = duration_ms;
        self.fail_message = message;
    }
}
