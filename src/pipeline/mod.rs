//! Streaming backup and restore of a database through its client tools.
//!
//! Backup: `dump stdout → gzip → envelope cipher (optional) → pipe → storage`.
//! Restore: `storage → temp file → envelope cipher (optional) → gunzip → restore stdin`.
//!
//! Each operation runs on the caller's thread and starts scoped helper
//! threads for the diagnostics drain, the process watcher and the storage
//! upload, all of which are joined before the operation reports.

pub mod backup;
pub mod pipe;
pub(crate) mod process;
pub mod restore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encryption::{EnvelopeCipher, EnvelopeError, FieldEncryptor};
use crate::engines::{EngineAdapter, EngineError, ProcessFailure, ToolPaths};
use crate::model::{Backup, EncryptionMetadataError, OperationStatus};
use crate::secret::{SecretKeyError, SecretKeyManager};
use crate::shutdown::{Cancellation, Cancelled, ShutdownCoordinator};
use crate::storage::StorageError;

use process::{Killed, Watched};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Time budget of a single backup or restore.
    pub timeout_secs: u64,
    /// Interval the process watchers check for cancellation.
    pub poll_interval_ms: u64,
    /// The progress callback fires every time this many megabytes were dumped.
    pub progress_threshold_mb: u64,
    /// Size of the blocks copied between stages.
    pub chunk_size: usize,
    /// Chunks buffered between the copy stage and the storage upload.
    pub pipe_capacity: usize,
    /// Directory for restore downloads, the system temp dir if unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 23 * 60 * 60,
            poll_interval_ms: 1000,
            progress_threshold_mb: 1,
            chunk_size: 64 * 1024,
            pipe_capacity: 16,
            temp_dir: None,
        }
    }
}

impl PipelineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Part of a pipeline an error happened in.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    #[display("Dump")]
    Dump,
    #[display("Compression")]
    Compress,
    #[display("Encryption")]
    Encrypt,
    #[display("Upload")]
    Upload,
    #[display("Download")]
    Download,
    #[display("Decryption")]
    Decrypt,
    #[display("Decompression")]
    Decompress,
    #[display("Restore")]
    Restore,
}

impl Stage {
    /// The envelope stage of the operation this stage belongs to.
    fn cipher(self) -> Self {
        match self {
            Self::Dump | Self::Compress | Self::Encrypt | Self::Upload => Self::Encrypt,
            Self::Download | Self::Decrypt | Self::Decompress | Self::Restore => Self::Decrypt,
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum PipelineError {
    #[display("Backups are disabled for database {_0}")]
    #[from(ignore)]
    BackupsDisabled(#[error(ignore)] Uuid),
    #[display("Backup {_0} was already run")]
    #[from(ignore)]
    AlreadyRun(#[error(ignore)] Uuid),
    #[display("Backup {backup_id} is {status} and can't be restored")]
    #[from(ignore)]
    NotRestorable {
        backup_id: Uuid,
        status: OperationStatus,
    },
    #[display("{_0}")]
    Engine(EngineError),
    #[display("{_0}")]
    Metadata(EncryptionMetadataError),
    #[display("Secret key unavailable: {_0}")]
    SecretKey(SecretKeyError),
    #[display("{stage} failed: {source}")]
    #[from(ignore)]
    Envelope { stage: Stage, source: EnvelopeError },
    #[display("Starting {tool} failed: {source}")]
    #[from(ignore)]
    Spawn { tool: String, source: io::Error },
    #[display("{_0}")]
    Process(ProcessFailure),
    #[display("{_0}")]
    Storage(StorageError),
    #[display("{stage} failed: {source}")]
    #[from(ignore)]
    Io { stage: Stage, source: io::Error },
    #[display("{_0}")]
    Cancelled(Cancelled),
}

impl PipelineError {
    /// Wraps an I/O error of `stage`, unwrapping cancellations and envelope
    /// failures that travelled through the stream. Envelope failures are
    /// attributed to the cipher stage whichever stage read or wrote them.
    pub(crate) fn stage(stage: Stage, source: io::Error) -> Self {
        if let Some(cancelled) = process::cancelled_in(&source) {
            return Self::Cancelled(cancelled);
        }
        let envelope = source
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<EnvelopeError>())
            .cloned();
        match envelope {
            Some(source) => Self::Envelope {
                stage: stage.cipher(),
                source,
            },
            None => Self::Io { stage, source },
        }
    }

    pub fn cancelled(&self) -> Option<Cancelled> {
        match self {
            Self::Cancelled(cancelled) => Some(*cancelled),
            Self::Storage(err) => err.cancelled(),
            Self::Io { source, .. } => process::cancelled_in(source),
            _ => None,
        }
    }

    /// Terminal status of an operation that ended with this error.
    pub fn status(&self) -> OperationStatus {
        match self {
            Self::Cancelled(_) => OperationStatus::Cancelled,
            _ => OperationStatus::Failed,
        }
    }
}

/// Runs backups and restores against the installed client tools.
///
/// One instance serves any number of concurrent operations, the only state
/// shared between them is the cached secret key and the shutdown flag.
#[derive(Debug, Clone)]
pub struct Pipeline {
    secrets: Arc<SecretKeyManager>,
    encryptor: FieldEncryptor,
    tools: ToolPaths,
    shutdown: ShutdownCoordinator,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        secrets: Arc<SecretKeyManager>,
        tools: ToolPaths,
        shutdown: ShutdownCoordinator,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            encryptor: FieldEncryptor::new(Arc::clone(&secrets)),
            secrets,
            tools,
            shutdown,
            settings,
        }
    }

    pub fn encryptor(&self) -> &FieldEncryptor {
        &self.encryptor
    }

    fn cancellation(&self) -> Cancellation {
        self.shutdown.cancellation(self.settings.timeout())
    }

    /// Cipher of an encrypted backup, `None` for plaintext ones.
    fn envelope_cipher(
        &self,
        backup: &Backup,
        stage: Stage,
    ) -> Result<Option<EnvelopeCipher>, PipelineError> {
        let Some(params) = backup.envelope_params()? else {
            return Ok(None);
        };
        let secret = self.secrets.get_secret_key()?;
        let cipher = EnvelopeCipher::new(secret, backup.id, &params)
            .map_err(|source| PipelineError::Envelope { stage, source })?;
        Ok(Some(cipher))
    }
}

/// Picks the error an operation reports.
///
/// Cancellation wins over everything, then a classified failure of the
/// external process, then `errors` in the given order.
fn first_error(
    cancel: &Cancellation,
    adapter: &dyn EngineAdapter,
    process_stage: Stage,
    watched: io::Result<Watched>,
    diagnostics: &str,
    errors: Vec<PipelineError>,
) -> Result<(), PipelineError> {
    let process_failed = match &watched {
        Ok(watched) => watched.killed.is_some() || !watched.exit.success(),
        Err(_) => true,
    };
    if errors.is_empty() && !process_failed {
        return Ok(());
    }

    let cancelled = errors
        .iter()
        .find_map(PipelineError::cancelled)
        .or(match &watched {
            Ok(Watched {
                killed: Some(Killed::Cancelled(cancelled)),
                ..
            }) => Some(*cancelled),
            _ => None,
        })
        .or_else(|| cancel.check().err());
    if let Some(cancelled) = cancelled {
        return Err(PipelineError::Cancelled(cancelled));
    }

    match watched {
        Ok(Watched { exit, killed: None }) if !exit.success() => {
            Err(PipelineError::Process(adapter.classify_failure(&exit, diagnostics)))
        }
        Ok(_) => match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        },
        Err(source) => Err(errors.into_iter().next().unwrap_or(PipelineError::Io {
            stage: process_stage,
            source,
        })),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
