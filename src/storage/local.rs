//! Backups stored as plain files below a root directory.

use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Storage, StorageError};
use crate::encryption::FieldEncryptor;
use crate::shutdown::Cancellation;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorage {
    pub id: Uuid,
    /// Directory holding one file per backup.
    pub root: PathBuf,
}

impl LocalStorage {
    pub fn new(id: Uuid, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
        }
    }

    pub fn object_path(&self, backup_id: Uuid) -> PathBuf {
        self.root.join(backup_id.to_string())
    }

    /// Uploads in progress, renamed to [object_path](Self::object_path) once complete.
    fn partial_path(&self, backup_id: Uuid) -> PathBuf {
        self.root.join(format!("{backup_id}.part"))
    }

    fn write_partial(
        &self,
        cancel: &Cancellation,
        path: &Path,
        reader: &mut dyn Read,
    ) -> Result<u64, StorageError> {
        let mut file = File::create_new(path)?;
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;
        loop {
            cancel.check()?;
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(&buffer[..read])?;
            written += read as u64;
        }
        file.sync_all()?;
        Ok(written)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

impl Storage for LocalStorage {
    fn save_file(
        &self,
        cancel: &Cancellation,
        _encryptor: &FieldEncryptor,
        backup_id: Uuid,
        reader: &mut dyn Read,
    ) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        let partial = self.partial_path(backup_id);
        log::debug!(target: "storage::local", "Writing backup {backup_id} to {}", partial.display());

        match self.write_partial(cancel, &partial, reader) {
            Ok(written) => {
                fs::rename(&partial, self.object_path(backup_id))?;
                log::info!(target: "storage::local", "Stored backup {backup_id} ({written} bytes)");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&partial) {
                    log::warn!(target: "storage::local", "Removing partial upload {} failed: {cleanup}", partial.display());
                }
                Err(e)
            }
        }
    }

    fn get_file(
        &self,
        _encryptor: &FieldEncryptor,
        backup_id: Uuid,
    ) -> Result<Box<dyn Read + Send>, StorageError> {
        match File::open(self.object_path(backup_id)) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(backup_id)),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_file(
        &self,
        _encryptor: &FieldEncryptor,
        backup_id: Uuid,
    ) -> Result<(), StorageError> {
        remove_if_exists(&self.partial_path(backup_id))?;
        remove_if_exists(&self.object_path(backup_id))?;
        log::debug!(target: "storage::local", "Deleted backup {backup_id}");
        Ok(())
    }

    fn validate(&self, _encryptor: &FieldEncryptor) -> Result<(), StorageError> {
        if self.root.as_os_str().is_empty() {
            return Err(StorageError::Invalid("local storage root is empty".into()));
        }
        if self.root.is_relative() {
            log::warn!(target: "storage::local", "Storage root is relative: {}", self.root.display());
        }
        Ok(())
    }

    fn test_connection(&self, encryptor: &FieldEncryptor) -> Result<(), StorageError> {
        self.validate(encryptor)?;
        fs::create_dir_all(&self.root)?;
        let marker = self.root.join(format!(".write-test-{}", Uuid::new_v4()));
        fs::write(&marker, b"dbstream")?;
        fs::remove_file(&marker)?;
        Ok(())
    }

    fn hide_sensitive_data(&mut self) {}

    fn encrypt_sensitive_data(&mut self, _encryptor: &FieldEncryptor) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engines::test_support::encryptor;
    use crate::shutdown::{CancelReason, ShutdownCoordinator};

    /// Yields some bytes, then fails like an aborted pipe.
    struct Failing(bool);

    impl Read for Failing {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if std::mem::replace(&mut self.0, true) {
                Err(io::Error::new(ErrorKind::BrokenPipe, "writer aborted"))
            } else {
                buf[..3].copy_from_slice(b"abc");
                Ok(3)
            }
        }
    }

    #[test]
    fn saves_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(Uuid::new_v4(), dir.path().join("backups"));
        let encryptor = encryptor();
        let cancel = ShutdownCoordinator::new().cancellation(Duration::from_secs(60));
        let id = Uuid::new_v4();

        storage
            .save_file(&cancel, &encryptor, id, &mut &b"payload"[..])
            .unwrap();
        assert!(!storage.partial_path(id).exists());

        let mut content = String::new();
        storage
            .get_file(&encryptor, id)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "payload");

        storage.delete_file(&encryptor, id).unwrap();
        assert!(matches!(
            storage.get_file(&encryptor, id),
            Err(StorageError::NotFound(_))
        ));
        // deleting twice is fine
        storage.delete_file(&encryptor, id).unwrap();
    }

    #[test]
    fn failed_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(Uuid::new_v4(), dir.path());
        let cancel = ShutdownCoordinator::new().cancellation(Duration::from_secs(60));
        let id = Uuid::new_v4();

        let err = storage
            .save_file(&cancel, &encryptor(), id, &mut Failing(false))
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!storage.partial_path(id).exists());
        assert!(!storage.object_path(id).exists());
    }

    #[test]
    fn cancelled_upload_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(Uuid::new_v4(), dir.path());
        let shutdown = ShutdownCoordinator::new();
        let cancel = shutdown.cancellation(Duration::from_secs(60));
        shutdown.request_shutdown();
        let id = Uuid::new_v4();

        let err = storage
            .save_file(&cancel, &encryptor(), id, &mut &b"payload"[..])
            .unwrap_err();
        assert_eq!(err.cancelled().map(|c| c.reason), Some(CancelReason::Shutdown));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_root_is_invalid() {
        let storage = LocalStorage::new(Uuid::new_v4(), "");
        assert!(matches!(
            storage.validate(&encryptor()),
            Err(StorageError::Invalid(_))
        ));
    }
}
