//! Ownership of the process-wide master secret.
//!
//! The secret is generated once, persisted to a single owner-only file and
//! cached for the lifetime of the process. Replacing the file while the
//! process runs has no effect until restart.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use once_cell::sync::OnceCell;
use uuid::Uuid;
use zeroize::Zeroize;

/// The master secret every encryption key is derived from.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(String);

impl SecretKey {
    /// Two concatenated random UUIDs, 64 hex characters.
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecretKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Previous storage location of the secret, the relational catalog.
pub trait LegacyKeyStore {
    type Error: fmt::Display;

    /// Returns the stored secret, if any.
    fn load_legacy_key(&self) -> Result<Option<String>, Self::Error>;

    fn delete_legacy_key(&self) -> Result<(), Self::Error>;
}

#[derive(Debug, Display, Error)]
pub enum SecretKeyError {
    #[display("Accessing the secret key file {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    #[display("Secret key file {} is empty", _0.display())]
    EmptyKeyFile(#[error(ignore)] PathBuf),
    #[display("Legacy secret key store failed: {_0}")]
    LegacyStore(#[error(ignore)] String),
    /// Migration has to happen before anything used the cached key.
    #[display("Secret key was already loaded, refusing to migrate the legacy key")]
    AlreadyLoaded,
}

/// Loads, generates and caches the master secret.
#[derive(Debug)]
pub struct SecretKeyManager {
    path: PathBuf,
    cached: OnceCell<SecretKey>,
}

impl SecretKeyManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: OnceCell::new(),
        }
    }

    /// A manager that never touches the filesystem.
    pub fn with_key(key: SecretKey) -> Self {
        Self {
            path: PathBuf::new(),
            cached: OnceCell::with_value(key),
        }
    }

    /// Returns the cached secret, reading or creating the key file on the
    /// first call.
    pub fn get_secret_key(&self) -> Result<&SecretKey, SecretKeyError> {
        self.cached.get_or_try_init(|| self.load_or_generate())
    }

    /// Moves a secret found in the legacy store into the key file.
    ///
    /// Must run once at startup before any encryption or decryption. Does
    /// nothing when the legacy store holds no key.
    pub fn migrate_legacy_key<S: LegacyKeyStore>(&self, store: &S) -> Result<(), SecretKeyError> {
        let legacy = store
            .load_legacy_key()
            .map_err(|e| SecretKeyError::LegacyStore(e.to_string()))?;
        let Some(legacy) = legacy else {
            log::debug!(target: "secret", "No legacy secret key found, nothing to migrate");
            return Ok(());
        };

        if self.cached.get().is_some() {
            return Err(SecretKeyError::AlreadyLoaded);
        }

        let legacy = legacy.trim();
        if legacy.is_empty() {
            log::warn!(target: "secret", "Legacy secret key is empty, skipping migration");
        } else {
            log::info!(target: "secret", "Migrating legacy secret key to {}", self.path.display());
            write_key_file(&self.path, legacy, true)?;
        }

        store
            .delete_legacy_key()
            .map_err(|e| SecretKeyError::LegacyStore(e.to_string()))?;
        log::info!(target: "secret", "Removed legacy secret key from the catalog");

        Ok(())
    }

    fn load_or_generate(&self) -> Result<SecretKey, SecretKeyError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let key = content.trim();
                if key.is_empty() {
                    return Err(SecretKeyError::EmptyKeyFile(self.path.clone()));
                }
                log::debug!(target: "secret", "Loaded secret key from {}", self.path.display());
                Ok(SecretKey(key.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!(target: "secret", "Generating new secret key at {}", self.path.display());
                let key = SecretKey::generate();
                write_key_file(&self.path, key.expose(), false)?;
                Ok(key)
            }
            Err(source) => Err(SecretKeyError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn write_key_file(path: &Path, key: &str, overwrite: bool) -> Result<(), SecretKeyError> {
    let io_err = |source| SecretKeyError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_err)?;
    // `mode` only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }
    file.write_all(key.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::convert::Infallible;

    use super::*;

    struct Catalog(RefCell<Option<String>>);

    impl LegacyKeyStore for Catalog {
        type Error = Infallible;

        fn load_legacy_key(&self) -> Result<Option<String>, Self::Error> {
            Ok(self.0.borrow().clone())
        }

        fn delete_legacy_key(&self) -> Result<(), Self::Error> {
            self.0.borrow_mut().take();
            Ok(())
        }
    }

    #[test]
    fn generates_once_and_reuses_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/secret.key");

        let first = SecretKeyManager::new(&path);
        let key = first.get_secret_key().unwrap().clone();
        assert_eq!(key.expose().len(), 64);
        assert_eq!(first.get_secret_key().unwrap(), &key);

        let second = SecretKeyManager::new(&path);
        assert_eq!(second.get_secret_key().unwrap(), &key);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        SecretKeyManager::new(&path).get_secret_key().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn cached_key_survives_file_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let manager = SecretKeyManager::new(&path);
        let key = manager.get_secret_key().unwrap().clone();

        fs::write(&path, "replaced").unwrap();

        assert_eq!(manager.get_secret_key().unwrap(), &key);
    }

    #[test]
    fn empty_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        fs::write(&path, "  \n").unwrap();

        let err = SecretKeyManager::new(&path).get_secret_key().unwrap_err();
        assert!(matches!(err, SecretKeyError::EmptyKeyFile(_)));
    }

    #[test]
    fn migrates_legacy_key_and_deletes_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let catalog = Catalog(RefCell::new(Some("legacy-secret".into())));

        let manager = SecretKeyManager::new(&path);
        manager.migrate_legacy_key(&catalog).unwrap();

        assert!(catalog.0.borrow().is_none());
        assert_eq!(manager.get_secret_key().unwrap().expose(), "legacy-secret");

        // second run is a no-op
        manager.migrate_legacy_key(&catalog).unwrap();
    }

    #[test]
    fn migration_after_load_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecretKeyManager::new(dir.path().join("secret.key"));
        manager.get_secret_key().unwrap();

        let catalog = Catalog(RefCell::new(Some("legacy-secret".into())));
        let err = manager.migrate_legacy_key(&catalog).unwrap_err();
        assert!(matches!(err, SecretKeyError::AlreadyLoaded));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = SecretKey::from("super-secret".to_string());
        assert!(!format!("{key:?}").contains("super-secret"));
    }
}
