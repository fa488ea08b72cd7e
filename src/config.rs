//! TOML configuration of the `dbstream` binary.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engines::{Database, ToolPaths};
use crate::model::BackupConfig;
use crate::pipeline::PipelineSettings;
use crate::secret::LegacyKeyStore;
use crate::storage::LocalStorage;

/// Key of a secret stored in the config file by older releases.
const LEGACY_SECRET_KEY: &str = "secret_key";

#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("Accessing the config file {} failed: {source}", path.display())]
    #[from(ignore)]
    Io { path: PathBuf, source: io::Error },
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
    #[display("Serializing the config failed: {_0}")]
    Serialize(toml::ser::Error),
    #[display("No database {_0} configured")]
    #[from(ignore)]
    UnknownDatabase(#[error(ignore)] Uuid),
    #[display("No storage {_0} configured")]
    #[from(ignore)]
    UnknownStorage(#[error(ignore)] Uuid),
    #[display("No backup configuration for database {_0}")]
    #[from(ignore)]
    NoBackupConfig(#[error(ignore)] Uuid),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// File holding the master secret, created on first use.
    pub secret_key_file: PathBuf,
    /// Installation roots of the engine client tools.
    pub tools: ToolPaths,
    pub pipeline: PipelineSettings,
    pub storages: Vec<LocalStorage>,
    pub databases: Vec<Database>,
    pub backups: Vec<BackupConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            secret_key_file: PathBuf::from("/var/lib/dbstream/secret.key"),
            tools: ToolPaths::default(),
            pipeline: PipelineSettings::default(),
            storages: Vec::new(),
            databases: Vec::new(),
            backups: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Reads the config at `path`, writing the default config there first
    /// if it doesn't exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "config", "Writing default config to {} because it doesn't exist yet", path.display());
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    log::warn!(target: "config", "Writing default config failed: {e}");
                }
                Ok(config)
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        write(path, &content)
    }

    /// Installation roots to use for this run. Roots given on the command
    /// line win over the config file, which itself is left untouched.
    pub fn tools_with(&self, overrides: ToolPaths) -> ToolPaths {
        let ToolPaths {
            postgresql,
            mysql,
            mariadb,
            mongodb,
        } = overrides;
        ToolPaths {
            postgresql: postgresql.or_else(|| self.tools.postgresql.clone()),
            mysql: mysql.or_else(|| self.tools.mysql.clone()),
            mariadb: mariadb.or_else(|| self.tools.mariadb.clone()),
            mongodb: mongodb.or_else(|| self.tools.mongodb.clone()),
        }
    }

    pub fn database(&self, id: Uuid) -> Result<&Database, ConfigError> {
        self.databases
            .iter()
            .find(|db| db.id == id)
            .ok_or(ConfigError::UnknownDatabase(id))
    }

    pub fn storage(&self, id: Uuid) -> Result<&LocalStorage, ConfigError> {
        self.storages
            .iter()
            .find(|storage| storage.id == id)
            .ok_or(ConfigError::UnknownStorage(id))
    }

    pub fn backup_config(&self, database_id: Uuid) -> Result<&BackupConfig, ConfigError> {
        self.backups
            .iter()
            .find(|config| config.database_id == database_id)
            .ok_or(ConfigError::NoBackupConfig(database_id))
    }
}

fn write(path: &Path, content: &str) -> Result<(), ConfigError> {
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// A master secret kept in the `secret_key` entry of the config file.
pub struct ConfigLegacyKey<'a> {
    path: &'a Path,
}

impl<'a> ConfigLegacyKey<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }

    fn table(&self) -> Result<Option<toml::Table>, ConfigError> {
        match fs::read_to_string(self.path) {
            Ok(content) => Ok(Some(toml::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Io {
                path: self.path.to_path_buf(),
                source,
            }),
        }
    }
}

impl LegacyKeyStore for ConfigLegacyKey<'_> {
    type Error = ConfigError;

    fn load_legacy_key(&self) -> Result<Option<String>, Self::Error> {
        Ok(self.table()?.and_then(|table| {
            table
                .get(LEGACY_SECRET_KEY)
                .and_then(toml::Value::as_str)
                .map(str::to_string)
        }))
    }

    fn delete_legacy_key(&self) -> Result<(), Self::Error> {
        let Some(mut table) = self.table()? else {
            return Ok(());
        };
        if table.remove(LEGACY_SECRET_KEY).is_some() {
            write(self.path, &toml::to_string_pretty(&table)?)?;
        }
        Ok(())
    }
}
