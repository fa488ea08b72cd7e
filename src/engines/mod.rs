//! Engine adapters translating a database connection profile into dump and
//! restore invocations of the engine's own client tools.
//!
//! Currently the following engines are implemented:
//!
//! - [PostgresqlDatabase]: `pg_dump` / `pg_restore` in custom format.
//! - [MysqlDatabase]: `mysqldump` / `mysql`.
//! - [MariadbDatabase]: `mariadb-dump` / `mariadb`, picking the client
//!   generation matching the server.
//! - [MongodbDatabase]: `mongodump` / `mongorestore` archives.

pub mod classify;
pub mod mariadb;
pub mod mongodb;
pub mod mysql;
pub mod postgresql;
pub mod tools;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use uuid::Uuid;

use crate::encryption::{FieldEncryptionError, FieldEncryptor};

pub use classify::{ErrorKind, ExitInfo, ProcessFailure};
pub use mariadb::{MariadbClient, MariadbDatabase};
pub use mongodb::MongodbDatabase;
pub use mysql::MysqlDatabase;
pub use postgresql::PostgresqlDatabase;
pub use tools::ToolPaths;

/// Discriminator of [DatabaseProfile], the dispatch key for adapter selection.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[display("PostgreSQL")]
    Postgresql,
    #[display("MySQL")]
    Mysql,
    #[display("MariaDB")]
    Mariadb,
    #[display("MongoDB")]
    Mongodb,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 4] = [
        DatabaseType::Postgresql,
        DatabaseType::Mysql,
        DatabaseType::Mariadb,
        DatabaseType::Mongodb,
    ];

    /// Prefix of the versioned installation directories.
    pub fn dir_prefix(self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Mongodb => "mongodb",
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum EngineError {
    /// The connection profile is incomplete.
    #[display("Invalid {_0} database configuration: {_1}")]
    #[from(ignore)]
    Validation(#[error(ignore)] DatabaseType, #[error(ignore)] String),
    #[display("Invalid server version: {_0:?}")]
    #[from(ignore)]
    InvalidVersion(#[error(ignore)] String),
    #[display("{engine} server version {version} is not supported")]
    #[from(ignore)]
    UnsupportedVersion {
        engine: DatabaseType,
        version: ServerVersion,
    },
    #[display("No installation directory configured for {_0} client tools")]
    #[from(ignore)]
    NotInstalled(#[error(ignore)] DatabaseType),
    #[display("Client tool not found: {}", _0.display())]
    #[from(ignore)]
    BinaryNotFound(#[error(ignore)] PathBuf),
    #[display("Decrypting database credentials failed: {_0}")]
    Credentials(FieldEncryptionError),
    #[display("Writing the transient credentials file failed: {_0}")]
    CredentialFile(io::Error),
}

/// Server version as declared in the connection profile, e.g. `16` or `10.6`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{major}.{minor}")]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ServerVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = match parts.next() {
            Some(minor) => minor.parse().map_err(|_| invalid())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

/// Everything an adapter needs besides the profile to build a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    /// Item id the profile's credentials are encrypted under.
    pub database_id: Uuid,
    pub tools: &'a ToolPaths,
    pub encryptor: &'a FieldEncryptor,
}

impl CommandContext<'_> {
    fn password(&self, stored: &str) -> Result<String, EngineError> {
        Ok(self.encryptor.decrypt(self.database_id, stored)?)
    }
}

/// A runnable dump or restore invocation.
///
/// Credentials never appear in `args` or `env`, they live in files inside
/// `ephemeral` which is removed when the command is dropped.
#[derive(Debug)]
pub struct EngineCommand {
    pub engine: DatabaseType,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub ephemeral: Option<TempDir>,
}

impl EngineCommand {
    pub fn new(engine: DatabaseType, program: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            ephemeral: None,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.env.iter().map(|(k, v)| (k, v)));
        command
    }
}

/// Per-engine dump/restore command construction and failure classification.
pub trait EngineAdapter {
    fn engine(&self) -> DatabaseType;

    /// Rejects incomplete profiles before any process is started.
    fn validate(&self) -> Result<(), EngineError>;

    fn build_dump_command(&self, ctx: &CommandContext<'_>) -> Result<EngineCommand, EngineError>;

    /// `source_database` is the name the dump was taken from, if it differs
    /// from the profile's database the adapter remaps where it can.
    fn build_restore_command(
        &self,
        ctx: &CommandContext<'_>,
        source_database: Option<&str>,
    ) -> Result<EngineCommand, EngineError>;

    fn classify_failure(&self, exit: &ExitInfo, diagnostics: &str) -> ProcessFailure {
        classify::classify(self.engine(), exit, diagnostics)
    }
}

/// Exactly one engine profile, selected by the `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseProfile {
    Postgresql(PostgresqlDatabase),
    Mysql(MysqlDatabase),
    Mariadb(MariadbDatabase),
    Mongodb(MongodbDatabase),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub id: Uuid,
    pub name: String,
    pub profile: DatabaseProfile,
}

impl Database {
    pub fn database_type(&self) -> DatabaseType {
        self.adapter().engine()
    }

    pub fn adapter(&self) -> &dyn EngineAdapter {
        match &self.profile {
            DatabaseProfile::Postgresql(db) => db,
            DatabaseProfile::Mysql(db) => db,
            DatabaseProfile::Mariadb(db) => db,
            DatabaseProfile::Mongodb(db) => db,
        }
    }

    /// Name of the database inside the server.
    pub fn database_name(&self) -> &str {
        match &self.profile {
            DatabaseProfile::Postgresql(db) => &db.database,
            DatabaseProfile::Mysql(db) => &db.database,
            DatabaseProfile::Mariadb(db) => &db.database,
            DatabaseProfile::Mongodb(db) => &db.database,
        }
    }

    /// Encrypts the profile's password in place with the database id as item id.
    pub fn encrypt_sensitive_data(
        &mut self,
        encryptor: &FieldEncryptor,
    ) -> Result<(), FieldEncryptionError> {
        let password = match &mut self.profile {
            DatabaseProfile::Postgresql(db) => &mut db.password,
            DatabaseProfile::Mysql(db) => &mut db.password,
            DatabaseProfile::Mariadb(db) => &mut db.password,
            DatabaseProfile::Mongodb(db) => &mut db.password,
        };
        *password = encryptor.encrypt(self.id, password)?;
        Ok(())
    }

    pub fn command_context<'a>(
        &self,
        tools: &'a ToolPaths,
        encryptor: &'a FieldEncryptor,
    ) -> CommandContext<'a> {
        CommandContext {
            database_id: self.id,
            tools,
            encryptor,
        }
    }
}

/// Shared connection checks of all profiles.
fn validate_connection(
    engine: DatabaseType,
    host: &str,
    port: u16,
    username: &str,
    database: &str,
) -> Result<(), EngineError> {
    let missing = |what: &str| EngineError::Validation(engine, format!("{what} is required"));
    if host.trim().is_empty() {
        return Err(missing("host"));
    }
    if port == 0 {
        return Err(EngineError::Validation(engine, "port must not be 0".into()));
    }
    if username.trim().is_empty() {
        return Err(missing("username"));
    }
    if database.trim().is_empty() {
        return Err(missing("database name"));
    }
    Ok(())
}

/// Creates the directory holding transient credential files.
fn credentials_dir() -> Result<TempDir, EngineError> {
    Ok(tempfile::Builder::new()
        .prefix("dbstream-credentials-")
        .tempdir()?)
}

/// Writes a file only the current user can read.
fn write_private_file(path: &Path, contents: &str) -> Result<(), EngineError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::secret::{SecretKey, SecretKeyManager};

    pub fn encryptor() -> FieldEncryptor {
        FieldEncryptor::new(Arc::new(SecretKeyManager::with_key(SecretKey::generate())))
    }

    /// Creates empty tool binaries below `root` for `engine` at `version`.
    pub fn install_tools(root: &Path, engine: DatabaseType, version: &str, tools: &[&str]) {
        for tool in tools {
            let path = ToolPaths::binary_path(root, engine, version, tool);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "").unwrap();
        }
    }

    pub fn arg_value<'a>(command: &'a EngineCommand, prefix: &str) -> Option<&'a str> {
        command.args.iter().find_map(|arg| arg.strip_prefix(prefix))
    }
}
