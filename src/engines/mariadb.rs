//! MariaDB dumps via `mariadb-dump`, restored by piping into `mariadb`.
//!
//! Newer clients query catalog columns that old servers lack, so two client
//! generations are installed and the one matching the server is used.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::mysql::{write_defaults_file, ClientOptions};
use super::{
    validate_connection, CommandContext, DatabaseType, EngineAdapter, EngineCommand, EngineError,
    ServerVersion,
};

pub(crate) const DUMP_TOOL: &str = "mariadb-dump";
pub(crate) const RESTORE_TOOL: &str = "mariadb";

/// First server version handled by the modern client.
const MODERN_SINCE: ServerVersion = ServerVersion::new(10, 6);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbDatabase {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub is_tls: bool,
}

/// Installed generations of the MariaDB client tools.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum MariadbClient {
    #[display("legacy")]
    Legacy,
    #[display("modern")]
    Modern,
}

impl MariadbClient {
    pub const ALL: [MariadbClient; 2] = [MariadbClient::Legacy, MariadbClient::Modern];

    pub fn for_server(version: ServerVersion) -> Self {
        if version < MODERN_SINCE {
            Self::Legacy
        } else {
            Self::Modern
        }
    }

    /// Version part of the installation directory.
    pub fn tool_version(self) -> &'static str {
        match self {
            Self::Legacy => "10.5",
            Self::Modern => "11.4",
        }
    }
}

impl MariadbDatabase {
    pub fn client(&self) -> Result<MariadbClient, EngineError> {
        Ok(MariadbClient::for_server(self.version.parse()?))
    }

    fn command(
        &self,
        ctx: &CommandContext<'_>,
        tool: &str,
    ) -> Result<(EngineCommand, MariadbClient), EngineError> {
        self.validate()?;
        let client = self.client()?;
        let program = ctx
            .tools
            .resolve(DatabaseType::Mariadb, client.tool_version(), tool)?;

        let password = ctx.password(&self.password)?;
        let (dir, defaults) = write_defaults_file(&ClientOptions {
            user: &self.username,
            password: &password,
            host: &self.host,
            port: self.port,
        })?;

        let mut command = EngineCommand::new(DatabaseType::Mariadb, program);
        command.arg(format!("--defaults-file={}", defaults.display()));
        command.ephemeral = Some(dir);
        Ok((command, client))
    }

    fn tls_args(&self, client: MariadbClient, command: &mut EngineCommand) {
        match (self.is_tls, client) {
            (true, _) => {
                command.arg("--ssl");
            }
            // 11.4 clients verify TLS by default, even against plain servers
            (false, MariadbClient::Modern) => {
                command.arg("--skip-ssl");
            }
            (false, MariadbClient::Legacy) => {}
        }
    }
}

impl EngineAdapter for MariadbDatabase {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Mariadb
    }

    fn validate(&self) -> Result<(), EngineError> {
        validate_connection(
            DatabaseType::Mariadb,
            &self.host,
            self.port,
            &self.username,
            &self.database,
        )
    }

    fn build_dump_command(&self, ctx: &CommandContext<'_>) -> Result<EngineCommand, EngineError> {
        let (mut command, client) = self.command(ctx, DUMP_TOOL)?;
        command
            .arg("--single-transaction")
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg("--quick")
            .arg("--no-tablespaces")
            .arg("--default-character-set=utf8mb4")
            .arg("--compress");
        self.tls_args(client, &mut command);
        command.arg(&self.database);

        log::debug!(target: "engine::mariadb", "Built {client} {DUMP_TOOL} command for server {} database {}", self.version, self.database);
        Ok(command)
    }

    fn build_restore_command(
        &self,
        ctx: &CommandContext<'_>,
        _source_database: Option<&str>,
    ) -> Result<EngineCommand, EngineError> {
        let (mut command, client) = self.command(ctx, RESTORE_TOOL)?;
        command.arg("--default-character-set=utf8mb4");
        self.tls_args(client, &mut command);
        command.arg(&self.database);

        log::debug!(target: "engine::mariadb", "Built {client} {RESTORE_TOOL} command for server {} database {}", self.version, self.database);
        Ok(command)
    }
}
