//! PostgreSQL dumps in custom format via `pg_dump` and `pg_restore`.

use serde::{Deserialize, Serialize};

use super::{
    credentials_dir, validate_connection, write_private_file, CommandContext, DatabaseType,
    EngineAdapter, EngineCommand, EngineError, ServerVersion,
};

pub(crate) const DUMP_TOOL: &str = "pg_dump";
pub(crate) const RESTORE_TOOL: &str = "pg_restore";
pub(crate) const TOOL_VERSIONS: &[&str] = &["12", "13", "14", "15", "16", "17", "18"];

const CONNECT_TIMEOUT_SECS: &str = "30";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresqlDatabase {
    /// Declared server version, e.g. `16`.
    pub version: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Encrypted field, see [FieldEncryptor](crate::encryption::FieldEncryptor).
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub is_tls: bool,
    /// Schemas to dump, all schemas when empty.
    #[serde(default)]
    pub include_schemas: Vec<String>,
}

impl PostgresqlDatabase {
    /// `pg_dump` must not be older than the server, tools are installed per major version.
    fn tool_version(&self) -> Result<&'static str, EngineError> {
        let version: ServerVersion = self.version.parse()?;
        let major = version.major.to_string();
        TOOL_VERSIONS
            .iter()
            .find(|v| **v == major)
            .copied()
            .ok_or(EngineError::UnsupportedVersion {
                engine: DatabaseType::Postgresql,
                version,
            })
    }

    fn command(&self, ctx: &CommandContext<'_>, tool: &str) -> Result<EngineCommand, EngineError> {
        self.validate()?;
        let program = ctx
            .tools
            .resolve(DatabaseType::Postgresql, self.tool_version()?, tool)?;

        let password = ctx.password(&self.password)?;
        let dir = credentials_dir()?;
        let pgpass = dir.path().join(".pgpass");
        write_private_file(&pgpass, &self.pgpass_line(&password))?;

        let mut command = EngineCommand::new(DatabaseType::Postgresql, program);
        command
            .env("PGPASSFILE", pgpass.to_string_lossy())
            .env("PGCONNECT_TIMEOUT", CONNECT_TIMEOUT_SECS)
            .env("PGSSLMODE", if self.is_tls { "require" } else { "prefer" })
            .arg("--no-password")
            .arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--username={}", self.username))
            .arg(format!("--dbname={}", self.database));
        command.ephemeral = Some(dir);

        Ok(command)
    }

    fn pgpass_line(&self, password: &str) -> String {
        format!(
            "{}:{}:*:{}:{}\n",
            escape_pgpass(&self.host),
            self.port,
            escape_pgpass(&self.username),
            escape_pgpass(password)
        )
    }

    fn schema_args(&self, command: &mut EngineCommand) {
        for schema in &self.include_schemas {
            command.arg(format!("--schema={schema}"));
        }
    }
}

/// `:` and `\` have to be escaped in `.pgpass` fields.
fn escape_pgpass(field: &str) -> String {
    field.replace('\\', "\\\\").replace(':', "\\:")
}

impl EngineAdapter for PostgresqlDatabase {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    fn validate(&self) -> Result<(), EngineError> {
        validate_connection(
            DatabaseType::Postgresql,
            &self.host,
            self.port,
            &self.username,
            &self.database,
        )?;
        if self.include_schemas.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::Validation(
                DatabaseType::Postgresql,
                "schema names must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn build_dump_command(&self, ctx: &CommandContext<'_>) -> Result<EngineCommand, EngineError> {
        let mut command = self.command(ctx, DUMP_TOOL)?;
        // compression happens in the pipeline
        command.arg("--format=custom").arg("--compress=0");
        self.schema_args(&mut command);

        log::debug!(target: "engine::postgresql", "Built {DUMP_TOOL} command for database {}", self.database);
        Ok(command)
    }

    fn build_restore_command(
        &self,
        ctx: &CommandContext<'_>,
        _source_database: Option<&str>,
    ) -> Result<EngineCommand, EngineError> {
        let mut command = self.command(ctx, RESTORE_TOOL)?;
        command
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-acl");
        self.schema_args(&mut command);

        log::debug!(target: "engine::postgresql", "Built {RESTORE_TOOL} command for database {}", self.database);
        Ok(command)
    }
}
