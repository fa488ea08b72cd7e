//! MongoDB archives via `mongodump --archive` and `mongorestore --archive`.

use serde::{Deserialize, Serialize};

use super::{
    credentials_dir, validate_connection, write_private_file, CommandContext, DatabaseType,
    EngineAdapter, EngineCommand, EngineError, ServerVersion,
};

pub(crate) const DUMP_TOOL: &str = "mongodump";
pub(crate) const RESTORE_TOOL: &str = "mongorestore";
pub(crate) const TOOL_VERSIONS: &[&str] = &["4.4", "5.0", "6.0", "7.0", "8.0"];

fn default_auth_database() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MongodbDatabase {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Database the user is defined in.
    #[serde(default = "default_auth_database")]
    pub auth_database: String,
    #[serde(default)]
    pub is_tls: bool,
}

impl MongodbDatabase {
    fn tool_version(&self) -> Result<&'static str, EngineError> {
        let version: ServerVersion = self.version.parse()?;
        match version.major {
            4 => Ok("4.4"),
            5 => Ok("5.0"),
            6 => Ok("6.0"),
            7 => Ok("7.0"),
            8 => Ok("8.0"),
            _ => Err(EngineError::UnsupportedVersion {
                engine: DatabaseType::Mongodb,
                version,
            }),
        }
    }

    fn command(&self, ctx: &CommandContext<'_>, tool: &str) -> Result<EngineCommand, EngineError> {
        self.validate()?;
        let program = ctx
            .tools
            .resolve(DatabaseType::Mongodb, self.tool_version()?, tool)?;

        let password = ctx.password(&self.password)?;
        let dir = credentials_dir()?;
        let config = dir.path().join("mongo.yaml");
        write_private_file(&config, &format!("password: \"{}\"\n", quote_yaml(&password)))?;

        let mut command = EngineCommand::new(DatabaseType::Mongodb, program);
        command
            .arg(format!("--config={}", config.display()))
            .arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--username={}", self.username))
            .arg(format!("--authenticationDatabase={}", self.auth_database))
            .arg("--archive");
        if self.is_tls {
            command.arg("--ssl");
        }
        command.ephemeral = Some(dir);
        Ok(command)
    }
}

/// Escapes a value for a double quoted YAML scalar.
fn quote_yaml(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl EngineAdapter for MongodbDatabase {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Mongodb
    }

    fn validate(&self) -> Result<(), EngineError> {
        validate_connection(
            DatabaseType::Mongodb,
            &self.host,
            self.port,
            &self.username,
            &self.database,
        )?;
        if self.auth_database.trim().is_empty() {
            return Err(EngineError::Validation(
                DatabaseType::Mongodb,
                "authentication database is required".into(),
            ));
        }
        Ok(())
    }

    fn build_dump_command(&self, ctx: &CommandContext<'_>) -> Result<EngineCommand, EngineError> {
        let mut command = self.command(ctx, DUMP_TOOL)?;
        command.arg(format!("--db={}", self.database));

        log::debug!(target: "engine::mongodb", "Built {DUMP_TOOL} command for database {}", self.database);
        Ok(command)
    }

    fn build_restore_command(
        &self,
        ctx: &CommandContext<'_>,
        source_database: Option<&str>,
    ) -> Result<EngineCommand, EngineError> {
        let mut command = self.command(ctx, RESTORE_TOOL)?;
        let source = source_database.unwrap_or(&self.database);
        command
            .arg("--drop")
            .arg(format!("--nsInclude={source}.*"));
        if source != self.database {
            log::info!(target: "engine::mongodb", "Restoring namespace {source} into {}", self.database);
            command
                .arg(format!("--nsFrom={source}.*"))
                .arg(format!("--nsTo={}.*", self.database));
        }

        log::debug!(target: "engine::mongodb", "Built {RESTORE_TOOL} command for database {}", self.database);
        Ok(command)
    }
}
