//! MySQL dumps via `mysqldump`, restored by piping into `mysql`.
//!
//! The option file writer is shared with the MariaDB adapter.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::{
    credentials_dir, validate_connection, write_private_file, CommandContext, DatabaseType,
    EngineAdapter, EngineCommand, EngineError, ServerVersion,
};

pub(crate) const DUMP_TOOL: &str = "mysqldump";
pub(crate) const RESTORE_TOOL: &str = "mysql";
pub(crate) const TOOL_VERSIONS: &[&str] = &["5.7", "8.0", "8.4", "9"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MysqlDatabase {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub is_tls: bool,
}

impl MysqlDatabase {
    fn tool_version(&self) -> Result<&'static str, EngineError> {
        let version: ServerVersion = self.version.parse()?;
        match (version.major, version.minor) {
            (5, 7) => Ok("5.7"),
            (8, 0) => Ok("8.0"),
            // innovation releases are dumped with the LTS tools
            (8, 1..=4) => Ok("8.4"),
            (9, _) => Ok("9"),
            _ => Err(EngineError::UnsupportedVersion {
                engine: DatabaseType::Mysql,
                version,
            }),
        }
    }

    fn command(
        &self,
        ctx: &CommandContext<'_>,
        tool: &str,
    ) -> Result<(EngineCommand, &'static str), EngineError> {
        self.validate()?;
        let tool_version = self.tool_version()?;
        let program = ctx.tools.resolve(DatabaseType::Mysql, tool_version, tool)?;

        let password = ctx.password(&self.password)?;
        let (dir, defaults) = write_defaults_file(&ClientOptions {
            user: &self.username,
            password: &password,
            host: &self.host,
            port: self.port,
        })?;

        let mut command = EngineCommand::new(DatabaseType::Mysql, program);
        // must be the first argument
        command.arg(format!("--defaults-file={}", defaults.display()));
        command.ephemeral = Some(dir);
        Ok((command, tool_version))
    }
}

impl EngineAdapter for MysqlDatabase {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    fn validate(&self) -> Result<(), EngineError> {
        validate_connection(
            DatabaseType::Mysql,
            &self.host,
            self.port,
            &self.username,
            &self.database,
        )
    }

    fn build_dump_command(&self, ctx: &CommandContext<'_>) -> Result<EngineCommand, EngineError> {
        let (mut command, tool_version) = self.command(ctx, DUMP_TOOL)?;
        command
            .arg("--single-transaction")
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg("--quick")
            .arg("--no-tablespaces")
            .arg("--set-gtid-purged=OFF")
            .arg("--default-character-set=utf8mb4");
        // `--compress` is deprecated since 8.0.18
        match tool_version {
            "5.7" | "8.0" => command.arg("--compress"),
            _ => command.arg("--compression-algorithms=zlib"),
        };
        if self.is_tls {
            command.arg("--ssl-mode=REQUIRED");
        }
        command.arg(&self.database);

        log::debug!(target: "engine::mysql", "Built {DUMP_TOOL} {tool_version} command for database {}", self.database);
        Ok(command)
    }

    fn build_restore_command(
        &self,
        ctx: &CommandContext<'_>,
        _source_database: Option<&str>,
    ) -> Result<EngineCommand, EngineError> {
        // dumps carry no `USE` statement, they restore into any database
        let (mut command, tool_version) = self.command(ctx, RESTORE_TOOL)?;
        command.arg("--default-character-set=utf8mb4");
        if self.is_tls {
            command.arg("--ssl-mode=REQUIRED");
        }
        command.arg(&self.database);

        log::debug!(target: "engine::mysql", "Built {RESTORE_TOOL} {tool_version} command for database {}", self.database);
        Ok(command)
    }
}

/// `[client]` options of the MySQL family clients.
pub(super) struct ClientOptions<'a> {
    pub user: &'a str,
    pub password: &'a str,
    pub host: &'a str,
    pub port: u16,
}

/// Writes an owner-only option file for `--defaults-file`, keeping the
/// password out of the argument list and the environment.
pub(super) fn write_defaults_file(
    options: &ClientOptions<'_>,
) -> Result<(TempDir, PathBuf), EngineError> {
    let dir = credentials_dir()?;
    let path = dir.path().join("client.cnf");
    let contents = format!(
        "[client]\nuser=\"{}\"\npassword=\"{}\"\nhost=\"{}\"\nport={}\n",
        quote_option(options.user),
        quote_option(options.password),
        quote_option(options.host),
        options.port
    );
    write_private_file(&path, &contents)?;
    Ok((dir, path))
}

fn quote_option(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use uuid::Uuid;

    use super::*;
    use crate::engines::test_support::{arg_value, encryptor, install_tools};
    use crate::engines::ToolPaths;

    fn profile(version: &str) -> MysqlDatabase {
        MysqlDatabase {
            version: version.into(),
            host: "mysql.internal".into(),
            port: 3306,
            username: "root".into(),
            password: "se\"cr\\et".into(),
            database: "shop".into(),
            is_tls: false,
        }
    }

    #[test]
    fn maps_server_versions_to_tools() {
        assert_eq!(profile("5.7").tool_version().unwrap(), "5.7");
        assert_eq!(profile("8.0.36").tool_version().unwrap(), "8.0");
        assert_eq!(profile("8.3").tool_version().unwrap(), "8.4");
        assert_eq!(profile("8.4").tool_version().unwrap(), "8.4");
        assert_eq!(profile("9.1").tool_version().unwrap(), "9");
        assert!(matches!(
            profile("5.6").tool_version(),
            Err(EngineError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn credentials_live_in_defaults_file() {
        let dir = tempfile::tempdir().unwrap();
        install_tools(dir.path(), DatabaseType::Mysql, "8.0", &[DUMP_TOOL]);
        let tools = ToolPaths {
            mysql: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let encryptor = encryptor();
        let ctx = CommandContext {
            database_id: Uuid::new_v4(),
            tools: &tools,
            encryptor: &encryptor,
        };

        let mut db = profile("8.0");
        db.is_tls = true;
        let command = db.build_dump_command(&ctx).unwrap();

        assert!(command.args[0].starts_with("--defaults-file="));
        assert!(command.env.is_empty());
        assert!(command.args.iter().all(|arg| !arg.contains("cr\\et")));
        assert!(command.args.iter().any(|arg| arg == "--single-transaction"));
        assert!(command.args.iter().any(|arg| arg == "--compress"));
        assert!(command.args.iter().any(|arg| arg == "--ssl-mode=REQUIRED"));
        assert_eq!(command.args.last().map(String::as_str), Some("shop"));

        let defaults = PathBuf::from(arg_value(&command, "--defaults-file=").unwrap());
        let contents = fs::read_to_string(&defaults).unwrap();
        assert_eq!(
            contents,
            "[client]\nuser=\"root\"\npassword=\"se\\\"cr\\\\et\"\nhost=\"mysql.internal\"\nport=3306\n"
        );

        drop(command);
        assert!(!defaults.exists());
    }

    #[test]
    fn newer_tools_use_compression_algorithms() {
        let dir = tempfile::tempdir().unwrap();
        install_tools(dir.path(), DatabaseType::Mysql, "8.4", &[DUMP_TOOL, RESTORE_TOOL]);
        let tools = ToolPaths {
            mysql: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let encryptor = encryptor();
        let ctx = CommandContext {
            database_id: Uuid::new_v4(),
            tools: &tools,
            encryptor: &encryptor,
        };

        let db = profile("8.4");
        let dump = db.build_dump_command(&ctx).unwrap();
        assert!(dump.args.iter().any(|arg| arg == "--compression-algorithms=zlib"));
        assert!(!dump.args.iter().any(|arg| arg == "--compress"));

        let restore = db.build_restore_command(&ctx, Some("other")).unwrap();
        assert!(restore.program.ends_with("mysql-8.4/bin/mysql"));
        assert_eq!(restore.args.last().map(String::as_str), Some("shop"));
    }
}
