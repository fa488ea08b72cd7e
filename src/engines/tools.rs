//! Resolution of versioned client tool binaries.
//!
//! Tools live at `<root>/<engine>-<version>/bin/<tool>[.exe]` where `root`
//! is the per-engine installation directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{mariadb, mongodb, mysql, postgresql, DatabaseType, EngineError};

/// Installation roots of the client tools, one per engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub postgresql: Option<PathBuf>,
    pub mysql: Option<PathBuf>,
    pub mariadb: Option<PathBuf>,
    pub mongodb: Option<PathBuf>,
}

impl ToolPaths {
    pub fn root(&self, engine: DatabaseType) -> Option<&Path> {
        match engine {
            DatabaseType::Postgresql => self.postgresql.as_deref(),
            DatabaseType::Mysql => self.mysql.as_deref(),
            DatabaseType::Mariadb => self.mariadb.as_deref(),
            DatabaseType::Mongodb => self.mongodb.as_deref(),
        }
    }

    /// Location of `tool` for `engine` at `version`, whether it exists or not.
    pub fn binary_path(root: &Path, engine: DatabaseType, version: &str, tool: &str) -> PathBuf {
        let tool = if cfg!(windows) {
            format!("{tool}.exe")
        } else {
            tool.to_string()
        };
        root.join(format!("{}-{version}", engine.dir_prefix()))
            .join("bin")
            .join(tool)
    }

    /// Returns the path of an installed tool.
    pub fn resolve(
        &self,
        engine: DatabaseType,
        version: &str,
        tool: &str,
    ) -> Result<PathBuf, EngineError> {
        let root = self.root(engine).ok_or(EngineError::NotInstalled(engine))?;
        let path = Self::binary_path(root, engine, version, tool);
        if !path.is_file() {
            return Err(EngineError::BinaryNotFound(path));
        }

        log::trace!(target: "engine::tools", "Resolved {tool} for {engine} {version}: {}", path.display());
        Ok(path)
    }

    /// Checks every supported tool version and returns the installed ones.
    ///
    /// Missing installations only make the engine version unsupported, they
    /// are logged and never fail.
    pub fn check_installations(&self) -> BTreeMap<DatabaseType, Vec<&'static str>> {
        DatabaseType::ALL
            .into_iter()
            .map(|engine| {
                let installed = supported_tools(engine)
                    .iter()
                    .filter(|(version, tools)| self.is_installed(engine, version, tools))
                    .map(|(version, _)| *version)
                    .collect::<Vec<_>>();

                if installed.is_empty() {
                    log::warn!(target: "engine::tools", "No {engine} client tools installed, {engine} databases are unsupported");
                } else {
                    log::info!(target: "engine::tools", "{engine} client tools installed for versions: {}", installed.join(", "));
                }
                (engine, installed)
            })
            .collect()
    }

    fn is_installed(&self, engine: DatabaseType, version: &str, tools: &[&str]) -> bool {
        let Some(root) = self.root(engine) else {
            return false;
        };

        let missing: Vec<PathBuf> = tools
            .iter()
            .map(|tool| Self::binary_path(root, engine, version, tool))
            .filter(|path| !path.is_file())
            .collect();
        for path in &missing {
            log::warn!(target: "engine::tools", "{engine} {version}: missing {}", path.display());
        }
        missing.is_empty()
    }
}

/// Tool directory versions and the tools each must provide.
fn supported_tools(engine: DatabaseType) -> Vec<(&'static str, [&'static str; 2])> {
    match engine {
        DatabaseType::Postgresql => postgresql::TOOL_VERSIONS
            .iter()
            .map(|v| (*v, [postgresql::DUMP_TOOL, postgresql::RESTORE_TOOL]))
            .collect(),
        DatabaseType::Mysql => mysql::TOOL_VERSIONS
            .iter()
            .map(|v| (*v, [mysql::DUMP_TOOL, mysql::RESTORE_TOOL]))
            .collect(),
        DatabaseType::Mariadb => mariadb::MariadbClient::ALL
            .iter()
            .map(|client| (client.tool_version(), [mariadb::DUMP_TOOL, mariadb::RESTORE_TOOL]))
            .collect(),
        DatabaseType::Mongodb => mongodb::TOOL_VERSIONS
            .iter()
            .map(|v| (*v, [mongodb::DUMP_TOOL, mongodb::RESTORE_TOOL]))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::test_support::install_tools;

    #[test]
    fn binary_layout() {
        let path = ToolPaths::binary_path(
            Path::new("/opt/tools"),
            DatabaseType::Postgresql,
            "16",
            "pg_dump",
        );
        let expected = if cfg!(windows) {
            "/opt/tools/postgresql-16/bin/pg_dump.exe"
        } else {
            "/opt/tools/postgresql-16/bin/pg_dump"
        };
        assert_eq!(path, PathBuf::from(expected));
    }

    #[test]
    fn resolve_requires_root_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = ToolPaths::default();

        let err = tools.resolve(DatabaseType::Mysql, "8.0", "mysqldump").unwrap_err();
        assert!(matches!(err, EngineError::NotInstalled(DatabaseType::Mysql)));

        tools.mysql = Some(dir.path().to_path_buf());
        let err = tools.resolve(DatabaseType::Mysql, "8.0", "mysqldump").unwrap_err();
        assert!(matches!(err, EngineError::BinaryNotFound(_)));

        install_tools(dir.path(), DatabaseType::Mysql, "8.0", &["mysqldump"]);
        assert!(tools.resolve(DatabaseType::Mysql, "8.0", "mysqldump").is_ok());
    }

    #[test]
    fn missing_installations_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        install_tools(dir.path(), DatabaseType::Postgresql, "16", &["pg_dump", "pg_restore"]);
        // only half of the mysql tools
        install_tools(dir.path(), DatabaseType::Mysql, "8.0", &["mysqldump"]);

        let tools = ToolPaths {
            postgresql: Some(dir.path().to_path_buf()),
            mysql: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let installed = tools.check_installations();

        assert_eq!(installed[&DatabaseType::Postgresql], vec!["16"]);
        assert!(installed[&DatabaseType::Mysql].is_empty());
        assert!(installed[&DatabaseType::Mongodb].is_empty());
    }
}
