use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use uuid::Uuid;

use crate::engines::ToolPaths;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file, created with defaults if missing.
    #[arg(long, short = 'c', env = "DBSTREAM_CONFIG", default_value = "/etc/dbstream/config.toml")]
    pub config: PathBuf,

    #[command(flatten)]
    pub tools: ToolArgs,

    #[command(subcommand)]
    pub action: Action,
}

/// Installation roots of the client tools, overriding the config file.
#[derive(Args, Debug, Default)]
pub struct ToolArgs {
    /// Directory holding the `postgresql-<version>` installations.
    #[arg(long, env = "POSTGRES_INSTALL_DIR")]
    pub postgres_install_dir: Option<PathBuf>,

    /// Directory holding the `mysql-<version>` installations.
    #[arg(long, env = "MYSQL_INSTALL_DIR")]
    pub mysql_install_dir: Option<PathBuf>,

    /// Directory holding the `mariadb-<version>` installations.
    #[arg(long, env = "MARIADB_INSTALL_DIR")]
    pub mariadb_install_dir: Option<PathBuf>,

    /// Directory holding the `mongodb-<version>` installations.
    #[arg(long, env = "MONGODB_INSTALL_DIR")]
    pub mongodb_install_dir: Option<PathBuf>,
}

impl From<ToolArgs> for ToolPaths {
    fn from(args: ToolArgs) -> Self {
        ToolPaths {
            postgresql: args.postgres_install_dir,
            mysql: args.mysql_install_dir,
            mariadb: args.mariadb_install_dir,
            mongodb: args.mongodb_install_dir,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Stream a backup of a configured database into its storage.
    Backup(BackupArgs),
    /// Restore a completed backup into a configured database.
    Restore(RestoreArgs),
    /// Encrypt plaintext passwords in the config file in place.
    EncryptSecrets,
    /// Report installed client tools and test every storage.
    Check,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Id of the database to back up.
    pub database: Uuid,

    /// Write the backup record as JSON to this file instead of stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Backup record written by the backup command.
    pub backup: PathBuf,

    /// Id of the database to restore into.
    pub database: Uuid,

    /// Database the backup was taken from, if its name differs from the target.
    #[arg(long)]
    pub source_database: Option<String>,
}
