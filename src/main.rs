use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use derive_more::{Display, Error, From};
use serde::Serialize;

use dbstream_lib::cli::{Action, BackupArgs, Cli, RestoreArgs};
use dbstream_lib::config::{AppConfig, ConfigError, ConfigLegacyKey};
use dbstream_lib::encryption::FieldEncryptionError;
use dbstream_lib::engines::ToolPaths;
use dbstream_lib::model::Backup;
use dbstream_lib::pipeline::{Pipeline, PipelineError};
use dbstream_lib::secret::SecretKeyManager;
use dbstream_lib::shutdown::ShutdownCoordinator;
use dbstream_lib::storage::{Storage, StorageError};

#[derive(Debug, Display, Error, From)]
enum AppError {
    #[display("{_0}")]
    Config(ConfigError),
    #[display("{_0}")]
    Pipeline(PipelineError),
    #[display("{_0}")]
    Storage(StorageError),
    #[display("Encrypting credentials failed: {_0}")]
    Credentials(FieldEncryptionError),
    #[display("Invalid backup record: {_0}")]
    Record(serde_json::Error),
    #[display("Accessing {} failed: {source}", path.display())]
    #[from(ignore)]
    Io { path: PathBuf, source: io::Error },
    #[display("{_0} of {_1} storages are unusable")]
    #[from(ignore)]
    UnusableStorages(#[error(ignore)] usize, #[error(ignore)] usize),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let mut config = match AppConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Reading the config file failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let tools = config.tools_with(cli.tools.into());

    let secrets = Arc::new(SecretKeyManager::new(&config.secret_key_file));
    if let Err(e) = secrets.migrate_legacy_key(&ConfigLegacyKey::new(&cli.config)) {
        log::error!("Migrating the secret key failed: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = ShutdownCoordinator::new();
    let handler = {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::warn!("Shutdown requested, cancelling running operations");
            shutdown.request_shutdown();
        })
    };
    if let Err(e) = handler {
        log::warn!("Installing the signal handler failed, operations can't be interrupted: {e}");
    }

    let pipeline = Pipeline::new(
        secrets,
        tools.clone(),
        shutdown,
        config.pipeline.clone(),
    );

    let result = match cli.action {
        Action::Backup(args) => backup(&pipeline, &config, args),
        Action::Restore(args) => restore(&pipeline, &config, args),
        Action::EncryptSecrets => encrypt_secrets(&pipeline, &mut config, &cli.config),
        Action::Check => check(&pipeline, &config, &tools),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn backup(pipeline: &Pipeline, config: &AppConfig, args: BackupArgs) -> Result<(), AppError> {
    let database = config.database(args.database)?;
    let backup_config = config.backup_config(database.id)?;
    let storage = config.storage(backup_config.storage_id)?;

    let mut backup = pipeline.start_backup(database, backup_config)?;
    let backup_id = backup.id;
    let result = pipeline.run_backup(&mut backup, database, storage, &mut |mb: u64| {
        log::info!(target: "backup", "Backup {backup_id}: {mb} MB dumped");
    });

    // the record is needed for a restore and documents failures as well
    write_record(&backup, args.output.as_deref())?;
    Ok(result?)
}

fn restore(pipeline: &Pipeline, config: &AppConfig, args: RestoreArgs) -> Result<(), AppError> {
    let record = fs::read(&args.backup).map_err(|source| AppError::Io {
        path: args.backup.clone(),
        source,
    })?;
    let backup: Backup = serde_json::from_slice(&record)?;
    let database = config.database(args.database)?;
    let storage = config.storage(backup.storage_id)?;

    let mut restore = pipeline.start_restore(&backup)?;
    let result = pipeline.run_restore(
        &mut restore,
        &backup,
        database,
        args.source_database.as_deref(),
        storage,
    );

    write_record(&restore, None)?;
    Ok(result?)
}

fn encrypt_secrets(
    pipeline: &Pipeline,
    config: &mut AppConfig,
    path: &Path,
) -> Result<(), AppError> {
    let encryptor = pipeline.encryptor();
    for database in &mut config.databases {
        database.encrypt_sensitive_data(encryptor)?;
    }
    for storage in &mut config.storages {
        storage.encrypt_sensitive_data(encryptor)?;
    }
    config.save(path)?;
    log::info!(
        "Encrypted credentials of {} databases and {} storages in {}",
        config.databases.len(),
        config.storages.len(),
        path.display()
    );
    Ok(())
}

fn check(pipeline: &Pipeline, config: &AppConfig, tools: &ToolPaths) -> Result<(), AppError> {
    let installed = tools.check_installations();
    println!("{}", serde_json::to_string_pretty(&installed)?);

    let encryptor = pipeline.encryptor();
    let mut unusable = 0;
    for storage in &config.storages {
        let result = storage
            .validate(encryptor)
            .and_then(|_| storage.test_connection(encryptor));
        match result {
            Ok(()) => log::info!(target: "storage", "Storage {} is usable", storage.id),
            Err(e) => {
                log::error!(target: "storage", "Storage {} is unusable: {e}", storage.id);
                unusable += 1;
            }
        }
    }

    if unusable > 0 {
        return Err(AppError::UnusableStorages(unusable, config.storages.len()));
    }
    Ok(())
}

fn write_record<T: Serialize>(record: &T, output: Option<&Path>) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(record)?;
    match output {
        Some(path) => fs::write(path, json).map_err(|source| AppError::Io {
            path: path.to_path_buf(),
            source,
        }),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}
