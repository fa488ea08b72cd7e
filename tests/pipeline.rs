#![cfg(unix)]

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dbstream_lib::encryption::FieldEncryptor;
use dbstream_lib::engines::{
    Database, DatabaseProfile, DatabaseType, EngineCommand, MariadbClient, MariadbDatabase,
    MysqlDatabase, ToolPaths,
};
use dbstream_lib::model::{Backup, BackupConfig, EncryptionMode, OperationStatus};
use dbstream_lib::pipeline::{Pipeline, PipelineError, PipelineSettings};
use dbstream_lib::secret::{SecretKey, SecretKeyManager};
use dbstream_lib::shutdown::{Cancellation, ShutdownCoordinator};
use dbstream_lib::storage::{LocalStorage, Storage, StorageError};
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn pipeline(tools: ToolPaths, shutdown: ShutdownCoordinator) -> Pipeline {
    Pipeline::new(
        Arc::new(SecretKeyManager::with_key(SecretKey::generate())),
        tools,
        shutdown,
        PipelineSettings {
            poll_interval_ms: 10,
            ..Default::default()
        },
    )
}

/// A pipeline downloading restores into `scratch`.
fn scratch_pipeline(scratch: &Path, shutdown: ShutdownCoordinator) -> Pipeline {
    Pipeline::new(
        Arc::new(SecretKeyManager::with_key(SecretKey::generate())),
        ToolPaths::default(),
        shutdown,
        PipelineSettings {
            poll_interval_ms: 10,
            temp_dir: Some(scratch.to_path_buf()),
            ..Default::default()
        },
    )
}

fn is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}

/// Local storage whose downloads request a shutdown after their first read.
struct InterruptedDownloads {
    inner: LocalStorage,
    shutdown: ShutdownCoordinator,
}

struct InterruptingReader {
    inner: Box<dyn Read + Send>,
    shutdown: ShutdownCoordinator,
}

impl Read for InterruptingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.shutdown.request_shutdown();
        Ok(read)
    }
}

impl Storage for InterruptedDownloads {
    fn save_file(
        &self,
        cancel: &Cancellation,
        encryptor: &FieldEncryptor,
        backup_id: Uuid,
        reader: &mut dyn Read,
    ) -> Result<(), StorageError> {
        self.inner.save_file(cancel, encryptor, backup_id, reader)
    }

    fn get_file(
        &self,
        encryptor: &FieldEncryptor,
        backup_id: Uuid,
    ) -> Result<Box<dyn Read + Send>, StorageError> {
        Ok(Box::new(InterruptingReader {
            inner: self.inner.get_file(encryptor, backup_id)?,
            shutdown: self.shutdown.clone(),
        }))
    }

    fn delete_file(&self, encryptor: &FieldEncryptor, backup_id: Uuid) -> Result<(), StorageError> {
        self.inner.delete_file(encryptor, backup_id)
    }

    fn validate(&self, encryptor: &FieldEncryptor) -> Result<(), StorageError> {
        self.inner.validate(encryptor)
    }

    fn test_connection(&self, encryptor: &FieldEncryptor) -> Result<(), StorageError> {
        self.inner.test_connection(encryptor)
    }

    fn hide_sensitive_data(&mut self) {
        self.inner.hide_sensitive_data()
    }

    fn encrypt_sensitive_data(&mut self, encryptor: &FieldEncryptor) -> Result<(), StorageError> {
        self.inner.encrypt_sensitive_data(encryptor)
    }
}

fn mysql(version: &str) -> MysqlDatabase {
    MysqlDatabase {
        version: version.into(),
        host: "db.internal".into(),
        port: 3306,
        username: "backup".into(),
        password: "s3cret".into(),
        database: "shop".into(),
        is_tls: false,
    }
}

fn shell(script: &str) -> EngineCommand {
    let mut command = EngineCommand::new(DatabaseType::Mysql, "sh");
    command.arg("-c").arg(script);
    command
}

fn install_script(root: &Path, dir: &str, tool: &str, script: &str) {
    let bin = root.join(dir).join("bin");
    fs::create_dir_all(&bin).unwrap();
    let path = bin.join(tool);
    fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn backup_and_restore(encryption: EncryptionMode) {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(Uuid::new_v4(), dir.path().join("store"));
    fs::create_dir(&storage.root).unwrap();
    let restored = dir.path().join("restored.sql");
    let pipeline = pipeline(ToolPaths::default(), ShutdownCoordinator::new());
    let adapter = mysql("8.0");

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, encryption);
    pipeline
        .run_backup_command(&mut backup, &adapter, shell("printf abc"), &storage, &mut |_| {})
        .unwrap();
    assert_eq!(backup.status, OperationStatus::Completed);
    assert!(backup.fail_message.is_none());

    let mut restore = pipeline.start_restore(&backup).unwrap();
    let command = shell(&format!("cat > {}", restored.display()));
    pipeline
        .run_restore_command(&mut restore, &backup, &adapter, command, &storage)
        .unwrap();

    assert_eq!(restore.status, OperationStatus::Completed);
    assert_eq!(fs::read_to_string(&restored).unwrap(), "abc");
}

#[test]
fn plain_backup_restores() {
    backup_and_restore(EncryptionMode::None);
}

#[test]
fn encrypted_backup_restores() {
    backup_and_restore(EncryptionMode::Encrypted);
}

#[test]
fn encrypted_object_is_not_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(Uuid::new_v4(), dir.path());
    let pipeline = pipeline(ToolPaths::default(), ShutdownCoordinator::new());

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::Encrypted);
    pipeline
        .run_backup_command(&mut backup, &mysql("8.0"), shell("printf abc"), &storage, &mut |_| {})
        .unwrap();

    let stored = fs::read(storage.object_path(backup.id)).unwrap();
    // neither gzip nor the dump itself is visible
    assert_ne!(&stored[..2], &[0x1f, 0x8b]);
    assert!(!stored.windows(3).any(|w| w == b"abc"));
}

#[test]
fn lost_encryption_metadata_never_restores_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(Uuid::new_v4(), dir.path());
    let marker = dir.path().join("restore-started");
    let pipeline = pipeline(ToolPaths::default(), ShutdownCoordinator::new());
    let adapter = mysql("8.0");

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::Encrypted);
    pipeline
        .run_backup_command(&mut backup, &adapter, shell("printf abc"), &storage, &mut |_| {})
        .unwrap();
    backup.encryption_salt = None;
    backup.encryption_iv = None;

    let mut restore = pipeline.start_restore(&backup).unwrap();
    let command = shell(&format!("touch {}; cat > /dev/null", marker.display()));
    let err = pipeline
        .run_restore_command(&mut restore, &backup, &adapter, command, &storage)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Metadata(_)), "got {err:?}");
    assert_eq!(restore.status, OperationStatus::Failed);
    assert!(!marker.exists());
}

#[test]
fn shutdown_cancels_running_backup_without_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(Uuid::new_v4(), dir.path());
    let shutdown = ShutdownCoordinator::new();
    let pipeline = pipeline(ToolPaths::default(), shutdown.clone());

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::Encrypted);
    let err = pipeline
        .run_backup_command(
            &mut backup,
            &mysql("8.0"),
            shell("exec yes dbstream"),
            &storage,
            &mut |_| shutdown.request_shutdown(),
        )
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled(_)), "got {err:?}");
    assert_eq!(backup.status, OperationStatus::Cancelled);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn configured_database_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tools = dir.path().join("tools");
    let restored = dir.path().join("restored.sql");
    let arguments = dir.path().join("dump-arguments");
    install_script(
        &tools,
        "mysql-8.0",
        "mysqldump",
        &format!("echo \"$@\" > {}\nprintf 'CREATE TABLE orders (id int);'", arguments.display()),
    );
    install_script(&tools, "mysql-8.0", "mysql", &format!("cat > {}", restored.display()));

    let storage = LocalStorage::new(Uuid::new_v4(), dir.path().join("store"));
    fs::create_dir(&storage.root).unwrap();
    let pipeline = pipeline(
        ToolPaths {
            mysql: Some(tools),
            ..Default::default()
        },
        ShutdownCoordinator::new(),
    );
    let mut database = Database {
        id: Uuid::new_v4(),
        name: "shop".into(),
        profile: DatabaseProfile::Mysql(mysql("8.0")),
    };
    database.encrypt_sensitive_data(pipeline.encryptor()).unwrap();
    let config = BackupConfig {
        database_id: database.id,
        is_backups_enabled: true,
        storage_id: storage.id,
        encryption: EncryptionMode::Encrypted,
    };

    let mut backup = pipeline.start_backup(&database, &config).unwrap();
    pipeline
        .run_backup(&mut backup, &database, &storage, &mut |_| {})
        .unwrap();
    let dump_arguments = fs::read_to_string(&arguments).unwrap();
    assert!(dump_arguments.starts_with("--defaults-file="));
    assert!(dump_arguments.trim_end().ends_with("shop"));
    assert!(!dump_arguments.contains("s3cret"));

    let mut restore = pipeline.start_restore(&backup).unwrap();
    pipeline
        .run_restore(&mut restore, &backup, &database, None, &storage)
        .unwrap();
    assert_eq!(
        fs::read_to_string(&restored).unwrap(),
        "CREATE TABLE orders (id int);"
    );
}

#[test]
fn mariadb_client_follows_server_version() {
    let profile = |version: &str| MariadbDatabase {
        version: version.into(),
        host: "localhost".into(),
        port: 3306,
        username: "root".into(),
        password: String::new(),
        database: "app".into(),
        is_tls: false,
    };

    assert_eq!(profile("5.5").client().unwrap(), MariadbClient::Legacy);
    assert_eq!(profile("10.5").client().unwrap(), MariadbClient::Legacy);
    assert_eq!(profile("10.6").client().unwrap(), MariadbClient::Modern);
    assert_eq!(profile("11.4").client().unwrap(), MariadbClient::Modern);
}

/// Storage under `dir/store` and an empty scratch dir under `dir/scratch`.
fn restore_dirs(dir: &Path) -> (LocalStorage, std::path::PathBuf) {
    let storage = LocalStorage::new(Uuid::new_v4(), dir.join("store"));
    fs::create_dir(&storage.root).unwrap();
    let scratch = dir.join("scratch");
    fs::create_dir(&scratch).unwrap();
    (storage, scratch)
}

#[test]
fn successful_restore_leaves_no_download_behind() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, scratch) = restore_dirs(dir.path());
    let pipeline = scratch_pipeline(&scratch, ShutdownCoordinator::new());
    let adapter = mysql("8.0");

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::None);
    pipeline
        .run_backup_command(&mut backup, &adapter, shell("printf abc"), &storage, &mut |_| {})
        .unwrap();

    let mut restore = pipeline.start_restore(&backup).unwrap();
    pipeline
        .run_restore_command(&mut restore, &backup, &adapter, shell("cat > /dev/null"), &storage)
        .unwrap();

    assert_eq!(restore.status, OperationStatus::Completed);
    assert!(is_empty(&scratch));
}

#[test]
fn failed_restore_leaves_no_download_behind() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, scratch) = restore_dirs(dir.path());
    let pipeline = scratch_pipeline(&scratch, ShutdownCoordinator::new());
    let adapter = mysql("8.0");

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::None);
    pipeline
        .run_backup_command(&mut backup, &adapter, shell("printf abc"), &storage, &mut |_| {})
        .unwrap();

    let mut restore = pipeline.start_restore(&backup).unwrap();
    let command = shell("cat > /dev/null; exit 1");
    let err = pipeline
        .run_restore_command(&mut restore, &backup, &adapter, command, &storage)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Process(_)), "got {err:?}");
    assert_eq!(restore.status, OperationStatus::Failed);
    assert!(is_empty(&scratch));
}

#[test]
fn shutdown_during_download_cancels_before_the_tool_starts() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, scratch) = restore_dirs(dir.path());
    let shutdown = ShutdownCoordinator::new();
    let pipeline = scratch_pipeline(&scratch, shutdown.clone());
    let adapter = mysql("8.0");

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::None);
    pipeline
        .run_backup_command(
            &mut backup,
            &adapter,
            shell("head -c 1000000 /dev/urandom"),
            &storage,
            &mut |_| {},
        )
        .unwrap();
    let storage = InterruptedDownloads {
        inner: storage,
        shutdown,
    };

    let marker = dir.path().join("restore-started");
    let mut restore = pipeline.start_restore(&backup).unwrap();
    let command = shell(&format!("touch {}; cat > /dev/null", marker.display()));
    let err = pipeline
        .run_restore_command(&mut restore, &backup, &adapter, command, &storage)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled(_)), "got {err:?}");
    assert_eq!(restore.status, OperationStatus::Cancelled);
    assert!(!marker.exists());
    assert!(is_empty(&scratch));
}

#[test]
fn shutdown_while_the_tool_runs_cancels_the_restore() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, scratch) = restore_dirs(dir.path());
    let shutdown = ShutdownCoordinator::new();
    let pipeline = scratch_pipeline(&scratch, shutdown.clone());
    let adapter = mysql("8.0");

    let mut backup = Backup::new(Uuid::new_v4(), storage.id, EncryptionMode::Encrypted);
    pipeline
        .run_backup_command(&mut backup, &adapter, shell("printf abc"), &storage, &mut |_| {})
        .unwrap();

    let mut restore = pipeline.start_restore(&backup).unwrap();
    let requester = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        shutdown.request_shutdown();
    });
    let err = pipeline
        .run_restore_command(&mut restore, &backup, &adapter, shell("exec sleep 30"), &storage)
        .unwrap_err();
    requester.join().unwrap();

    assert!(matches!(err, PipelineError::Cancelled(_)), "got {err:?}");
    assert_eq!(restore.status, OperationStatus::Cancelled);
    assert!(is_empty(&scratch));
}
