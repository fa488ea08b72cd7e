//! Restore: download to a temp file, then decrypt and decompress into the
//! restore tool's stdin.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::process::Stdio;
use std::thread;
use std::time::Instant;

use flate2::read::GzDecoder;
use tempfile::TempDir;
use uuid::Uuid;

use super::process::{self, CopyError};
use super::{elapsed_ms, first_error, Pipeline, PipelineError, Stage};
use crate::engines::{Database, EngineAdapter, EngineCommand};
use crate::model::{Backup, OperationStatus, Restore};
use crate::shutdown::Cancellation;
use crate::storage::Storage;

impl Pipeline {
    /// Creates the [OperationStatus::Pending] restore of a completed backup.
    pub fn start_restore(&self, backup: &Backup) -> Result<Restore, PipelineError> {
        if backup.status != OperationStatus::Completed {
            return Err(PipelineError::NotRestorable {
                backup_id: backup.id,
                status: backup.status,
            });
        }
        let restore = Restore::new(backup.id);
        log::info!(target: "pipeline::restore", "Created restore {} of backup {}", restore.id, backup.id);
        Ok(restore)
    }

    /// Restores `backup` from `storage` into `database`.
    ///
    /// `source_database` is the database the backup was taken from when it
    /// differs from the target.
    pub fn run_restore(
        &self,
        restore: &mut Restore,
        backup: &Backup,
        database: &Database,
        source_database: Option<&str>,
        storage: &dyn Storage,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        if restore.status != OperationStatus::Pending {
            return Err(PipelineError::AlreadyRun(restore.id));
        }

        let adapter = database.adapter();
        let result = adapter
            .build_restore_command(
                &database.command_context(&self.tools, &self.encryptor),
                source_database,
            )
            .map_err(PipelineError::from)
            .and_then(|command| self.stream_restore(restore, backup, adapter, command, storage));
        self.finish_restore(restore, started, result)
    }

    /// Like [run_restore](Self::run_restore) with an already built restore command.
    pub fn run_restore_command(
        &self,
        restore: &mut Restore,
        backup: &Backup,
        adapter: &dyn EngineAdapter,
        command: EngineCommand,
        storage: &dyn Storage,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        if restore.status != OperationStatus::Pending {
            return Err(PipelineError::AlreadyRun(restore.id));
        }

        let result = self.stream_restore(restore, backup, adapter, command, storage);
        self.finish_restore(restore, started, result)
    }

    fn finish_restore(
        &self,
        restore: &mut Restore,
        started: Instant,
        result: Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        let duration_ms = elapsed_ms(started);
        match result {
            Ok(()) => {
                restore.finish(OperationStatus::Completed, duration_ms, None);
                log::info!(target: "pipeline::restore", "Restore {} completed in {duration_ms} ms", restore.id);
                Ok(())
            }
            Err(err) => {
                let status = err.status();
                restore.finish(status, duration_ms, Some(err.to_string()));
                log::error!(target: "pipeline::restore", "Restore {} ended {status}: {err}", restore.id);
                Err(err)
            }
        }
    }

    fn stream_restore(
        &self,
        restore: &mut Restore,
        backup: &Backup,
        adapter: &dyn EngineAdapter,
        command: EngineCommand,
        storage: &dyn Storage,
    ) -> Result<(), PipelineError> {
        let cancel = self.cancellation();
        cancel.check()?;
        if backup.status != OperationStatus::Completed {
            return Err(PipelineError::NotRestorable {
                backup_id: backup.id,
                status: backup.status,
            });
        }
        // never fall back to plaintext when the metadata is gone
        let cipher = self.envelope_cipher(backup, Stage::Decrypt)?;
        restore.mark_in_progress();

        let workdir = self.workdir()?;
        let download = workdir.path().join(format!("{}.backup", backup.id));
        let downloaded = self.download(&cancel, storage, backup.id, &download)?;
        log::debug!(target: "pipeline::restore", "Downloaded backup {} ({downloaded} bytes)", backup.id);

        let file = File::open(&download).map_err(|e| PipelineError::stage(Stage::Download, e))?;
        let reader: Box<dyn Read> = match cipher {
            Some(cipher) => Box::new(cipher.decrypt_reader(BufReader::new(file))),
            None => Box::new(BufReader::new(file)),
        };
        let mut decoder = GzDecoder::new(reader);

        let tool = command.tool_name();
        let mut child = process::spawn(&command, Stdio::piped(), Stdio::null())
            .map_err(|source| PipelineError::Spawn { tool: tool.clone(), source })?;
        let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
            process::abandon(child);
            return Err(PipelineError::Io {
                stage: Stage::Restore,
                source: io::Error::other("input of the restore process is not captured"),
            });
        };
        log::info!(target: "pipeline::restore", "Restore {} streaming into {tool}", restore.id);

        let poll = self.settings.poll_interval();
        let chunk_size = self.settings.chunk_size;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (cancel, stop_rx) = (&cancel, &stop_rx);

        let (fed, watched, diagnostics) = thread::scope(|s| {
            let diagnostics = s.spawn(move || process::drain(stderr));
            let watcher = s.spawn(move || process::watch(child, cancel, stop_rx, poll));

            let mut stdin = stdin;
            let fed = process::copy(cancel, &mut decoder, &mut stdin, chunk_size, None);
            // a failed write means the tool stopped reading, its exit explains why
            let abort = matches!(fed, Err(CopyError::Read(_) | CopyError::Cancelled(_)));
            let stdin = if abort {
                let _ = stop_tx.try_send(());
                Some(stdin)
            } else {
                // end of input for the restore tool
                drop(stdin);
                None
            };

            let watched = watcher.join().expect("process watcher should not panic");
            // a truncated input must never reach the tool as a clean end of input
            drop(stdin);
            let diagnostics = diagnostics.join().expect("diagnostics drain should not panic");

            let fed = fed.map_err(|e| match e {
                CopyError::Cancelled(cancelled) => PipelineError::Cancelled(cancelled),
                CopyError::Read(source) => PipelineError::stage(Stage::Decompress, source),
                CopyError::Write(source) => PipelineError::stage(Stage::Restore, source),
            });
            (fed, watched, diagnostics)
        });

        let errors = fed.err().into_iter().collect();
        first_error(cancel, adapter, Stage::Restore, watched, &diagnostics, errors)?;
        if !diagnostics.trim().is_empty() {
            log::debug!(target: "pipeline::restore", "{tool} output: {}", diagnostics.trim());
        }
        Ok(())
    }

    fn workdir(&self) -> Result<TempDir, PipelineError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dbstream-restore-");
        let workdir = match &self.settings.temp_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        };
        workdir.map_err(|e| PipelineError::stage(Stage::Download, e))
    }

    /// Copies the stored backup to `path`.
    fn download(
        &self,
        cancel: &Cancellation,
        storage: &dyn Storage,
        backup_id: Uuid,
        path: &Path,
    ) -> Result<u64, PipelineError> {
        let mut remote = storage.get_file(&self.encryptor, backup_id)?;
        let mut file =
            File::create_new(path).map_err(|e| PipelineError::stage(Stage::Download, e))?;
        let chunk_size = self.settings.chunk_size;
        let downloaded = process::copy(cancel, &mut remote, &mut file, chunk_size, None)
            .map_err(|e| match e {
                CopyError::Cancelled(cancelled) => PipelineError::Cancelled(cancelled),
                CopyError::Read(source) | CopyError::Write(source) => {
                    PipelineError::stage(Stage::Download, source)
                }
            })?;
        file.sync_all()
            .map_err(|e| PipelineError::stage(Stage::Download, e))?;
        Ok(downloaded)
    }
}
