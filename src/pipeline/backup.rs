//! `STARTING → STREAMING → {COMPLETED | FAILED | CANCELLED}`

use std::io::{self, Write};
use std::process::{ChildStdout, Stdio};
use std::thread;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::pipe::{self, PipeWriter};
use super::process::{self, CopyError, Progress};
use super::{elapsed_ms, first_error, Pipeline, PipelineError, Stage};
use crate::encryption::{EnvelopeCipher, EnvelopeWriter};
use crate::engines::{Database, EngineAdapter, EngineCommand};
use crate::model::{Backup, BackupConfig, OperationStatus};
use crate::shutdown::Cancellation;
use crate::storage::Storage;

const MB: f64 = 1024.0 * 1024.0;

/// Last writer before the pipe, encrypting if the backup asks for it.
enum Sealer {
    Plain(PipeWriter),
    Encrypted(EnvelopeWriter<PipeWriter>),
}

impl Sealer {
    fn new(pipe: PipeWriter, cipher: Option<EnvelopeCipher>) -> Self {
        match cipher {
            Some(cipher) => Self::Encrypted(cipher.encrypt_writer(pipe)),
            None => Self::Plain(pipe),
        }
    }

    fn finish(self) -> Result<PipeWriter, PipelineError> {
        match self {
            Self::Plain(pipe) => Ok(pipe),
            Self::Encrypted(writer) => writer
                .finish()
                .map_err(|e| PipelineError::stage(Stage::Encrypt, e)),
        }
    }
}

impl Write for Sealer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(pipe) => pipe.write(buf),
            Self::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(pipe) => pipe.flush(),
            Self::Encrypted(writer) => writer.flush(),
        }
    }
}

impl Pipeline {
    /// Creates the [OperationStatus::Pending] record of a new backup.
    ///
    /// Disabled backups and incomplete connection profiles are rejected
    /// before anything is created.
    pub fn start_backup(
        &self,
        database: &Database,
        config: &BackupConfig,
    ) -> Result<Backup, PipelineError> {
        if !config.is_backups_enabled {
            return Err(PipelineError::BackupsDisabled(database.id));
        }
        database.adapter().validate()?;

        let backup = Backup::new(database.id, config.storage_id, config.encryption);
        log::info!(target: "pipeline::backup", "Created backup {} of database {} ({}, encryption {})", backup.id, database.name, database.database_type(), backup.encryption);
        Ok(backup)
    }

    /// Dumps `database` into `storage`, setting the terminal status of `backup`.
    ///
    /// `progress` receives the cumulative megabytes dumped so far.
    pub fn run_backup(
        &self,
        backup: &mut Backup,
        database: &Database,
        storage: &dyn Storage,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        if backup.status != OperationStatus::Pending {
            return Err(PipelineError::AlreadyRun(backup.id));
        }

        let adapter = database.adapter();
        let result = adapter
            .build_dump_command(&database.command_context(&self.tools, &self.encryptor))
            .map_err(PipelineError::from)
            .and_then(|command| self.stream_backup(backup, adapter, command, storage, progress));
        self.finish_backup(backup, storage, started, result)
    }

    /// Like [run_backup](Self::run_backup) with an already built dump command.
    pub fn run_backup_command(
        &self,
        backup: &mut Backup,
        adapter: &dyn EngineAdapter,
        command: EngineCommand,
        storage: &dyn Storage,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        if backup.status != OperationStatus::Pending {
            return Err(PipelineError::AlreadyRun(backup.id));
        }

        let result = self.stream_backup(backup, adapter, command, storage, progress);
        self.finish_backup(backup, storage, started, result)
    }

    fn finish_backup(
        &self,
        backup: &mut Backup,
        storage: &dyn Storage,
        started: Instant,
        result: Result<u64, PipelineError>,
    ) -> Result<(), PipelineError> {
        let duration_ms = elapsed_ms(started);
        match result {
            Ok(stored) => {
                backup.complete(stored as f64 / MB, duration_ms);
                log::info!(target: "pipeline::backup", "Backup {} completed: {:.2} MB in {duration_ms} ms", backup.id, backup.size_mb);
                Ok(())
            }
            Err(err) => {
                if backup.status == OperationStatus::InProgress {
                    if let Err(cleanup) = storage.delete_file(&self.encryptor, backup.id) {
                        log::warn!(target: "pipeline::backup", "Removing partial backup {} failed: {cleanup}", backup.id);
                    }
                }
                let status = err.status();
                backup.finish(status, duration_ms, Some(err.to_string()));
                match status {
                    OperationStatus::Cancelled => {
                        log::warn!(target: "pipeline::backup", "Backup {} cancelled: {err}", backup.id)
                    }
                    _ => log::error!(target: "pipeline::backup", "Backup {} failed: {err}", backup.id),
                }
                Err(err)
            }
        }
    }

    /// Returns the bytes handed to storage.
    fn stream_backup(
        &self,
        backup: &mut Backup,
        adapter: &dyn EngineAdapter,
        command: EngineCommand,
        storage: &dyn Storage,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, PipelineError> {
        let cancel = self.cancellation();
        cancel.check()?;
        let cipher = self.envelope_cipher(backup, Stage::Encrypt)?;

        let tool = command.tool_name();
        log::debug!(target: "pipeline::backup", "Backup {} starting: {tool}", backup.id);
        let mut child = process::spawn(&command, Stdio::null(), Stdio::piped())
            .map_err(|source| PipelineError::Spawn { tool: tool.clone(), source })?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            process::abandon(child);
            return Err(PipelineError::Io {
                stage: Stage::Dump,
                source: io::Error::other("output of the dump process is not captured"),
            });
        };

        backup.mark_in_progress();
        log::info!(target: "pipeline::backup", "Backup {} streaming from {tool}", backup.id);

        let poll = self.settings.poll_interval();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (pipe_writer, mut pipe_reader) = pipe::pipe(
            self.settings.pipe_capacity,
            self.settings.chunk_size,
            cancel.clone(),
            poll,
        );
        let backup_id = backup.id;
        let encryptor = &self.encryptor;
        let (cancel, stop_rx) = (&cancel, &stop_rx);

        let (copied, watched, diagnostics, uploaded) = thread::scope(|s| {
            let diagnostics = s.spawn(move || process::drain(stderr));
            let watcher = s.spawn(move || process::watch(child, cancel, stop_rx, poll));
            let upload =
                s.spawn(move || storage.save_file(cancel, encryptor, backup_id, &mut pipe_reader));

            let mut stdout = stdout;
            let sealed = self.compress_and_seal(cancel, &mut stdout, pipe_writer, cipher, progress);
            if sealed.is_err() {
                let _ = stop_tx.try_send(());
            }
            let watched = watcher.join().expect("process watcher should not panic");
            // closing the output earlier lets the dump die of SIGPIPE before the
            // watcher sees the stop, which would pass for a failure of the tool
            drop(stdout);

            // only a successful dump may complete the upload
            let copied = match sealed {
                Ok(pipe) if matches!(&watched, Ok(w) if w.killed.is_none() && w.exit.success()) => {
                    pipe.finish().map_err(|e| PipelineError::stage(Stage::Upload, e))
                }
                Ok(pipe) => {
                    drop(pipe);
                    Ok(0)
                }
                Err(err) => Err(err),
            };

            let uploaded = upload.join().expect("storage upload should not panic");
            let diagnostics = diagnostics.join().expect("diagnostics drain should not panic");
            (copied, watched, diagnostics, uploaded)
        });

        let mut errors = Vec::new();
        if let Err(err) = uploaded {
            errors.push(PipelineError::Storage(err));
        }
        let stored = match copied {
            Ok(stored) => stored,
            Err(err) => {
                errors.push(err);
                0
            }
        };
        first_error(cancel, adapter, Stage::Dump, watched, &diagnostics, errors)?;

        if !diagnostics.trim().is_empty() {
            log::debug!(target: "pipeline::backup", "{tool} output: {}", diagnostics.trim());
        }
        Ok(stored)
    }

    /// Copies the dump through the compressor and cipher into `pipe`,
    /// closing them in that order.
    fn compress_and_seal(
        &self,
        cancel: &Cancellation,
        stdout: &mut ChildStdout,
        pipe: PipeWriter,
        cipher: Option<EnvelopeCipher>,
        progress: &mut dyn FnMut(u64),
    ) -> Result<PipeWriter, PipelineError> {
        let mut encoder = GzEncoder::new(Sealer::new(pipe, cipher), Compression::default());
        let mut progress = Progress::new(self.settings.progress_threshold_mb, progress);

        let dumped = process::copy(
            cancel,
            stdout,
            &mut encoder,
            self.settings.chunk_size,
            Some(&mut progress),
        )
        .map_err(|e| match e {
            CopyError::Cancelled(cancelled) => PipelineError::Cancelled(cancelled),
            CopyError::Read(source) => PipelineError::stage(Stage::Dump, source),
            CopyError::Write(source) => PipelineError::stage(Stage::Compress, source),
        })?;
        log::debug!(target: "pipeline::backup", "Dump finished after {dumped} bytes");

        let sealer = encoder
            .finish()
            .map_err(|e| PipelineError::stage(Stage::Compress, e))?;
        sealer.finish()
    }
}
