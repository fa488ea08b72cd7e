//! Lifecycle of the external dump and restore processes.

use std::io::{self, ErrorKind, Read, Write};
use std::process::{Child, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::engines::{EngineCommand, ExitInfo};
use crate::shutdown::{Cancellation, Cancelled};

/// Diagnostic output kept per process, older output is dropped.
const MAX_DIAGNOSTICS: usize = 64 * 1024;

/// Starts `command` with piped stderr.
pub(crate) fn spawn(command: &EngineCommand, stdin: Stdio, stdout: Stdio) -> io::Result<Child> {
    let child = command
        .to_command()
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()?;
    log::debug!(target: "pipeline::process", "Started {} (pid {})", command.tool_name(), child.id());
    Ok(child)
}

/// Kills a process whose handles couldn't be set up.
pub(crate) fn abandon(mut child: Child) {
    if let Err(e) = child.kill().and_then(|_| child.wait().map(drop)) {
        log::warn!(target: "pipeline::process", "Killing process {} failed: {e}", child.id());
    }
}

/// Reads `stderr` until the process closes it, keeping the tail.
pub(crate) fn drain(mut stderr: impl Read) -> String {
    let mut collected = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match stderr.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                collected.extend_from_slice(&buffer[..read]);
                if collected.len() > MAX_DIAGNOSTICS {
                    collected.drain(..collected.len() - MAX_DIAGNOSTICS);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!(target: "pipeline::process", "Reading diagnostics failed: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Why the watcher terminated the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Killed {
    Cancelled(Cancelled),
    /// Another stage failed and asked to stop.
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Watched {
    pub exit: ExitInfo,
    pub killed: Option<Killed>,
}

/// Waits for `child` to exit, killing it once the operation is cancelled or
/// a stop is sent through `stop`. Polls every `poll`.
///
/// A stop is sent after another stage failed. Whatever the process does
/// from then on is a consequence of that failure, so it is reported as
/// [Killed::Stopped] even if it managed to exit on its own.
pub(crate) fn watch(
    mut child: Child,
    cancel: &Cancellation,
    stop: &Receiver<()>,
    poll: Duration,
) -> io::Result<Watched> {
    loop {
        if stop.try_recv().is_ok() {
            return stopped(child);
        }

        if let Some(status) = child.try_wait()? {
            return Ok(Watched {
                exit: status.into(),
                killed: None,
            });
        }

        if let Err(cancelled) = cancel.check() {
            log::warn!(target: "pipeline::process", "Killing process {}: {cancelled}", child.id());
            return kill(child, Killed::Cancelled(cancelled));
        }

        match stop.recv_timeout(poll) {
            Ok(()) => return stopped(child),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
        }
    }
}

fn stopped(child: Child) -> io::Result<Watched> {
    log::debug!(target: "pipeline::process", "Killing process {} after a failed stage", child.id());
    kill(child, Killed::Stopped)
}

fn kill(mut child: Child, reason: Killed) -> io::Result<Watched> {
    if let Err(e) = child.kill() {
        // already exited
        if e.kind() != ErrorKind::InvalidInput {
            return Err(e);
        }
    }
    let status = child.wait()?;
    Ok(Watched {
        exit: status.into(),
        killed: Some(reason),
    })
}

/// Reports cumulative megabytes whenever another threshold is crossed.
pub(crate) struct Progress<'a> {
    threshold: u64,
    total: u64,
    next: u64,
    callback: &'a mut dyn FnMut(u64),
}

impl<'a> Progress<'a> {
    pub fn new(threshold_mb: u64, callback: &'a mut dyn FnMut(u64)) -> Self {
        let threshold = threshold_mb.max(1) * 1024 * 1024;
        Self {
            threshold,
            total: 0,
            next: threshold,
            callback,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.total += bytes;
        if self.total >= self.next {
            self.next = (self.total / self.threshold + 1) * self.threshold;
            (self.callback)(self.total / (1024 * 1024));
        }
    }
}

/// Failure of [copy], attributed to the side it happened on.
#[derive(Debug)]
pub(crate) enum CopyError {
    Cancelled(Cancelled),
    Read(io::Error),
    Write(io::Error),
}

/// Returns the cancellation an I/O error of a pipe stage carries.
pub(crate) fn cancelled_in(err: &io::Error) -> Option<Cancelled> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<Cancelled>())
        .copied()
}

/// Copies `reader` into `writer` block by block, checking `cancel` before
/// every read and around every write.
pub(crate) fn copy(
    cancel: &Cancellation,
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    buffer_size: usize,
    mut progress: Option<&mut Progress<'_>>,
) -> Result<u64, CopyError> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        cancel.check().map_err(CopyError::Cancelled)?;
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };

        cancel.check().map_err(CopyError::Cancelled)?;
        writer.write_all(&buffer[..read]).map_err(|e| match cancelled_in(&e) {
            Some(cancelled) => CopyError::Cancelled(cancelled),
            None => CopyError::Write(e),
        })?;
        copied += read as u64;
        if let Some(progress) = progress.as_deref_mut() {
            progress.add(read as u64);
        }
        cancel.check().map_err(CopyError::Cancelled)?;
    }
}
