//! Bounded in-memory byte pipe between the copy stage and the storage upload.
//!
//! Unlike a closed channel, a [PipeWriter] dropped without [PipeWriter::finish]
//! is never observed as a clean end of stream: the reader fails, so a storage
//! backend can't commit a truncated object.

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};

use crate::shutdown::Cancellation;

enum Message {
    Data(Vec<u8>),
    End,
}

/// Creates a pipe holding at most `capacity` chunks of `chunk_size` bytes.
///
/// A blocked writer polls `cancel` every `poll` so a stalled reader can't
/// hold up cancellation.
pub fn pipe(
    capacity: usize,
    chunk_size: usize,
    cancel: Cancellation,
    poll: Duration,
) -> (PipeWriter, PipeReader) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    let chunk_size = chunk_size.max(1);
    let writer = PipeWriter {
        sender,
        buffer: Vec::with_capacity(chunk_size),
        chunk_size,
        written: 0,
        cancel,
        poll,
    };
    let reader = PipeReader {
        receiver,
        current: Vec::new(),
        pos: 0,
        finished: false,
    };
    (writer, reader)
}

pub struct PipeWriter {
    sender: Sender<Message>,
    buffer: Vec<u8>,
    chunk_size: usize,
    written: u64,
    cancel: Cancellation,
    poll: Duration,
}

impl PipeWriter {
    fn send(&self, mut message: Message) -> io::Result<()> {
        loop {
            self.cancel.check().map_err(io::Error::other)?;
            match self.sender.send_timeout(message, self.poll) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(m)) => message = m,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(io::Error::new(ErrorKind::BrokenPipe, "pipe reader is gone"));
                }
            }
        }
    }

    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        self.send(Message::Data(chunk))
    }

    /// Sends the remaining bytes and the end of stream marker.
    pub fn finish(mut self) -> io::Result<u64> {
        self.send_buffer()?;
        self.send(Message::End)?;
        Ok(self.written)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(self.chunk_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..len]);
        self.written += len as u64;
        if self.buffer.len() == self.chunk_size {
            self.send_buffer()?;
        }
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer()
    }
}

pub struct PipeReader {
    receiver: Receiver<Message>,
    current: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.current.len() {
            if self.finished {
                return Ok(0);
            }
            match self.receiver.recv() {
                Ok(Message::Data(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Message::End) => self.finished = true,
                Err(_) => {
                    return Err(io::Error::new(
                        ErrorKind::BrokenPipe,
                        "pipe writer aborted before the end of stream",
                    ))
                }
            }
        }

        let len = buf.len().min(self.current.len() - self.pos);
        buf[..len].copy_from_slice(&self.current[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::shutdown::{Cancelled, ShutdownCoordinator};

    fn test_pipe(shutdown: &ShutdownCoordinator) -> (PipeWriter, PipeReader) {
        pipe(
            2,
            4,
            shutdown.cancellation(Duration::from_secs(60)),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn transfers_in_order() {
        let (mut writer, mut reader) = test_pipe(&ShutdownCoordinator::new());
        let consumer = thread::spawn(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map(|_| out)
        });

        let data: Vec<u8> = (0..=255).cycle().take(10_000).collect();
        writer.write_all(&data).unwrap();
        assert_eq!(writer.finish().unwrap(), 10_000);

        assert_eq!(consumer.join().unwrap().unwrap(), data);
    }

    #[test]
    fn dropped_writer_is_not_eof() {
        let (mut writer, mut reader) = test_pipe(&ShutdownCoordinator::new());
        writer.write_all(b"abcdef").unwrap();
        drop(writer);

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn blocked_writer_observes_cancellation() {
        let shutdown = ShutdownCoordinator::new();
        let (mut writer, _reader) = test_pipe(&shutdown);
        // fill the channel, nobody reads
        writer.write_all(&[0u8; 8]).unwrap();

        shutdown.request_shutdown();
        let err = writer.write_all(&[0u8; 4]).unwrap_err();
        assert!(err.get_ref().unwrap().downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn gone_reader_breaks_pipe() {
        let (mut writer, reader) = test_pipe(&ShutdownCoordinator::new());
        drop(reader);
        let err = writer.write_all(&[0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
}
