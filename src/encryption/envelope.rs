//! Streaming authenticated encryption of whole backup payloads.
//!
//! Every backup gets its own key, derived with HKDF from the master secret,
//! a random salt and the backup id, and a random base nonce. Salt and nonce
//! are stored with the backup record, never inside the payload.
//!
//! Layout of an encrypted stream:
//!
//! ```text
//! "DBSE" 0x01                      header
//! [u32 BE len | FINAL][ciphertext] frame 0
//! [u32 BE len | FINAL][ciphertext] frame 1
//! ...                              last frame has the FINAL bit set
//! ```
//!
//! A frame holds at most [FRAME_SIZE] plaintext bytes sealed with
//! AES-256-GCM. Its nonce is the base nonce XOR the frame counter, its
//! associated data the counter and the final flag, so reordering, dropping or
//! truncating frames fails authentication.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use derive_more::{Display, Error};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::secret::SecretKey;

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// Maximum plaintext bytes per frame.
pub const FRAME_SIZE: usize = 64 * 1024;

const TAG_LEN: usize = 16;
const MAGIC: &[u8; 4] = b"DBSE";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;
const FINAL_FLAG: u32 = 0x8000_0000;
const KEY_INFO_PREFIX: &[u8] = b"dbstream-backup-envelope:";

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[display("Encryption metadata is invalid: {_0}")]
    InvalidMetadata(#[error(ignore)] String),
    #[display("Deriving the backup key failed")]
    KeyDerivation,
    #[display("Encrypted stream has an unknown header")]
    BadHeader,
    #[display("Frame {_0} failed authentication, wrong key or corrupted backup")]
    Authentication(#[error(ignore)] u64),
    #[display("Frame {_0} has an invalid length")]
    InvalidFrame(#[error(ignore)] u64),
    #[display("Encrypted stream is truncated")]
    Truncated,
    #[display("Encrypted stream has data after its final frame")]
    TrailingData,
    #[display("Sealing frame {_0} failed")]
    Seal(#[error(ignore)] u64),
}

impl From<EnvelopeError> for io::Error {
    fn from(err: EnvelopeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Per-backup randomness persisted alongside the backup record.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvelopeParams {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
}

impl EnvelopeParams {
    /// Fresh random salt and nonce. Never reuse them for another backup.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        Self { salt, nonce }
    }

    pub fn from_base64(salt: &str, nonce: &str) -> Result<Self, EnvelopeError> {
        Ok(Self {
            salt: decode_fixed(salt, "salt")?,
            nonce: decode_fixed(nonce, "nonce")?,
        })
    }

    pub fn salt_base64(&self) -> String {
        BASE64.encode(self.salt)
    }

    pub fn nonce_base64(&self) -> String {
        BASE64.encode(self.nonce)
    }
}

impl std::fmt::Debug for EnvelopeParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeParams")
            .field("salt", &self.salt_base64())
            .field("nonce", &self.nonce_base64())
            .finish()
    }
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N], EnvelopeError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| EnvelopeError::InvalidMetadata(format!("{what} is not base64: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        EnvelopeError::InvalidMetadata(format!(
            "{what} has {} bytes, expected {N}",
            bytes.len()
        ))
    })
}

/// Key and base nonce of one backup.
pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
}

impl EnvelopeCipher {
    pub fn new(
        secret: &SecretKey,
        backup_id: Uuid,
        params: &EnvelopeParams,
    ) -> Result<Self, EnvelopeError> {
        let hkdf = Hkdf::<Sha256>::new(Some(&params.salt), secret.as_bytes());
        let mut info = KEY_INFO_PREFIX.to_vec();
        info.extend_from_slice(backup_id.to_string().as_bytes());

        let mut key = Zeroizing::new([0u8; 32]);
        hkdf.expand(&info, &mut *key)
            .map_err(|_| EnvelopeError::KeyDerivation)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key[..]).map_err(|_| EnvelopeError::KeyDerivation)?;

        Ok(Self {
            cipher,
            base_nonce: params.nonce,
        })
    }

    pub fn encrypt_writer<W: Write>(self, inner: W) -> EnvelopeWriter<W> {
        EnvelopeWriter {
            cipher: self,
            inner,
            buffer: Vec::with_capacity(FRAME_SIZE),
            counter: 0,
            header_written: false,
        }
    }

    pub fn decrypt_reader<R: Read>(self, inner: R) -> EnvelopeReader<R> {
        EnvelopeReader {
            cipher: self,
            inner,
            state: ReadState::Header,
            plaintext: Vec::new(),
            pos: 0,
            counter: 0,
        }
    }

    fn frame_nonce(&self, counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.base_nonce;
        for (byte, counter_byte) in nonce[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
            *byte ^= counter_byte;
        }
        nonce
    }

    fn seal(&self, counter: u64, last: bool, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let nonce = self.frame_nonce(counter);
        let aad = frame_aad(counter, last);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| EnvelopeError::Seal(counter))
    }

    fn open(&self, counter: u64, last: bool, ciphertext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let nonce = self.frame_nonce(counter);
        let aad = frame_aad(counter, last);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| EnvelopeError::Authentication(counter))
    }
}

fn frame_aad(counter: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&counter.to_be_bytes());
    aad[8] = u8::from(last);
    aad
}

/// Encrypts everything written to it into `inner`.
///
/// [finish](Self::finish) must be called to emit the final frame, a dropped
/// writer leaves a truncated stream that fails decryption.
pub struct EnvelopeWriter<W: Write> {
    cipher: EnvelopeCipher,
    inner: W,
    buffer: Vec<u8>,
    counter: u64,
    header_written: bool,
}

impl<W: Write> EnvelopeWriter<W> {
    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.inner.write_all(MAGIC)?;
            self.inner.write_all(&[VERSION])?;
            self.header_written = true;
        }
        Ok(())
    }

    fn write_frame(&mut self, last: bool) -> io::Result<()> {
        self.write_header()?;

        let ciphertext = self.cipher.seal(self.counter, last, &self.buffer)?;
        let mut len = u32::try_from(ciphertext.len())
            .map_err(|_| EnvelopeError::InvalidFrame(self.counter))?;
        if last {
            len |= FINAL_FLAG;
        }
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;

        self.buffer.clear();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(EnvelopeError::InvalidFrame(self.counter))?;
        Ok(())
    }

    /// Seals the remaining bytes as the final frame and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_frame(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EnvelopeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.len() == FRAME_SIZE {
            self.write_frame(false)?;
        }
        let n = buf.len().min(FRAME_SIZE - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Flushes sealed frames only; a partial frame stays buffered.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum ReadState {
    Header,
    Frames,
    Finished,
    Failed(EnvelopeError),
}

/// Decrypts an encrypted stream, releasing bytes only once their frame
/// authenticated.
pub struct EnvelopeReader<R: Read> {
    cipher: EnvelopeCipher,
    inner: R,
    state: ReadState,
    plaintext: Vec<u8>,
    pos: usize,
    counter: u64,
}

impl<R: Read> EnvelopeReader<R> {
    fn read_header(&mut self) -> Result<(), EnvelopeError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or(&mut self.inner, &mut header, EnvelopeError::BadHeader)?;
        if &header[..MAGIC.len()] != MAGIC || header[MAGIC.len()] != VERSION {
            return Err(EnvelopeError::BadHeader);
        }
        Ok(())
    }

    /// Reads and authenticates the next frame into `plaintext`.
    fn next_frame(&mut self) -> Result<(), EnvelopeError> {
        let mut len = [0u8; 4];
        read_exact_or(&mut self.inner, &mut len, EnvelopeError::Truncated)?;
        let len = u32::from_be_bytes(len);
        let last = len & FINAL_FLAG != 0;
        let len = (len & !FINAL_FLAG) as usize;
        if !(TAG_LEN..=FRAME_SIZE + TAG_LEN).contains(&len) {
            return Err(EnvelopeError::InvalidFrame(self.counter));
        }

        let mut ciphertext = vec![0u8; len];
        read_exact_or(&mut self.inner, &mut ciphertext, EnvelopeError::Truncated)?;
        let plaintext = self.cipher.open(self.counter, last, &ciphertext)?;

        if last {
            let mut extra = [0u8; 1];
            if read_some(&mut self.inner, &mut extra)? != 0 {
                return Err(EnvelopeError::TrailingData);
            }
            self.state = ReadState::Finished;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(EnvelopeError::InvalidFrame(self.counter))?;
        }

        self.plaintext = plaintext;
        self.pos = 0;
        Ok(())
    }

    fn advance(&mut self) -> Result<(), EnvelopeError> {
        if let ReadState::Header = self.state {
            self.read_header()?;
            self.state = ReadState::Frames;
        }
        self.next_frame()
    }
}

impl<R: Read> Read for EnvelopeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plaintext.len() {
                let n = buf.len().min(self.plaintext.len() - self.pos);
                buf[..n].copy_from_slice(&self.plaintext[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            match &self.state {
                ReadState::Finished => return Ok(0),
                ReadState::Failed(err) => return Err(err.clone().into()),
                ReadState::Header | ReadState::Frames => {}
            }

            if let Err(err) = self.advance() {
                self.plaintext.clear();
                self.pos = 0;
                self.state = ReadState::Failed(err.clone());
                return Err(err.into());
            }
        }
    }
}

/// `read_exact` that maps a premature end of stream to `eof` and other
/// failures to [EnvelopeError::Truncated].
fn read_exact_or<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    eof: EnvelopeError,
) -> Result<(), EnvelopeError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(eof),
        Err(e) => {
            log::debug!(target: "encryption::envelope", "Reading encrypted stream failed: {e}");
            Err(EnvelopeError::Truncated)
        }
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, EnvelopeError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!(target: "encryption::envelope", "Reading encrypted stream failed: {e}");
                return Err(EnvelopeError::Truncated);
            }
        }
    }
}
