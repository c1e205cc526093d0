//! Integrity primitives.
//!
//! SHA-512 hashing of files and streams, and constant-time digest
//! comparison. The writer and reader adapters let a single pass over the
//! data both move it and hash it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

use crate::error::UpdateError;
use crate::progress::ProgressReporter;
use crate::trust::DIGEST_LEN;

/// Buffer size for reading files during hash computation.
pub(crate) const HASH_BUFFER_SIZE: usize = 8192;

/// Compute the SHA-512 hash of a file.
///
/// Reads the file in chunks so large files are never loaded into memory.
pub fn hash_file(path: &Path) -> Result<[u8; DIGEST_LEN], UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

/// Compare two digests in constant time.
pub fn digests_match(actual: &[u8; DIGEST_LEN], expected: &[u8; DIGEST_LEN]) -> bool {
    actual.ct_eq(expected).unwrap_u8() == 1
}

/// Check `actual` against `expected`, producing a `HashMismatch` on failure.
pub fn verify_digest(
    actual: &[u8; DIGEST_LEN],
    expected: &[u8; DIGEST_LEN],
) -> Result<(), UpdateError> {
    if digests_match(actual, expected) {
        return Ok(());
    }
    Err(UpdateError::HashMismatch {
        expected: hex::encode(expected),
        actual: hex::encode(actual),
    })
}

/// Writer adapter that hashes and counts everything written through it.
///
/// When a reporter is attached, its progress is set to the running byte
/// count after every write. With a limit set, a write that would carry the
/// total past it is refused whole and nothing more reaches `inner`.
pub struct DigestWriter<'a, W> {
    inner: W,
    hasher: Sha512,
    written: u64,
    limit: Option<u64>,
    attempted: u64,
    progress: Option<&'a dyn ProgressReporter>,
}

impl<'a, W: Write> DigestWriter<'a, W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
            written: 0,
            limit: None,
            attempted: 0,
            progress: None,
        }
    }

    /// Report the running byte count into `progress`.
    pub fn with_progress(inner: W, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            progress: Some(progress),
            ..Self::new(inner)
        }
    }

    /// Refuse writes beyond `limit` total bytes.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Whether a write was refused for exceeding the limit.
    pub fn exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.attempted > limit)
    }

    /// Bytes offered so far, refused ones included.
    pub fn attempted(&self) -> u64 {
        self.attempted
    }

    /// Consume the adapter, returning the inner writer, the byte count and
    /// the digest.
    pub fn finish(self) -> (W, u64, [u8; DIGEST_LEN]) {
        (self.inner, self.written, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for DigestWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.limit {
            if self.written.saturating_add(buf.len() as u64) > limit {
                self.attempted = self.written.saturating_add(buf.len() as u64);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("output exceeds {} bytes", limit),
                ));
            }
        }
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        self.attempted = self.attempted.max(self.written);
        if let Some(progress) = self.progress {
            progress.set_progress(self.written as i64);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that hashes and counts everything read through it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha512,
    read: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
            read: 0,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Digest of everything read so far; the adapter keeps hashing.
    pub fn digest(&self) -> [u8; DIGEST_LEN] {
        self.hasher.clone().finalize().into()
    }

    /// Read directly from the inner reader, bypassing the hash.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}
