//! Per-file identity and verified download.
//!
//! A [`FileDescriptor`] names one file of a release together with the
//! proofs needed to trust it: its length, modification time, SHA-512 hash
//! and an Ed25519 signature over that hash. A descriptor can only be built
//! once its signature verifies, so holding one means the hash is trusted.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, SigningKey};
use filetime::FileTime;
use futures_util::StreamExt;
use tracing::{debug, error, info};
use url::Url;

use crate::client::UpdateClient;
use crate::error::UpdateError;
use crate::integrity::{digests_match, hash_file, verify_digest};
use crate::payload::PayloadSink;
use crate::progress::{Outcome, ProgressReporter};
use crate::relpath;
use crate::trust::{sign_digest, TrustContext, DIGEST_LEN};

/// Largest modification-time difference, in milliseconds, still treated as
/// the same file. Covers filesystems with 2-second timestamp resolution.
pub const MTIME_TOLERANCE_MS: i64 = 2000;

/// One file of a release.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    relative_path: String,
    remote_url: Url,
    length: u64,
    modified: DateTime<Utc>,
    hash: [u8; DIGEST_LEN],
    signature: Signature,
}

impl FileDescriptor {
    /// Build a descriptor from manifest fields, verifying its signature.
    pub fn from_parts(
        relative_path: String,
        remote_url: Url,
        length: u64,
        modified: DateTime<Utc>,
        hash: [u8; DIGEST_LEN],
        signature: Signature,
        trust: &TrustContext,
    ) -> Result<Self, UpdateError> {
        relpath::validate(&relative_path).map_err(UpdateError::InvalidManifest)?;

        if let Err(e) = trust.verify_digest(&hash, &signature) {
            error!(path = %relative_path, "File signature does not verify");
            return Err(e);
        }

        Ok(Self {
            relative_path,
            remote_url,
            length,
            modified,
            hash,
            signature,
        })
    }

    /// Hash and sign a real file under `base_path`. Publisher only.
    pub fn create(
        base_path: &Path,
        relative_path: &str,
        remote_url: Url,
        signing_key: &SigningKey,
    ) -> Result<Self, UpdateError> {
        relpath::validate(relative_path).map_err(UpdateError::InvalidOperation)?;

        let path = relpath::to_native(base_path, relative_path);
        let metadata = fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(UpdateError::InvalidOperation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let hash = hash_file(&path)?;
        let signature = sign_digest(signing_key, &hash);

        Ok(Self {
            relative_path: relative_path.to_string(),
            remote_url,
            length: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
            hash,
            signature,
        })
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn remote_url(&self) -> &Url {
        &self.remote_url
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn hash(&self) -> &[u8; DIGEST_LEN] {
        &self.hash
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Local path of this file under `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        relpath::to_native(root, &self.relative_path)
    }

    /// Whether the copy under `install_dir` is this exact file.
    ///
    /// Requires the file to exist with the same length, a modification time
    /// within [`MTIME_TOLERANCE_MS`], and the same SHA-512. The hash is
    /// always recomputed.
    pub fn matches(&self, install_dir: &Path) -> bool {
        let path = self.local_path(install_dir);

        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                debug!(path = %self.relative_path, "Not present locally");
                return false;
            }
        };

        if metadata.len() != self.length {
            debug!(
                path = %self.relative_path,
                expected = self.length,
                actual = metadata.len(),
                "Length differs"
            );
            return false;
        }

        let local_modified = match metadata.modified() {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(_) => return false,
        };
        let drift = (local_modified - self.modified).num_milliseconds().abs();
        if drift > MTIME_TOLERANCE_MS {
            debug!(path = %self.relative_path, drift_ms = drift, "Timestamp differs");
            return false;
        }

        match hash_file(&path) {
            Ok(actual) if digests_match(&actual, &self.hash) => true,
            Ok(_) => {
                debug!(path = %self.relative_path, "Hash differs");
                false
            }
            Err(e) => {
                debug!(path = %self.relative_path, error = %e, "Could not hash local file");
                false
            }
        }
    }

    /// Download, decode and verify this file into `target_dir`.
    ///
    /// The target must not exist yet. Progress is reported in decompressed
    /// bytes against [`length`](Self::length), and cancellation is polled
    /// before the request and after every chunk. On any failure or
    /// cancellation the partially written file is removed. On success the
    /// file's modification time is set so a later [`matches`](Self::matches)
    /// holds.
    pub async fn download_file(
        &self,
        client: &UpdateClient,
        target_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<Outcome<PathBuf>, UpdateError> {
        let target = self.local_path(target_dir);
        if target.exists() {
            return Err(UpdateError::InvalidOperation(format!(
                "download target already exists: {}",
                target.display()
            )));
        }

        progress.set_caption(&self.relative_path);
        progress.set_maximum(self.length as i64);
        progress.set_progress(0);

        if progress.was_canceled() {
            return Ok(Outcome::Cancelled);
        }

        debug!(path = %self.relative_path, url = %self.remote_url, "Downloading file");

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let response = client.downloader().open(&self.remote_url).await?;

        let guard = PartialFile::new(target.clone());
        let file = File::create(&target)?;
        let cipher = client.trust().file_cipher(&self.relative_path);
        let mut sink =
            PayloadSink::new(cipher, BufWriter::new(file), progress).with_limit(self.length);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if progress.was_canceled() {
                debug!(path = %self.relative_path, "Download canceled");
                return Ok(Outcome::Cancelled);
            }
            let chunk = chunk.map_err(|e| UpdateError::NetworkError(e.to_string()))?;
            if let Err(e) = sink.write_chunk(&chunk) {
                return Err(self.sink_failure(&sink, e));
            }
        }

        if let Err(e) = sink.try_finish() {
            return Err(self.sink_failure(&sink, e));
        }
        let (writer, written, digest) = sink.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if written != self.length {
            return Err(self.integrity_failure(UpdateError::SizeMismatch {
                expected: self.length,
                actual: written,
            }));
        }
        verify_digest(&digest, &self.hash).map_err(|e| self.integrity_failure(e))?;

        filetime::set_file_mtime(&target, FileTime::from_system_time(self.modified.into()))?;

        guard.keep();
        info!(path = %self.relative_path, bytes = written, "File verified");
        Ok(Outcome::Completed(target))
    }

    fn sink_failure<W: Write>(&self, sink: &PayloadSink<'_, W>, err: io::Error) -> UpdateError {
        if sink.exceeded() {
            self.oversize(sink.attempted())
        } else {
            err.into()
        }
    }

    fn oversize(&self, actual: u64) -> UpdateError {
        self.integrity_failure(UpdateError::SizeMismatch {
            expected: self.length,
            actual,
        })
    }

    fn integrity_failure(&self, err: UpdateError) -> UpdateError {
        error!(path = %self.relative_path, error = %err, "Downloaded file failed verification");
        err
    }
}

/// Removes a partially written file unless explicitly kept.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}
