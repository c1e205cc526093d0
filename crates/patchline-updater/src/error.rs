//! Error types for the update system.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during update operations.
///
/// Cancellation is deliberately absent: a canceled operation completes with
/// [`Outcome::Cancelled`](crate::progress::Outcome) instead of an error.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A file signature did not verify against the trusted key
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    /// Downloaded content does not match the expected hash
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Downloaded content does not match the expected size
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Archive ended before the declared number of bytes was read
    #[error("archive truncated: expected {expected} bytes, read {actual}")]
    ArchiveTruncated { expected: u64, actual: u64 },

    /// Archive structure or digest is invalid. The payload-corruption
    /// counterpart of [`ArchiveTruncated`](Self::ArchiveTruncated)
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Extraction target exists and is not empty
    #[error("destination is not empty: {}", .0.display())]
    DestinationNotEmpty(PathBuf),

    /// A required directory does not exist
    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// Operation called in a state it does not support
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Manifest document is malformed
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Download failed with HTTP status
    #[error("download failed with status {status}")]
    DownloadFailed { status: u16 },

    /// Network error during download
    #[error("network error: {0}")]
    NetworkError(String),

    /// An update run failed and its staging area was removed
    #[error("update failed: {0}")]
    UpdateFailed(#[source] Box<UpdateError>),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl UpdateError {
    /// Whether this error reports tampered or corrupted data.
    ///
    /// Integrity failures are never retried.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::SignatureVerificationFailed(_)
            | Self::HashMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::ArchiveTruncated { .. }
            | Self::ArchiveCorrupt(_) => true,
            Self::UpdateFailed(inner) => inner.is_integrity_failure(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for UpdateError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        UpdateError::SignatureVerificationFailed(err.to_string())
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::VersionParseError(err.to_string())
    }
}
