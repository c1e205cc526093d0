//! patchline-publish - release tooling for patchline update feeds
//!
//! This crate provides a command-line interface for:
//! - Generating publisher keys and the matching client trust section
//! - Publishing incremental and bundle releases
//! - Inspecting and verifying published manifests
//! - Checking a feed for updates and staging them

pub mod cli;
pub mod output;

pub use cli::Cli;
pub use output::{OutputFormat, OutputFormatter};

use patchline_updater::UpdateError;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Verification failed - a signature, hash or size did not check out
/// - 4: Connection failed - the feed could not be reached
/// - 5: Invalid input - bad arguments, keys or manifest
/// - 6: Cancelled - interrupted before completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    VerificationFailed = 2,
    ConnectionFailed = 4,
    InvalidInput = 5,
    Cancelled = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::VerificationFailed => "VERIFICATION_FAILED",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::Cancelled => "CANCELLED",
        }
    }

    /// Classify a failure by the first [`UpdateError`] in its chain.
    pub fn from_error(error: &anyhow::Error) -> Self {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<UpdateError>())
            .map(Self::from_update_error)
            .unwrap_or(ExitCode::GeneralError)
    }

    fn from_update_error(error: &UpdateError) -> Self {
        if error.is_integrity_failure() {
            return ExitCode::VerificationFailed;
        }
        match error {
            UpdateError::UpdateFailed(inner) => Self::from_update_error(inner),
            UpdateError::DownloadFailed { .. }
            | UpdateError::NetworkError(_)
            | UpdateError::HttpError(_) => ExitCode::ConnectionFailed,
            UpdateError::ConfigError(_)
            | UpdateError::InvalidManifest(_)
            | UpdateError::VersionParseError(_)
            | UpdateError::DirectoryNotFound(_)
            | UpdateError::InvalidOperation(_) => ExitCode::InvalidInput,
            _ => ExitCode::GeneralError,
        }
    }
}
