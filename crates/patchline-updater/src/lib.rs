//! # patchline-updater
//!
//! Incremental update client for desktop applications.
//!
//! This crate handles:
//! - Discovery of signed update manifests published under a base URI
//! - Fail-closed verification of every file's Ed25519 signature
//! - Per-file sync that downloads only what changed, streaming each payload
//!   through decrypt, inflate and SHA-512 verification
//! - A whole-tree archive container used by the legacy bundle delivery
//! - Publisher helpers that produce everything the client consumes
//!
//! ## Security
//!
//! - Key material comes only from local configuration, never the network
//! - A single unverifiable file entry rejects the entire manifest
//! - Nothing is written outside a fresh staging directory, and any failure
//!   or cancellation removes everything written so far
//!
//! ## Example
//!
//! ```ignore
//! use patchline_updater::{ManifestFetcher, ProgressCounter, SyncOutcome, UpdaterConfig};
//!
//! let config = UpdaterConfig::load_from_file(Path::new("updater.toml"))?;
//! let fetcher = ManifestFetcher::from_config(&config)?;
//!
//! if let Some(update) = fetcher.check(&config.product_name, config.mode).await {
//!     if update.is_newer_than(&installed_version) {
//!         let progress = ProgressCounter::new();
//!         if let SyncOutcome::Staged(dir) = update.apply(install_dir, &progress).await? {
//!             // promote `dir` over the install
//!         }
//!     }
//! }
//! ```

pub mod archive;
pub mod bundle;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod integrity;
pub mod manifest;
pub mod payload;
pub mod progress;
#[cfg(test)]
mod proptests;
pub mod publish;
pub mod relpath;
#[cfg(test)]
mod testutil;
pub mod trust;

// Re-export main types for convenience
pub use archive::{extract_archive, extract_archive_file, write_archive, write_archive_file, ArchiveSummary};
pub use bundle::{BundleManifest, BundleSecrets};
pub use client::UpdateClient;
pub use config::{DeliveryMode, NetworkConfig, PublisherKeys, TrustConfig, UpdaterConfig};
pub use descriptor::FileDescriptor;
pub use download::{Downloader, DownloaderConfig};
pub use error::UpdateError;
pub use fetcher::{AvailableUpdate, ManifestFetcher};
pub use manifest::{SyncOutcome, UpdateManifest, VersionEntry};
pub use progress::{CancelToken, ChildProgress, NoProgress, Outcome, ProgressCounter, ProgressReporter};
pub use publish::{PublishSummary, Publisher, ReleaseSpec};
pub use trust::{PayloadCipher, TrustContext};
