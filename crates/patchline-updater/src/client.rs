//! Shared handle for one update session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::UpdaterConfig;
use crate::download::{Downloader, DownloaderConfig};
use crate::error::UpdateError;
use crate::trust::TrustContext;

/// Everything a transfer needs: the HTTP client, the trust anchor and the
/// root under which staging directories are created.
#[derive(Debug, Clone)]
pub struct UpdateClient {
    downloader: Downloader,
    trust: Arc<TrustContext>,
    staging_root: PathBuf,
}

impl UpdateClient {
    pub fn new(downloader: Downloader, trust: TrustContext, staging_root: PathBuf) -> Self {
        Self {
            downloader,
            trust: Arc::new(trust),
            staging_root,
        }
    }

    /// Build a client from configuration.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        let downloader = Downloader::with_config(DownloaderConfig::from(&config.network))?;
        let trust = TrustContext::from_config(&config.trust)?;
        Ok(Self::new(downloader, trust, config.staging_root()))
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn trust(&self) -> &TrustContext {
        &self.trust
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Create a brand-new, empty staging directory.
    ///
    /// The directory is removed when the returned guard is dropped unless
    /// the caller keeps it.
    pub fn new_staging_dir(&self, product_name: &str) -> Result<TempDir, UpdateError> {
        std::fs::create_dir_all(&self.staging_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-staging-", sanitize_prefix(product_name)))
            .tempdir_in(&self.staging_root)?;
        Ok(dir)
    }
}

fn sanitize_prefix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
