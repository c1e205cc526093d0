//! HTTP transport.
//!
//! Thin wrapper over a configured `reqwest` client. Manifests are fetched
//! into memory; payloads are opened as responses and streamed by the
//! caller so they never have to fit in memory.

use std::time::Duration;

use reqwest::Response;
use tracing::debug;
use url::Url;

use crate::config::NetworkConfig;
use crate::error::UpdateError;

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for streaming downloads in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
    /// Read timeout for streaming in seconds.
    pub read_timeout_secs: u64,
    /// User agent string.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            user_agent: default_user_agent(),
        }
    }
}

impl From<&NetworkConfig> for DownloaderConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            timeout_secs: network.timeout_seconds,
            read_timeout_secs: network.read_timeout_seconds,
            user_agent: network
                .user_agent
                .clone()
                .unwrap_or_else(default_user_agent),
        }
    }
}

fn default_user_agent() -> String {
    format!("patchline-updater/{}", env!("CARGO_PKG_VERSION"))
}

/// HTTP GET client for manifests and payloads.
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Downloader {
    /// HTTP client configured with timeouts.
    client: reqwest::Client,
    /// Configuration settings.
    config: DownloaderConfig,
}

impl Downloader {
    /// Create a new downloader with default settings.
    ///
    /// Uses a 30-second connection timeout and 60-second read timeout.
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Create a new downloader with custom configuration.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client, config })
    }

    /// The active configuration.
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Fetch data from a URL into memory.
    ///
    /// This is suitable for small documents like manifests.
    /// For payloads, use [`Downloader::open`] and stream the body.
    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>, UpdateError> {
        let response = self.open(url).await?;
        let bytes = response.bytes().await?;
        debug!(url = %url, len = bytes.len(), "Fetched document");
        Ok(bytes.to_vec())
    }

    /// Fetch a UTF-8 text document.
    pub async fn fetch_text(&self, url: &Url) -> Result<String, UpdateError> {
        let bytes = self.fetch(url).await?;
        String::from_utf8(bytes)
            .map_err(|e| UpdateError::InvalidManifest(format!("document is not UTF-8: {}", e)))
    }

    /// Send a GET request and return the response once its status is
    /// known to be successful.
    pub async fn open(&self, url: &Url) -> Result<Response, UpdateError> {
        debug!(url = %url, "GET");

        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }

        Ok(response)
    }
}
