//! Update discovery.
//!
//! The fetcher turns a product name into a verified manifest. Checking for
//! updates must never disrupt the host application, so the `find_*`
//! methods log and swallow every failure and report "no update" instead.
//! The `try_*` variants return the error for callers that want it.

use std::path::Path;

use chrono::{DateTime, Utc};
use semver::Version;
use tracing::{debug, info, warn};
use url::Url;

use crate::bundle::BundleManifest;
use crate::client::UpdateClient;
use crate::config::{DeliveryMode, UpdaterConfig};
use crate::error::UpdateError;
use crate::manifest::{SyncOutcome, UpdateManifest};
use crate::progress::ProgressReporter;
use crate::trust::{PayloadCipher, TrustContext, BLOB_IV_LEN, BLOB_KEY_LEN};

/// Retrieves and verifies manifests published under one base URI.
#[derive(Debug, Clone)]
pub struct ManifestFetcher {
    base_uri: Url,
    client: UpdateClient,
}

impl ManifestFetcher {
    /// Create a fetcher for manifests under `base_uri`.
    pub fn new(base_uri: &str, client: UpdateClient) -> Result<Self, UpdateError> {
        let mut base_uri = Url::parse(base_uri)
            .map_err(|e| UpdateError::ConfigError(format!("invalid base_uri: {}", e)))?;
        if !base_uri.path().ends_with('/') {
            let path = format!("{}/", base_uri.path());
            base_uri.set_path(&path);
        }
        Ok(Self { base_uri, client })
    }

    /// Create a fetcher from configuration.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        Self::new(&config.base_uri, UpdateClient::from_config(config)?)
    }

    pub fn base_uri(&self) -> &Url {
        &self.base_uri
    }

    pub fn client(&self) -> &UpdateClient {
        &self.client
    }

    /// The trust context every manifest is verified against.
    pub fn trust(&self) -> &TrustContext {
        self.client.trust()
    }

    /// Streaming decryptor for an arbitrary key and IV.
    pub fn create_decryptor(
        &self,
        key: &[u8; BLOB_KEY_LEN],
        iv: &[u8; BLOB_IV_LEN],
    ) -> PayloadCipher {
        PayloadCipher::new(key, iv)
    }

    /// Streaming decryptor keyed by the pre-shared blob key and IV.
    pub fn blob_decryptor(&self) -> PayloadCipher {
        self.trust().blob_cipher()
    }

    /// `{base_uri}/{product}.xml`
    pub fn manifest_url(&self, product_name: &str) -> Result<Url, UpdateError> {
        self.product_url(product_name, "xml")
    }

    /// `{base_uri}/{product}.bundle`
    pub fn bundle_url(&self, product_name: &str) -> Result<Url, UpdateError> {
        self.product_url(product_name, "bundle")
    }

    fn product_url(&self, product_name: &str, extension: &str) -> Result<Url, UpdateError> {
        validate_product_name(product_name)?;
        self.base_uri
            .join(&format!("{}.{}", product_name, extension))
            .map_err(|e| UpdateError::ConfigError(format!("cannot build URL: {}", e)))
    }

    /// Fetch and verify the incremental manifest for `product_name`.
    ///
    /// Returns `None` on any transport, parse or verification failure.
    pub async fn find_update(&self, product_name: &str) -> Option<UpdateManifest> {
        match self.try_find_update(product_name).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(product = %product_name, error = %e, "No update available");
                None
            }
        }
    }

    /// Like [`find_update`](Self::find_update) but returns the failure.
    pub async fn try_find_update(&self, product_name: &str) -> Result<UpdateManifest, UpdateError> {
        let url = self.manifest_url(product_name)?;
        debug!(url = %url, "Checking for update");

        let xml = self.client.downloader().fetch_text(&url).await?;
        let manifest = UpdateManifest::parse(&xml, &url, self.client.clone())?;
        ensure_product(manifest.product_name(), product_name)?;

        info!(product = %product_name, version = %manifest.new_version(), "Update manifest found");
        Ok(manifest)
    }

    /// Fetch the legacy bundle manifest for `product_name`.
    ///
    /// Same failure policy as [`find_update`](Self::find_update).
    pub async fn find_bundle_update(&self, product_name: &str) -> Option<BundleManifest> {
        match self.try_find_bundle_update(product_name).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(product = %product_name, error = %e, "No bundle update available");
                None
            }
        }
    }

    /// Like [`find_bundle_update`](Self::find_bundle_update) but returns the
    /// failure.
    pub async fn try_find_bundle_update(
        &self,
        product_name: &str,
    ) -> Result<BundleManifest, UpdateError> {
        let url = self.manifest_url(product_name)?;
        debug!(url = %url, "Checking for bundle update");

        let xml = self.client.downloader().fetch_text(&url).await?;
        let manifest = BundleManifest::parse(&xml, self.bundle_url(product_name)?, self.client.clone())?;
        ensure_product(manifest.product_name(), product_name)?;

        info!(product = %product_name, version = %manifest.new_version(), "Bundle manifest found");
        Ok(manifest)
    }

    /// Check for an update using the given delivery strategy.
    pub async fn check(&self, product_name: &str, mode: DeliveryMode) -> Option<AvailableUpdate> {
        match mode {
            DeliveryMode::Incremental => self
                .find_update(product_name)
                .await
                .map(AvailableUpdate::Incremental),
            DeliveryMode::Bundle => self
                .find_bundle_update(product_name)
                .await
                .map(AvailableUpdate::Bundle),
        }
    }
}

fn validate_product_name(product_name: &str) -> Result<(), UpdateError> {
    let valid = !product_name.is_empty()
        && product_name != "."
        && product_name != ".."
        && !product_name.contains(['/', '\\', '?', '#']);
    if valid {
        Ok(())
    } else {
        Err(UpdateError::ConfigError(format!(
            "invalid product name: {:?}",
            product_name
        )))
    }
}

fn ensure_product(found: &str, expected: &str) -> Result<(), UpdateError> {
    if found != expected {
        return Err(UpdateError::InvalidManifest(format!(
            "manifest is for {:?}, expected {:?}",
            found, expected
        )));
    }
    Ok(())
}

/// An update found by [`ManifestFetcher::check`], behind one "check and
/// apply" surface regardless of how it is delivered.
#[derive(Debug, Clone)]
pub enum AvailableUpdate {
    /// Per-file manifest; only changed files are fetched
    Incremental(UpdateManifest),
    /// Whole-tree encrypted archive
    Bundle(BundleManifest),
}

impl AvailableUpdate {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            Self::Incremental(_) => DeliveryMode::Incremental,
            Self::Bundle(_) => DeliveryMode::Bundle,
        }
    }

    pub fn product_name(&self) -> &str {
        match self {
            Self::Incremental(manifest) => manifest.product_name(),
            Self::Bundle(manifest) => manifest.product_name(),
        }
    }

    pub fn new_version(&self) -> &Version {
        match self {
            Self::Incremental(manifest) => manifest.new_version(),
            Self::Bundle(manifest) => manifest.new_version(),
        }
    }

    pub fn publish_date(&self) -> DateTime<Utc> {
        match self {
            Self::Incremental(manifest) => manifest.publish_date(),
            Self::Bundle(manifest) => manifest.publish_date(),
        }
    }

    pub fn is_newer_than(&self, installed: &Version) -> bool {
        self.new_version() > installed
    }

    /// Changelog text for everything newer than `installed`.
    pub fn changes(&self, installed: &Version) -> String {
        match self {
            Self::Incremental(manifest) => manifest.get_changes(installed),
            Self::Bundle(manifest) => manifest.get_changes(installed),
        }
    }

    /// Download and verify the update into a fresh staging directory.
    pub async fn apply(
        &self,
        install_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<SyncOutcome, UpdateError> {
        match self {
            Self::Incremental(manifest) => manifest.download_files(install_dir, progress).await,
            Self::Bundle(manifest) => manifest.download(install_dir, progress).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(base: &str, dir: &Path) -> ManifestFetcher {
        ManifestFetcher::new(base, testutil::client(dir)).unwrap()
    }

    #[test]
    fn test_manifest_url_adds_trailing_slash() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher("https://updates.example.com/feed", dir.path());
        assert_eq!(
            fetcher.manifest_url("Ledger").unwrap().as_str(),
            "https://updates.example.com/feed/Ledger.xml"
        );
        assert_eq!(
            fetcher.bundle_url("Ledger").unwrap().as_str(),
            "https://updates.example.com/feed/Ledger.bundle"
        );
    }

    #[test]
    fn test_product_name_cannot_escape_base() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher("https://updates.example.com/feed/", dir.path());
        assert!(fetcher.manifest_url("../other").is_err());
        assert!(fetcher.manifest_url("").is_err());
    }

    #[test]
    fn test_invalid_base_uri() {
        let dir = TempDir::new().unwrap();
        let result = ManifestFetcher::new("not a url", testutil::client(dir.path()));
        assert!(matches!(result, Err(UpdateError::ConfigError(_))));
    }

    #[test]
    fn test_decryptors_share_keystream_with_trust() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher("https://updates.example.com/", dir.path());

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        fetcher.blob_decryptor().apply(&mut a);
        fetcher
            .create_decryptor(&testutil::BLOB_KEY, &testutil::BLOB_IV)
            .apply(&mut b);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_find_update_swallows_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Garbage.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not xml at all"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&server.uri(), dir.path());

        assert!(fetcher.find_update("Missing").await.is_none());
        assert!(fetcher.find_update("Garbage").await.is_none());
        assert!(fetcher.find_bundle_update("Garbage").await.is_none());
        assert!(fetcher.check("Missing", DeliveryMode::Incremental).await.is_none());

        let err = fetcher.try_find_update("Missing").await.unwrap_err();
        assert!(matches!(err, UpdateError::DownloadFailed { status: 404 }));
    }

    #[tokio::test]
    async fn test_find_update_unreachable_host() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher("http://127.0.0.1:9/", dir.path());
        assert!(fetcher.find_update("Ledger").await.is_none());
    }
}
