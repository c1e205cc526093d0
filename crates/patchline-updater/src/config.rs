//! Configuration structures for the update system.
//!
//! Defines where updates are published, how they are delivered, the
//! network settings used to fetch them, and the locally provisioned
//! key material that everything downloaded is checked against.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Base URI the manifests are published under
    pub base_uri: String,

    /// Product name; the manifest lives at `{base_uri}/{product_name}.xml`
    pub product_name: String,

    /// Delivery strategy (per-file incremental or whole bundle)
    #[serde(default)]
    pub mode: DeliveryMode,

    /// Root under which fresh staging directories are created
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Trusted key material
    pub trust: TrustConfig,
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the staging root, using the OS temp directory if not specified.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// How an update is transferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Signed per-file manifest; only changed files are fetched
    #[default]
    Incremental,
    /// Legacy single encrypted archive for the whole tree
    Bundle,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incremental => write!(f, "incremental"),
            Self::Bundle => write!(f, "bundle"),
        }
    }
}

/// Network configuration for downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Read timeout for streaming bodies in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// User agent override
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            read_timeout_seconds: default_read_timeout(),
            user_agent: None,
        }
    }
}

/// Client-side trust material.
///
/// Format:
/// - `public_key`: `"ed25519:<hex_or_base64_public_key>"`
/// - `blob_key`: 32 bytes, hex encoded
/// - `blob_iv`: 12 bytes, hex encoded
#[derive(Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    pub public_key: String,
    pub blob_key: String,
    pub blob_iv: String,
}

impl std::fmt::Debug for TrustConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustConfig")
            .field("public_key", &self.public_key)
            .field("blob_key", &"<redacted>")
            .field("blob_iv", &"<redacted>")
            .finish()
    }
}

/// Publisher-side key material. Never shipped to clients.
///
/// `signing_key` is `"ed25519:<hex_seed>"`; `blob_key`/`blob_iv` are the
/// same pre-shared values clients receive in their [`TrustConfig`].
#[derive(Clone, Serialize, Deserialize)]
pub struct PublisherKeys {
    pub signing_key: String,
    pub blob_key: String,
    pub blob_iv: String,
}

impl PublisherKeys {
    /// Load publisher keys from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))
    }

    /// Save publisher keys to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Derive the client trust configuration for these keys.
    pub fn trust_config(&self) -> Result<TrustConfig, UpdateError> {
        let signing_key = crate::trust::parse_signing_key(&self.signing_key)?;
        Ok(TrustConfig {
            public_key: format!("ed25519:{}", hex::encode(signing_key.verifying_key().as_bytes())),
            blob_key: self.blob_key.clone(),
            blob_iv: self.blob_iv.clone(),
        })
    }
}

impl std::fmt::Debug for PublisherKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherKeys").finish_non_exhaustive()
    }
}

// Default value functions for serde
fn default_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}
