//! Legacy whole-bundle delivery.
//!
//! Instead of per-file entries, a bundle release ships the entire install
//! tree as one encrypted [archive](crate::archive). The manifest carries a
//! `Blob` element, encrypted under the pre-shared key, holding the
//! archive's own key, IV and the publisher's signature over the SHA-512 of
//! the decrypted archive:
//!
//! ```xml
//! <Bundle Name="Ledger" NewVersion="2.0.0" PublishDate="2024-06-01T00:00:00.000Z">
//!   <Description>What changed</Description>
//!   <Blob>base64(encrypt(key[32] || iv[12] || signature[64]))</Blob>
//! </Bundle>
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, SIGNATURE_LENGTH};
use futures_util::StreamExt;
use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};
use url::Url;
use zeroize::Zeroizing;

use crate::archive::extract_archive;
use crate::client::UpdateClient;
use crate::error::UpdateError;
use crate::integrity::DigestWriter;
use crate::manifest::{
    discard_staging, format_timestamp, parse_timestamp, to_xml_document, SyncOutcome,
};
use crate::progress::{Outcome, ProgressReporter};
use crate::trust::{PayloadCipher, TrustContext, BLOB_IV_LEN, BLOB_KEY_LEN, DIGEST_LEN};

/// Length of the decrypted `Blob` element.
pub const BLOB_LEN: usize = BLOB_KEY_LEN + BLOB_IV_LEN + SIGNATURE_LENGTH;

/// Key material carried inside the `Blob` element.
#[derive(Clone)]
pub struct BundleSecrets {
    key: Zeroizing<[u8; BLOB_KEY_LEN]>,
    iv: Zeroizing<[u8; BLOB_IV_LEN]>,
    signature: Signature,
}

impl BundleSecrets {
    pub fn new(key: [u8; BLOB_KEY_LEN], iv: [u8; BLOB_IV_LEN], signature: Signature) -> Self {
        Self {
            key: Zeroizing::new(key),
            iv: Zeroizing::new(iv),
            signature,
        }
    }

    /// Decrypt and split a `Blob` value.
    pub fn from_blob(encoded: &str, trust: &TrustContext) -> Result<Self, UpdateError> {
        let mut blob = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| UpdateError::InvalidManifest(format!("Blob is not base64: {}", e)))?,
        );
        if blob.len() != BLOB_LEN {
            return Err(UpdateError::InvalidManifest(format!(
                "Blob must be {} bytes, got {}",
                BLOB_LEN,
                blob.len()
            )));
        }
        trust.blob_cipher().apply(&mut blob);

        let (key, rest) = blob.split_at(BLOB_KEY_LEN);
        let (iv, signature) = rest.split_at(BLOB_IV_LEN);

        let mut key_bytes = [0u8; BLOB_KEY_LEN];
        key_bytes.copy_from_slice(key);
        let mut iv_bytes = [0u8; BLOB_IV_LEN];
        iv_bytes.copy_from_slice(iv);
        let signature = Signature::from_slice(signature)?;

        Ok(Self::new(key_bytes, iv_bytes, signature))
    }

    /// Encrypt into a `Blob` value. Publisher side.
    pub fn to_blob(&self, trust: &TrustContext) -> String {
        let mut blob = Zeroizing::new(Vec::with_capacity(BLOB_LEN));
        blob.extend_from_slice(self.key.as_slice());
        blob.extend_from_slice(self.iv.as_slice());
        blob.extend_from_slice(&self.signature.to_bytes());
        trust.blob_cipher().apply(&mut blob);
        STANDARD.encode(blob.as_slice())
    }

    /// Cipher for the archive payload.
    pub fn cipher(&self) -> PayloadCipher {
        PayloadCipher::new(&self.key, &self.iv)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl std::fmt::Debug for BundleSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleSecrets").finish_non_exhaustive()
    }
}

/// A parsed bundle manifest with its decrypted secrets.
#[derive(Debug, Clone)]
pub struct BundleManifest {
    product_name: String,
    new_version: Version,
    publish_date: DateTime<Utc>,
    description: String,
    secrets: BundleSecrets,
    payload_url: Url,
    client: UpdateClient,
}

impl BundleManifest {
    /// Parse a bundle manifest whose archive lives at `payload_url`.
    pub fn parse(xml: &str, payload_url: Url, client: UpdateClient) -> Result<Self, UpdateError> {
        let doc: BundleDoc = quick_xml::de::from_str(xml)
            .map_err(|e| UpdateError::InvalidManifest(format!("malformed XML: {}", e)))?;

        if doc.name.trim().is_empty() {
            return Err(UpdateError::InvalidManifest("missing product name".to_string()));
        }
        let new_version = Version::parse(doc.new_version.trim())?;
        let publish_date = parse_timestamp(&doc.publish_date, "PublishDate")?;
        let secrets = BundleSecrets::from_blob(&doc.blob, client.trust())?;

        debug!(product = %doc.name, version = %new_version, "Bundle manifest parsed");

        Ok(Self {
            product_name: doc.name,
            new_version,
            publish_date,
            description: doc.description.trim().to_string(),
            secrets,
            payload_url,
            client,
        })
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn new_version(&self) -> &Version {
        &self.new_version
    }

    pub fn publish_date(&self) -> DateTime<Utc> {
        self.publish_date
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn payload_url(&self) -> &Url {
        &self.payload_url
    }

    pub fn is_newer_than(&self, installed: &Version) -> bool {
        &self.new_version > installed
    }

    /// The description if this bundle is newer than `installed`.
    pub fn get_changes(&self, installed: &Version) -> String {
        if self.is_newer_than(installed) {
            self.description.clone()
        } else {
            String::new()
        }
    }

    /// Download, verify and extract the whole bundle into a fresh staging
    /// directory.
    ///
    /// The archive is decrypted and hashed while it streams to a temporary
    /// file; it is only extracted once the publisher's signature over that
    /// hash verifies. Failure and cancellation handling match
    /// [`UpdateManifest::download_files`](crate::UpdateManifest::download_files).
    pub async fn download(
        &self,
        install_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<SyncOutcome, UpdateError> {
        if !install_dir.is_dir() {
            return Err(UpdateError::DirectoryNotFound(install_dir.to_path_buf()));
        }

        info!(
            product = %self.product_name,
            version = %self.new_version,
            url = %self.payload_url,
            "Starting bundle download"
        );

        let staging = self
            .client
            .new_staging_dir(&self.product_name)
            .map_err(|e| UpdateError::UpdateFailed(Box::new(e)))?;

        match self.download_into(staging.path(), progress).await {
            Ok(Outcome::Completed(())) => {
                let path = staging.keep();
                info!(path = %path.display(), "Bundle staged");
                Ok(SyncOutcome::Staged(path))
            }
            Ok(Outcome::Cancelled) => {
                discard_staging(staging);
                info!("Bundle download canceled");
                Ok(SyncOutcome::Cancelled)
            }
            Err(e) => {
                discard_staging(staging);
                if progress.was_canceled() {
                    return Ok(SyncOutcome::Cancelled);
                }
                error!(error = %e, "Bundle update failed");
                Err(UpdateError::UpdateFailed(Box::new(e)))
            }
        }
    }

    async fn download_into(
        &self,
        staging: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<Outcome<()>, UpdateError> {
        progress.set_caption(&self.product_name);
        progress.set_progress(0);
        if progress.was_canceled() {
            return Ok(Outcome::Cancelled);
        }

        let response = self.client.downloader().open(&self.payload_url).await?;
        progress.set_maximum(response.content_length().unwrap_or(0) as i64);

        let mut archive = NamedTempFile::new_in(self.client.staging_root())?;
        let digest = {
            let mut cipher = self.secrets.cipher();
            let mut writer = DigestWriter::with_progress(BufWriter::new(archive.as_file_mut()), progress);
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                if progress.was_canceled() {
                    return Ok(Outcome::Cancelled);
                }
                let chunk = chunk.map_err(|e| UpdateError::NetworkError(e.to_string()))?;
                buffer.clear();
                buffer.extend_from_slice(&chunk);
                cipher.apply(&mut buffer);
                writer.write_all(&buffer)?;
            }
            let (inner, _, digest) = writer.finish();
            inner.into_inner().map_err(|e| e.into_error())?.flush()?;
            digest
        };

        self.verify_archive(&digest)?;

        let file: File = archive.reopen()?;
        let outcome = extract_archive(file, staging, progress)?;
        Ok(match outcome {
            Outcome::Completed(_) => Outcome::Completed(()),
            Outcome::Cancelled => Outcome::Cancelled,
        })
    }

    fn verify_archive(&self, digest: &[u8; DIGEST_LEN]) -> Result<(), UpdateError> {
        if let Err(e) = self.client.trust().verify_digest(digest, self.secrets.signature()) {
            error!(product = %self.product_name, "Bundle signature does not verify");
            return Err(e);
        }
        Ok(())
    }
}

/// Render a bundle manifest. Publisher side.
pub fn render_bundle(
    product_name: &str,
    new_version: &Version,
    publish_date: &DateTime<Utc>,
    description: &str,
    secrets: &BundleSecrets,
    trust: &TrustContext,
) -> Result<String, UpdateError> {
    let doc = BundleDoc {
        name: product_name.to_string(),
        new_version: new_version.to_string(),
        publish_date: format_timestamp(publish_date),
        description: description.to_string(),
        blob: secrets.to_blob(trust),
    };
    to_xml_document(&doc)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "Bundle")]
struct BundleDoc {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "@NewVersion")]
    new_version: String,
    #[serde(rename = "@PublishDate")]
    publish_date: String,
    #[serde(rename = "Description", default)]
    description: String,
    #[serde(rename = "Blob")]
    blob: String,
}
