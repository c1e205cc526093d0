//! Release publishing.
//!
//! The publisher owns the Ed25519 signing key and produces everything the
//! client consumes: encrypted per-file payloads with a signed manifest, or
//! a single encrypted bundle. Output is written into a directory that is
//! then served as-is under the client's `base_uri`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use rand_core::{OsRng, RngCore};
use semver::Version;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use url::Url;
use walkdir::WalkDir;
use zeroize::Zeroizing;

use crate::archive::write_archive;
use crate::bundle::{render_bundle, BundleSecrets};
use crate::config::PublisherKeys;
use crate::descriptor::FileDescriptor;
use crate::error::UpdateError;
use crate::integrity::DigestWriter;
use crate::manifest::{read_version_history, render, VersionEntry};
use crate::payload::{encode_payload, EncryptingWriter};
use crate::progress::{NoProgress, Outcome};
use crate::relpath;
use crate::trust::{
    decode_hex_array, parse_signing_key, sign_digest, PayloadCipher, TrustContext, BLOB_IV_LEN,
    BLOB_KEY_LEN,
};

/// Directory under the output root that holds per-file payloads.
pub const FILES_DIR: &str = "files";

/// Describes one release.
#[derive(Debug, Clone)]
pub struct ReleaseSpec {
    pub product_name: String,
    pub version: Version,
    pub publish_date: DateTime<Utc>,
    /// Changelog text for this version
    pub changes: String,
    /// Public URL of the output directory
    pub base_url: Url,
}

impl ReleaseSpec {
    /// Public URL of `{product}.xml`.
    pub fn manifest_url(&self) -> Result<Url, UpdateError> {
        self.base_url
            .join(&format!("{}.xml", self.product_name))
            .map_err(|e| UpdateError::ConfigError(format!("invalid base URL: {}", e)))
    }
}

/// Files written by a publish run.
#[derive(Debug, Clone)]
pub struct PublishSummary {
    pub manifest_path: PathBuf,
    pub payload_paths: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Signs and writes releases.
pub struct Publisher {
    signing_key: SigningKey,
    trust: TrustContext,
}

impl Publisher {
    pub fn new(
        signing_key: SigningKey,
        blob_key: [u8; BLOB_KEY_LEN],
        blob_iv: [u8; BLOB_IV_LEN],
    ) -> Self {
        let trust = TrustContext::new(signing_key.verifying_key(), blob_key, blob_iv);
        Self { signing_key, trust }
    }

    /// Build a publisher from its key file contents.
    pub fn from_keys(keys: &PublisherKeys) -> Result<Self, UpdateError> {
        let signing_key = parse_signing_key(&keys.signing_key)?;
        let blob_key = Zeroizing::new(decode_hex_array::<BLOB_KEY_LEN>(&keys.blob_key, "blob_key")?);
        let blob_iv = decode_hex_array::<BLOB_IV_LEN>(&keys.blob_iv, "blob_iv")?;
        Ok(Self::new(signing_key, *blob_key, blob_iv))
    }

    /// Generate fresh publisher keys.
    pub fn generate_keys() -> PublisherKeys {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut blob_key = Zeroizing::new([0u8; BLOB_KEY_LEN]);
        let mut blob_iv = [0u8; BLOB_IV_LEN];
        OsRng.fill_bytes(blob_key.as_mut_slice());
        OsRng.fill_bytes(&mut blob_iv);

        PublisherKeys {
            signing_key: format!("ed25519:{}", hex::encode(signing_key.to_bytes())),
            blob_key: hex::encode(blob_key.as_slice()),
            blob_iv: hex::encode(blob_iv),
        }
    }

    /// Trust context clients need to consume this publisher's releases.
    pub fn trust(&self) -> &TrustContext {
        &self.trust
    }

    /// Publish an incremental release of `source_dir` into `output_dir`.
    ///
    /// Writes one encrypted payload per file under `files/` and a signed
    /// `{product}.xml`. Versions listed in an existing manifest are carried
    /// over; the new version must be newer than all of them.
    pub fn publish_incremental(
        &self,
        release: &ReleaseSpec,
        source_dir: &Path,
        output_dir: &Path,
    ) -> Result<PublishSummary, UpdateError> {
        if !source_dir.is_dir() {
            return Err(UpdateError::DirectoryNotFound(source_dir.to_path_buf()));
        }
        fs::create_dir_all(output_dir)?;

        let manifest_path = output_dir.join(format!("{}.xml", release.product_name));
        let manifest_url = release.manifest_url()?;
        let versions = self.version_history(release, &manifest_path)?;

        let files_root = output_dir.join(FILES_DIR);
        if files_root.exists() {
            fs::remove_dir_all(&files_root)?;
        }

        let mut descriptors = Vec::new();
        let mut payload_paths = Vec::new();
        let mut total_bytes = 0u64;
        for relative_path in source_files(source_dir)? {
            let remote_url = payload_url(&release.base_url, &relative_path)?;
            let descriptor =
                FileDescriptor::create(source_dir, &relative_path, remote_url, &self.signing_key)?;

            let payload_path = relpath::to_native(&files_root, &relative_path);
            self.write_payload(&descriptor.local_path(source_dir), &payload_path, &relative_path)?;
            debug!(path = %relative_path, bytes = descriptor.length(), "Payload written");

            total_bytes += descriptor.length();
            payload_paths.push(payload_path);
            descriptors.push(descriptor);
        }

        let xml = render(&release.product_name, &versions, &descriptors, Some(&manifest_url))?;
        write_atomically(&manifest_path, xml.as_bytes())?;

        info!(
            product = %release.product_name,
            version = %release.version,
            files = descriptors.len(),
            bytes = total_bytes,
            "Incremental release published"
        );
        Ok(PublishSummary {
            manifest_path,
            payload_paths,
            total_bytes,
        })
    }

    /// Publish `source_dir` as a single encrypted bundle.
    ///
    /// Writes `{product}.bundle` (the encrypted archive under a fresh
    /// random key) and `{product}.xml` carrying that key, sealed under the
    /// pre-shared blob key, and a signature over the archive's hash.
    pub fn publish_bundle(
        &self,
        release: &ReleaseSpec,
        source_dir: &Path,
        output_dir: &Path,
    ) -> Result<PublishSummary, UpdateError> {
        if !source_dir.is_dir() {
            return Err(UpdateError::DirectoryNotFound(source_dir.to_path_buf()));
        }
        fs::create_dir_all(output_dir)?;

        let mut key = Zeroizing::new([0u8; BLOB_KEY_LEN]);
        let mut iv = [0u8; BLOB_IV_LEN];
        OsRng.fill_bytes(key.as_mut_slice());
        OsRng.fill_bytes(&mut iv);

        let bundle_path = output_dir.join(format!("{}.bundle", release.product_name));
        let staged = NamedTempFile::new_in(output_dir)?;
        let encrypting = EncryptingWriter::new(
            PayloadCipher::new(&key, &iv),
            BufWriter::new(staged.as_file()),
        );
        let mut writer = DigestWriter::new(encrypting);
        let summary = match write_archive(source_dir, &mut writer, &NoProgress)? {
            Outcome::Completed(summary) => summary,
            Outcome::Cancelled => {
                return Err(UpdateError::InvalidOperation("bundle write canceled".to_string()));
            }
        };
        let (encrypting, _, digest) = writer.finish();
        encrypting
            .into_inner()
            .into_inner()
            .map_err(|e| e.into_error())?
            .flush()?;

        let secrets = BundleSecrets::new(*key, iv, sign_digest(&self.signing_key, &digest));
        let xml = render_bundle(
            &release.product_name,
            &release.version,
            &release.publish_date,
            &release.changes,
            &secrets,
            &self.trust,
        )?;

        staged.persist(&bundle_path).map_err(|e| e.error)?;
        let manifest_path = output_dir.join(format!("{}.xml", release.product_name));
        write_atomically(&manifest_path, xml.as_bytes())?;

        info!(
            product = %release.product_name,
            version = %release.version,
            files = summary.file_count,
            bytes = summary.total_bytes,
            "Bundle release published"
        );
        Ok(PublishSummary {
            manifest_path,
            payload_paths: vec![bundle_path],
            total_bytes: summary.total_bytes,
        })
    }

    fn version_history(
        &self,
        release: &ReleaseSpec,
        manifest_path: &Path,
    ) -> Result<Vec<VersionEntry>, UpdateError> {
        let mut versions = if manifest_path.exists() {
            read_version_history(&fs::read_to_string(manifest_path)?)?
        } else {
            Vec::new()
        };

        if let Some(latest) = versions.first() {
            if latest.version() >= &release.version {
                return Err(UpdateError::InvalidOperation(format!(
                    "version {} is not newer than published {}",
                    release.version,
                    latest.version()
                )));
            }
        }

        versions.insert(
            0,
            VersionEntry::new(release.version.clone(), release.publish_date, release.changes.clone()),
        );
        Ok(versions)
    }

    fn write_payload(&self, source: &Path, target: &Path, relative_path: &str) -> Result<(), UpdateError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let input = File::open(source)?;
        let mut output = BufWriter::new(File::create(target)?);
        encode_payload(self.trust.file_cipher(relative_path), input, &mut output)?;
        output.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

/// `{base_url}/files/{relative_path}` with each segment percent-encoded.
fn payload_url(base_url: &Url, relative_path: &str) -> Result<Url, UpdateError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| UpdateError::ConfigError(format!("base URL cannot hold paths: {}", base_url)))?
        .pop_if_empty()
        .push(FILES_DIR)
        .extend(relative_path.split('/'));
    Ok(url)
}

/// Relative paths of every regular file under `root`, in name order.
fn source_files(root: &Path) -> Result<Vec<String>, UpdateError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| UpdateError::InvalidOperation(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative_path = relpath::from_native(root, entry.path()).ok_or_else(|| {
            UpdateError::InvalidOperation(format!("unsupported path {}", entry.path().display()))
        })?;
        files.push(relative_path);
    }
    Ok(files)
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), UpdateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    staged.flush()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn publisher() -> Publisher {
        Publisher::new(testutil::signing_key(), testutil::BLOB_KEY, testutil::BLOB_IV)
    }

    fn release(version: &str) -> ReleaseSpec {
        ReleaseSpec {
            product_name: "Ledger".to_string(),
            version: Version::parse(version).unwrap(),
            publish_date: Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap(),
            changes: format!("Release {}", version),
            base_url: Url::parse("https://updates.example.com/feed/").unwrap(),
        }
    }

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("app"), b"app binary").unwrap();
        fs::write(dir.path().join("lib/core.so"), vec![1u8; 5000]).unwrap();
        dir
    }

    #[test]
    fn test_generate_keys_roundtrip() {
        let keys = Publisher::generate_keys();
        let publisher = Publisher::from_keys(&keys).unwrap();
        let trust = TrustContext::from_config(&keys.trust_config().unwrap()).unwrap();
        assert_eq!(publisher.trust().public_key(), trust.public_key());
        assert_ne!(keys.blob_key, Publisher::generate_keys().blob_key);
    }

    #[test]
    fn test_publish_incremental_layout() {
        let source = source_tree();
        let output = TempDir::new().unwrap();
        let summary = publisher()
            .publish_incremental(&release("1.0.0"), source.path(), output.path())
            .unwrap();

        assert_eq!(summary.manifest_path, output.path().join("Ledger.xml"));
        assert_eq!(summary.total_bytes, 5010);
        assert!(output.path().join("files/app").exists());
        assert!(output.path().join("files/lib/core.so").exists());
        assert_ne!(fs::read(output.path().join("files/app")).unwrap(), b"app binary");

        let xml = fs::read_to_string(&summary.manifest_path).unwrap();
        assert!(xml.contains("Url=\"files/lib/core.so\""));
    }

    #[test]
    fn test_publish_carries_over_versions() {
        let source = source_tree();
        let output = TempDir::new().unwrap();
        let publisher = publisher();
        publisher
            .publish_incremental(&release("1.0.0"), source.path(), output.path())
            .unwrap();
        publisher
            .publish_incremental(&release("1.1.0"), source.path(), output.path())
            .unwrap();

        let xml = fs::read_to_string(output.path().join("Ledger.xml")).unwrap();
        let history = read_version_history(&xml).unwrap();
        let versions: Vec<String> = history.iter().map(|v| v.version().to_string()).collect();
        assert_eq!(versions, ["1.1.0", "1.0.0"]);

        let again = publisher.publish_incremental(&release("1.1.0"), source.path(), output.path());
        assert!(matches!(again, Err(UpdateError::InvalidOperation(_))));
    }

    #[test]
    fn test_publish_bundle_writes_both_files() {
        let source = source_tree();
        let output = TempDir::new().unwrap();
        let summary = publisher()
            .publish_bundle(&release("2.0.0"), source.path(), output.path())
            .unwrap();

        let bundle = output.path().join("Ledger.bundle");
        assert_eq!(summary.payload_paths, vec![bundle.clone()]);
        assert!(fs::metadata(&bundle).unwrap().len() > 5010);
        let xml = fs::read_to_string(output.path().join("Ledger.xml")).unwrap();
        assert!(xml.contains("<Blob>"));
        assert!(xml.contains("NewVersion=\"2.0.0\""));
    }

    #[test]
    fn test_payload_url_escapes_segments() {
        let base = Url::parse("https://updates.example.com/feed/").unwrap();
        assert_eq!(
            payload_url(&base, "docs/read me#1.txt").unwrap().as_str(),
            "https://updates.example.com/feed/files/docs/read%20me%231.txt"
        );
    }

    #[test]
    fn test_publish_requires_source() {
        let output = TempDir::new().unwrap();
        let result = publisher().publish_incremental(
            &release("1.0.0"),
            &output.path().join("missing"),
            output.path(),
        );
        assert!(matches!(result, Err(UpdateError::DirectoryNotFound(_))));
    }
}
