//! Signed update manifest and the incremental sync algorithm.
//!
//! The manifest is an XML document listing the released versions (newest
//! first, each with its changelog) and every file of the newest release.
//! Parsing is fail-closed: a single file whose signature does not verify
//! rejects the whole document.
//!
//! ```xml
//! <Update Name="Ledger">
//!   <Versions>
//!     <Version PublishDate="2024-05-01T10:00:00.000Z" Version="1.2.0">Fixes</Version>
//!   </Versions>
//!   <Files>
//!     <File RelativePath="bin/app" Url="files/bin/app" Size="1024"
//!           Timestamp="2024-05-01T09:58:12.000Z">
//!       <Hash>base64 SHA-512</Hash>
//!       <Signature>base64 Ed25519</Signature>
//!     </File>
//!   </Files>
//! </Update>
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, SIGNATURE_LENGTH};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::UpdateClient;
use crate::descriptor::FileDescriptor;
use crate::error::UpdateError;
use crate::progress::{ChildProgress, Outcome, ProgressReporter};
use crate::trust::DIGEST_LEN;

/// Separator placed between changelog entries by
/// [`UpdateManifest::get_changes`].
pub const CHANGES_SEPARATOR: &str = "\n\n";

/// Largest accepted `Size`, alone or summed over a manifest. Progress is
/// reported as `i64`.
const MAX_SIZE: u64 = i64::MAX as u64;

/// One released version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    publish_date: DateTime<Utc>,
    version: Version,
    changes: String,
}

impl VersionEntry {
    pub fn new(version: Version, publish_date: DateTime<Utc>, changes: impl Into<String>) -> Self {
        Self {
            publish_date,
            version,
            changes: changes.into(),
        }
    }

    pub fn publish_date(&self) -> DateTime<Utc> {
        self.publish_date
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn changes(&self) -> &str {
        &self.changes
    }
}

/// Result of [`UpdateManifest::download_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every pending file was downloaded and verified into this fresh
    /// staging directory
    Staged(PathBuf),
    /// The caller canceled; nothing was left on disk
    Cancelled,
}

impl SyncOutcome {
    pub fn staged_path(&self) -> Option<&Path> {
        match self {
            Self::Staged(path) => Some(path),
            Self::Cancelled => None,
        }
    }
}

/// A parsed and fully verified manifest.
#[derive(Debug, Clone)]
pub struct UpdateManifest {
    product_name: String,
    versions: Vec<VersionEntry>,
    files: Vec<FileDescriptor>,
    client: UpdateClient,
}

impl UpdateManifest {
    /// Parse `xml` fetched from `manifest_url`, verifying every file
    /// signature against the client's trust context.
    ///
    /// Relative file URLs are resolved against `manifest_url`.
    pub fn parse(xml: &str, manifest_url: &Url, client: UpdateClient) -> Result<Self, UpdateError> {
        let doc: UpdateDoc = quick_xml::de::from_str(xml)
            .map_err(|e| UpdateError::InvalidManifest(format!("malformed XML: {}", e)))?;

        if doc.name.trim().is_empty() {
            return Err(UpdateError::InvalidManifest("missing product name".to_string()));
        }

        let versions = parse_versions(doc.versions.entries)?;

        let mut seen = HashSet::new();
        let mut files = Vec::with_capacity(doc.files.entries.len());
        for entry in doc.files.entries {
            if !seen.insert(entry.relative_path.clone()) {
                return Err(UpdateError::InvalidManifest(format!(
                    "duplicate file entry: {}",
                    entry.relative_path
                )));
            }
            files.push(parse_file(entry, manifest_url, &client)?);
        }
        total_length(&files)?;

        info!(
            product = %doc.name,
            version = %versions[0].version,
            files = files.len(),
            "Manifest verified"
        );

        Ok(Self {
            product_name: doc.name,
            versions,
            files,
            client,
        })
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    /// All versions, newest first.
    pub fn versions(&self) -> &[VersionEntry] {
        &self.versions
    }

    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }

    /// The newest version.
    pub fn latest(&self) -> &VersionEntry {
        &self.versions[0]
    }

    pub fn new_version(&self) -> &Version {
        &self.latest().version
    }

    pub fn publish_date(&self) -> DateTime<Utc> {
        self.latest().publish_date
    }

    /// Whether the newest version is strictly newer than `installed`.
    pub fn is_newer_than(&self, installed: &Version) -> bool {
        self.new_version() > installed
    }

    /// Changelog of every version strictly newer than `installed`, newest
    /// first.
    pub fn get_changes(&self, installed: &Version) -> String {
        collect_changes(&self.versions, installed)
    }

    /// Files whose local copy under `install_dir` does not match.
    pub fn pending_files(&self, install_dir: &Path) -> Vec<&FileDescriptor> {
        self.files
            .iter()
            .filter(|file| !file.matches(install_dir))
            .collect()
    }

    /// Bytes that [`download_files`](Self::download_files) would fetch.
    pub fn total_pending_bytes(&self, install_dir: &Path) -> Result<u64, UpdateError> {
        total_length(self.pending_files(install_dir))
    }

    /// Serialize back to manifest XML with absolute file URLs.
    pub fn to_xml(&self) -> Result<String, UpdateError> {
        render(&self.product_name, &self.versions, &self.files, None)
    }

    /// Download every file that differs from `install_dir` into a fresh
    /// staging directory.
    ///
    /// Files are fetched one at a time in manifest order. `progress` is
    /// sized once to the total pending bytes; each file reports into its own
    /// slice of it. On cancellation or failure the staging directory is
    /// removed. A failure observed after the caller canceled is reported as
    /// [`SyncOutcome::Cancelled`]; any other failure is wrapped in
    /// [`UpdateError::UpdateFailed`].
    pub async fn download_files(
        &self,
        install_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<SyncOutcome, UpdateError> {
        if !install_dir.is_dir() {
            return Err(UpdateError::DirectoryNotFound(install_dir.to_path_buf()));
        }

        let pending = self.pending_files(install_dir);
        let total = total_length(pending.iter().copied())?;
        info!(
            product = %self.product_name,
            version = %self.new_version(),
            files = pending.len(),
            bytes = total,
            "Starting incremental sync"
        );

        let staging = self
            .client
            .new_staging_dir(&self.product_name)
            .map_err(|e| UpdateError::UpdateFailed(Box::new(e)))?;

        let result = self
            .download_into(staging.path(), &pending, total, progress)
            .await;

        match result {
            Ok(Outcome::Completed(())) => {
                let path = staging.keep();
                info!(path = %path.display(), "Update staged");
                Ok(SyncOutcome::Staged(path))
            }
            Ok(Outcome::Cancelled) => {
                discard_staging(staging);
                info!("Sync canceled");
                Ok(SyncOutcome::Cancelled)
            }
            Err(e) => {
                discard_staging(staging);
                if progress.was_canceled() {
                    debug!(error = %e, "Failure after cancellation treated as cancellation");
                    return Ok(SyncOutcome::Cancelled);
                }
                error!(error = %e, "Sync failed");
                Err(UpdateError::UpdateFailed(Box::new(e)))
            }
        }
    }

    async fn download_into(
        &self,
        staging: &Path,
        pending: &[&FileDescriptor],
        total: u64,
        progress: &dyn ProgressReporter,
    ) -> Result<Outcome<()>, UpdateError> {
        progress.set_maximum(total as i64);
        progress.set_progress(0);

        let mut base = 0i64;
        for file in pending {
            if progress.was_canceled() {
                return Ok(Outcome::Cancelled);
            }

            let child = ChildProgress::new(progress, base, file.length() as i64);
            if file
                .download_file(&self.client, staging, &child)
                .await?
                .is_cancelled()
            {
                return Ok(Outcome::Cancelled);
            }
            base += file.length() as i64;
        }

        Ok(Outcome::Completed(()))
    }
}

/// Sum of the declared lengths, bounded so it fits a progress value.
fn total_length<'a>(
    files: impl IntoIterator<Item = &'a FileDescriptor>,
) -> Result<u64, UpdateError> {
    files
        .into_iter()
        .try_fold(0u64, |total, file| {
            total
                .checked_add(file.length())
                .filter(|&sum| sum <= MAX_SIZE)
        })
        .ok_or_else(|| {
            UpdateError::InvalidManifest(format!("total file size exceeds {} bytes", MAX_SIZE))
        })
}

/// Remove a staging directory, logging rather than failing if that is not
/// possible.
pub(crate) fn discard_staging(staging: tempfile::TempDir) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        warn!(path = %path.display(), error = %e, "Could not remove staging directory");
    }
}

/// Concatenate the changelog of every version newer than `installed`.
pub(crate) fn collect_changes(versions: &[VersionEntry], installed: &Version) -> String {
    versions
        .iter()
        .filter(|entry| &entry.version > installed)
        .map(|entry| entry.changes.trim())
        .filter(|changes| !changes.is_empty())
        .collect::<Vec<_>>()
        .join(CHANGES_SEPARATOR)
}

/// Render manifest XML. Publisher side.
///
/// With `manifest_url`, file URLs under the same location are written
/// relative to it so the published tree can be moved as a whole.
pub fn render(
    product_name: &str,
    versions: &[VersionEntry],
    files: &[FileDescriptor],
    manifest_url: Option<&Url>,
) -> Result<String, UpdateError> {
    let doc = UpdateDoc {
        name: product_name.to_string(),
        versions: VersionsDoc {
            entries: versions.iter().map(VersionDoc::from).collect(),
        },
        files: FilesDoc {
            entries: files
                .iter()
                .map(|file| {
                    let mut entry = FileDoc::from(file);
                    if let Some(relative) = manifest_url
                        .and_then(|base| base.make_relative(file.remote_url()))
                        .filter(|relative| !relative.starts_with("../"))
                    {
                        entry.url = relative;
                    }
                    entry
                })
                .collect(),
        },
    };
    to_xml_document(&doc)
}

/// Read only the version history of a manifest, without verifying files.
///
/// Used by the publisher to carry earlier versions into a new release.
pub fn read_version_history(xml: &str) -> Result<Vec<VersionEntry>, UpdateError> {
    let doc: UpdateDoc = quick_xml::de::from_str(xml)
        .map_err(|e| UpdateError::InvalidManifest(format!("malformed XML: {}", e)))?;
    parse_versions(doc.versions.entries)
}

/// Serialize `value` as an indented XML document with a declaration.
pub(crate) fn to_xml_document<T: Serialize>(value: &T) -> Result<String, UpdateError> {
    let mut body = String::new();
    let mut serializer = quick_xml::se::Serializer::new(&mut body);
    serializer.indent(' ', 2);
    value
        .serialize(serializer)
        .map_err(|e| UpdateError::InvalidManifest(format!("cannot serialize: {}", e)))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{}\n", body))
}

pub(crate) fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, UpdateError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| UpdateError::InvalidManifest(format!("invalid {} {:?}: {}", field, value, e)))
}

fn parse_versions(entries: Vec<VersionDoc>) -> Result<Vec<VersionEntry>, UpdateError> {
    if entries.is_empty() {
        return Err(UpdateError::InvalidManifest("no versions listed".to_string()));
    }

    let mut versions = entries
        .into_iter()
        .map(|entry| {
            Ok(VersionEntry {
                publish_date: parse_timestamp(&entry.publish_date, "PublishDate")?,
                version: Version::parse(entry.version.trim())?,
                changes: entry.changes.trim().to_string(),
            })
        })
        .collect::<Result<Vec<_>, UpdateError>>()?;

    versions.sort_by(|a, b| b.version.cmp(&a.version));
    if let Some(pair) = versions.windows(2).find(|pair| pair[0].version == pair[1].version) {
        return Err(UpdateError::InvalidManifest(format!(
            "duplicate version {}",
            pair[0].version
        )));
    }

    Ok(versions)
}

fn parse_file(
    entry: FileDoc,
    manifest_url: &Url,
    client: &UpdateClient,
) -> Result<FileDescriptor, UpdateError> {
    let remote_url = manifest_url.join(entry.url.trim()).map_err(|e| {
        UpdateError::InvalidManifest(format!("invalid Url for {}: {}", entry.relative_path, e))
    })?;
    if !matches!(remote_url.scheme(), "http" | "https") {
        return Err(UpdateError::InvalidManifest(format!(
            "unsupported Url scheme for {}: {}",
            entry.relative_path,
            remote_url.scheme()
        )));
    }

    if entry.size > MAX_SIZE {
        return Err(UpdateError::InvalidManifest(format!(
            "Size of {} exceeds {} bytes",
            entry.relative_path, MAX_SIZE
        )));
    }

    let hash = decode_fixed::<DIGEST_LEN>(&entry.hash, "Hash", &entry.relative_path)?;
    let signature = decode_fixed::<SIGNATURE_LENGTH>(
        &entry.signature,
        "Signature",
        &entry.relative_path,
    )?;

    FileDescriptor::from_parts(
        entry.relative_path,
        remote_url,
        entry.size,
        parse_timestamp(&entry.timestamp, "Timestamp")?,
        hash,
        Signature::from_bytes(&signature),
        client.trust(),
    )
}

fn decode_fixed<const N: usize>(value: &str, field: &str, path: &str) -> Result<[u8; N], UpdateError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| UpdateError::InvalidManifest(format!("{} of {} is not base64: {}", field, path, e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        UpdateError::InvalidManifest(format!(
            "{} of {} must be {} bytes, got {}",
            field,
            path,
            N,
            bytes.len()
        ))
    })
}

// XML document shapes

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "Update")]
struct UpdateDoc {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "Versions", default)]
    versions: VersionsDoc,
    #[serde(rename = "Files", default)]
    files: FilesDoc,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VersionsDoc {
    #[serde(rename = "Version", default)]
    entries: Vec<VersionDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionDoc {
    #[serde(rename = "@PublishDate")]
    publish_date: String,
    #[serde(rename = "@Version")]
    version: String,
    #[serde(rename = "$text", default)]
    changes: String,
}

impl From<&VersionEntry> for VersionDoc {
    fn from(entry: &VersionEntry) -> Self {
        Self {
            publish_date: format_timestamp(&entry.publish_date),
            version: entry.version.to_string(),
            changes: entry.changes.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FilesDoc {
    #[serde(rename = "File", default)]
    entries: Vec<FileDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileDoc {
    #[serde(rename = "@RelativePath")]
    relative_path: String,
    #[serde(rename = "@Url")]
    url: String,
    #[serde(rename = "@Size")]
    size: u64,
    #[serde(rename = "@Timestamp")]
    timestamp: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Signature")]
    signature: String,
}

impl From<&FileDescriptor> for FileDoc {
    fn from(file: &FileDescriptor) -> Self {
        Self {
            relative_path: file.relative_path().to_string(),
            url: file.remote_url().to_string(),
            size: file.length(),
            timestamp: format_timestamp(&file.modified()),
            hash: STANDARD.encode(file.hash()),
            signature: STANDARD.encode(file.signature().to_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::testutil;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const MANIFEST_URL: &str = "https://updates.example.com/feed/Ledger.xml";

    fn version(v: &str, day: u32, changes: &str) -> VersionEntry {
        VersionEntry::new(
            Version::parse(v).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, day, 10, 0, 0).unwrap(),
            changes,
        )
    }

    fn sample_files(dir: &Path) -> Vec<FileDescriptor> {
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("bin").join("app"), b"application").unwrap();
        std::fs::write(dir.join("readme.txt"), b"<read me & weep>").unwrap();
        ["bin/app", "readme.txt"]
            .iter()
            .map(|rel| {
                let url = Url::parse(MANIFEST_URL).unwrap().join(&format!("files/{}", rel)).unwrap();
                FileDescriptor::create(dir, rel, url, &testutil::signing_key()).unwrap()
            })
            .collect()
    }

    fn sample_xml(dir: &Path) -> String {
        let versions = vec![
            version("1.0.0", 1, "First release"),
            version("1.2.0", 3, "Faster sync"),
            version("1.1.0", 2, "Bug fixes <&>"),
        ];
        render("Ledger", &versions, &sample_files(dir), None).unwrap()
    }

    fn parse(xml: &str, staging: &Path) -> Result<UpdateManifest, UpdateError> {
        UpdateManifest::parse(xml, &Url::parse(MANIFEST_URL).unwrap(), testutil::client(staging))
    }

    #[test]
    fn test_parse_rendered_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = parse(&sample_xml(dir.path()), dir.path()).unwrap();

        assert_eq!(manifest.product_name(), "Ledger");
        assert_eq!(manifest.new_version(), &Version::new(1, 2, 0));
        assert_eq!(
            manifest.publish_date(),
            Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap()
        );
        assert_eq!(manifest.files().len(), 2);
        assert_eq!(
            manifest.files()[0].remote_url().as_str(),
            "https://updates.example.com/feed/files/bin/app"
        );
        assert!(manifest.files().iter().all(|file| file.matches(dir.path())));
    }

    #[test]
    fn test_versions_sorted_newest_first() {
        let dir = TempDir::new().unwrap();
        let manifest = parse(&sample_xml(dir.path()), dir.path()).unwrap();
        let order: Vec<String> = manifest
            .versions()
            .iter()
            .map(|entry| entry.version().to_string())
            .collect();
        assert_eq!(order, ["1.2.0", "1.1.0", "1.0.0"]);
    }

    #[test]
    fn test_get_changes_strictly_newer() {
        let dir = TempDir::new().unwrap();
        let manifest = parse(&sample_xml(dir.path()), dir.path()).unwrap();

        assert_eq!(
            manifest.get_changes(&Version::new(1, 0, 0)),
            "Faster sync\n\nBug fixes <&>"
        );
        assert_eq!(manifest.get_changes(&Version::new(1, 2, 0)), "");
        assert!(manifest.is_newer_than(&Version::new(1, 1, 9)));
        assert!(!manifest.is_newer_than(&Version::new(1, 2, 0)));
    }

    #[test]
    fn test_relative_urls_resolve_against_manifest() {
        let dir = TempDir::new().unwrap();
        let xml = sample_xml(dir.path()).replace(
            "https://updates.example.com/feed/files/bin/app",
            "files/bin/app",
        );
        let manifest = parse(&xml, dir.path()).unwrap();
        assert_eq!(
            manifest.files()[0].remote_url().as_str(),
            "https://updates.example.com/feed/files/bin/app"
        );
    }

    #[test]
    fn test_one_bad_signature_rejects_everything() {
        let dir = TempDir::new().unwrap();
        let files = sample_files(dir.path());
        let mut doc_files: Vec<FileDoc> = files.iter().map(FileDoc::from).collect();
        let mut hash = *files[1].hash();
        hash[7] ^= 0x01;
        doc_files[1].hash = STANDARD.encode(hash);

        let doc = UpdateDoc {
            name: "Ledger".to_string(),
            versions: VersionsDoc {
                entries: vec![VersionDoc::from(&version("1.0.0", 1, ""))],
            },
            files: FilesDoc { entries: doc_files },
        };
        let xml = to_xml_document(&doc).unwrap();
        assert!(matches!(
            parse(&xml, dir.path()),
            Err(UpdateError::SignatureVerificationFailed(_))
        ));
    }

    #[test]
    fn test_rejects_structural_problems() {
        let dir = TempDir::new().unwrap();
        let files = sample_files(dir.path());

        let no_versions = render("Ledger", &[], &files, None).unwrap();
        assert!(matches!(parse(&no_versions, dir.path()), Err(UpdateError::InvalidManifest(_))));

        let dup_versions = render(
            "Ledger",
            &[version("1.0.0", 1, "a"), version("1.0.0", 2, "b")],
            &files,
            None,
        )
        .unwrap();
        assert!(matches!(parse(&dup_versions, dir.path()), Err(UpdateError::InvalidManifest(_))));

        let dup_files = render(
            "Ledger",
            &[version("1.0.0", 1, "a")],
            &[files[0].clone(), files[0].clone()],
            None,
        )
        .unwrap();
        assert!(matches!(parse(&dup_files, dir.path()), Err(UpdateError::InvalidManifest(_))));

        assert!(matches!(parse("<Update", dir.path()), Err(UpdateError::InvalidManifest(_))));
    }

    #[test]
    fn test_render_relative_urls() {
        let dir = TempDir::new().unwrap();
        let manifest_url = Url::parse(MANIFEST_URL).unwrap();
        let xml = render(
            "Ledger",
            &[version("1.0.0", 1, "")],
            &sample_files(dir.path()),
            Some(&manifest_url),
        )
        .unwrap();

        assert!(xml.contains("Url=\"files/bin/app\""));
        let manifest = parse(&xml, dir.path()).unwrap();
        assert_eq!(
            manifest.files()[1].remote_url().as_str(),
            "https://updates.example.com/feed/files/readme.txt"
        );
    }

    #[test]
    fn test_read_version_history() {
        let dir = TempDir::new().unwrap();
        let history = read_version_history(&sample_xml(dir.path())).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].version(), &Version::new(1, 2, 0));
    }

    #[test]
    fn test_rejects_bad_version_string() {
        let dir = TempDir::new().unwrap();
        let xml = sample_xml(dir.path()).replace("Version=\"1.1.0\"", "Version=\"one\"");
        assert!(matches!(parse(&xml, dir.path()), Err(UpdateError::VersionParseError(_))));
    }

    #[test]
    fn test_rejects_size_beyond_progress_range() {
        let dir = TempDir::new().unwrap();
        // Signatures cover only the hash, so a rewritten Size still verifies
        let xml = sample_xml(dir.path())
            .replace("Size=\"11\"", &format!("Size=\"{}\"", u64::MAX))
            .replace("Size=\"16\"", &format!("Size=\"{}\"", u64::MAX));
        assert!(matches!(parse(&xml, dir.path()), Err(UpdateError::InvalidManifest(_))));
    }

    #[test]
    fn test_rejects_total_size_overflow() {
        let dir = TempDir::new().unwrap();
        let xml = sample_xml(dir.path())
            .replace("Size=\"11\"", &format!("Size=\"{}\"", i64::MAX))
            .replace("Size=\"16\"", "Size=\"1\"");
        match parse(&xml, dir.path()) {
            Err(UpdateError::InvalidManifest(message)) => assert!(message.contains("total")),
            other => panic!("Expected InvalidManifest, got {:?}", other.map(|_| ())),
        }

        let files = sample_files(dir.path());
        assert_eq!(total_length(&files).unwrap(), 27);
        assert_eq!(total_length([]).unwrap(), 0);
    }

    #[test]
    fn test_pending_files_and_total() {
        let dir = TempDir::new().unwrap();
        let manifest = parse(&sample_xml(dir.path()), dir.path()).unwrap();
        assert!(manifest.pending_files(dir.path()).is_empty());

        std::fs::remove_file(dir.path().join("readme.txt")).unwrap();
        let pending = manifest.pending_files(dir.path());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].relative_path(), "readme.txt");
        assert_eq!(manifest.total_pending_bytes(dir.path()).unwrap(), 16);
    }

    #[test]
    fn test_to_xml_reparses() {
        let dir = TempDir::new().unwrap();
        let manifest = parse(&sample_xml(dir.path()), dir.path()).unwrap();
        let again = parse(&manifest.to_xml().unwrap(), dir.path()).unwrap();
        assert_eq!(again.versions(), manifest.versions());
        assert_eq!(again.files().len(), manifest.files().len());
    }

    #[tokio::test]
    async fn test_download_files_requires_install_dir() {
        let dir = TempDir::new().unwrap();
        let manifest = parse(&sample_xml(dir.path()), dir.path()).unwrap();
        let result = manifest
            .download_files(&dir.path().join("missing"), &NoProgress)
            .await;
        assert!(matches!(result, Err(UpdateError::DirectoryNotFound(_))));
    }

    #[tokio::test]
    async fn test_download_files_nothing_pending() {
        let dir = TempDir::new().unwrap();
        let staging_root = TempDir::new().unwrap();
        let manifest = UpdateManifest::parse(
            &sample_xml(dir.path()),
            &Url::parse(MANIFEST_URL).unwrap(),
            testutil::client(staging_root.path()),
        )
        .unwrap();

        let outcome = manifest.download_files(dir.path(), &NoProgress).await.unwrap();
        let staged = outcome.staged_path().unwrap();
        assert!(staged.starts_with(staging_root.path()));
        assert_eq!(std::fs::read_dir(staged).unwrap().count(), 0);
    }
}
