//! Common test infrastructure for patchline-updater integration tests.
//!
//! Builds real releases with the publisher, serves the published directory
//! from a wiremock server, and points a fetcher at it.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{TimeZone, Utc};
use ed25519_dalek::SigningKey;
use filetime::FileTime;
use patchline_updater::{
    CancelToken, Downloader, ManifestFetcher, ProgressCounter, ProgressReporter, Publisher,
    ReleaseSpec, UpdateClient,
};
use semver::Version;
use url::Url;
use walkdir::WalkDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PRODUCT: &str = "Ledger";

pub fn publisher() -> Publisher {
    Publisher::new(SigningKey::from_bytes(&[0x42; 32]), [0x11; 32], [0x22; 12])
}

pub fn release(server: &MockServer, version: &str) -> ReleaseSpec {
    ReleaseSpec {
        product_name: PRODUCT.to_string(),
        version: Version::parse(version).unwrap(),
        publish_date: Utc.with_ymd_and_hms(2024, 9, 1, 8, 30, 0).unwrap(),
        changes: format!("Changes in {}", version),
        base_url: Url::parse(&format!("{}/", server.uri())).unwrap(),
    }
}

/// Fetcher trusting `publisher`, creating staging directories under
/// `staging_root`.
pub fn fetcher(server: &MockServer, publisher: &Publisher, staging_root: &Path) -> ManifestFetcher {
    let client = UpdateClient::new(
        Downloader::new().unwrap(),
        publisher.trust().clone(),
        staging_root.to_path_buf(),
    );
    ManifestFetcher::new(&server.uri(), client).unwrap()
}

/// Write `files` under `root`.
pub fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Give `target` the same modification time as `source`.
pub fn copy_mtime(source: &Path, target: &Path) {
    let mtime = FileTime::from_last_modification_time(&fs::metadata(source).unwrap());
    filetime::set_file_mtime(target, mtime).unwrap();
}

/// Relative paths of every file under `root`, sorted.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    files.sort();
    files
}

/// Serve every file under `dir` at `/{relative path}`.
pub async fn serve_dir(server: &MockServer, dir: &Path) {
    server.reset().await;
    for rel in list_files(dir) {
        let body = fs::read(dir.join(&rel)).unwrap();
        Mock::given(method("GET"))
            .and(path(format!("/{}", rel)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }
}

/// Paths requested from `server` so far, in order.
pub async fn requested_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.url.path().to_string())
        .collect()
}

/// Move every file of `staged` into `install`, keeping modification times.
pub fn promote(staged: &Path, install: &Path) {
    for rel in list_files(staged) {
        let target = install.join(&rel);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        if target.exists() {
            fs::remove_file(&target).unwrap();
        }
        fs::rename(staged.join(&rel), &target).unwrap();
    }
}

pub fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}

pub fn deterministic_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Progress reporter that requests cancellation once progress reaches
/// `threshold`.
pub struct CancelAt {
    inner: ProgressCounter,
    threshold: i64,
    peak: AtomicI64,
}

impl CancelAt {
    pub fn new(threshold: i64) -> Self {
        Self {
            inner: ProgressCounter::with_token(CancelToken::new()),
            threshold,
            peak: AtomicI64::new(0),
        }
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ProgressReporter for CancelAt {
    fn set_caption(&self, caption: &str) {
        self.inner.set_caption(caption);
    }

    fn progress(&self) -> i64 {
        self.inner.progress()
    }

    fn set_progress(&self, value: i64) {
        self.peak.fetch_max(value, Ordering::SeqCst);
        self.inner.set_progress(value);
        if value >= self.threshold {
            self.inner.token().cancel();
        }
    }

    fn maximum(&self) -> i64 {
        self.inner.maximum()
    }

    fn set_maximum(&self, value: i64) {
        self.inner.set_maximum(value);
    }

    fn was_canceled(&self) -> bool {
        self.inner.was_canceled()
    }

    fn can_cancel(&self) -> bool {
        self.inner.can_cancel()
    }

    fn set_can_cancel(&self, value: bool) {
        self.inner.set_can_cancel(value);
    }
}

pub fn staged_dir(outcome: &patchline_updater::SyncOutcome) -> PathBuf {
    outcome
        .staged_path()
        .expect("update should have been staged")
        .to_path_buf()
}
