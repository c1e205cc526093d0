//! Output formatting for CLI results
//!
//! Every command reports through [`OutputFormatter`] in one of three
//! formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for release pipelines
//! - Quiet: Minimal output, exit codes only

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Table};
use patchline_updater::{AvailableUpdate, PublishSummary};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub command: String,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T, command: &str) -> Self {
        Self {
            success: true,
            data,
            timestamp: Utc::now().to_rfc3339(),
            command: command.to_string(),
        }
    }
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Print a rendered block unless it is empty.
    pub fn emit(&self, rendered: &str) {
        if !rendered.is_empty() {
            println!("{rendered}");
        }
    }

    pub fn format_keygen(&self, keygen: &KeygenOutput) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Keys File", &keygen.keys_path.display().to_string()]);
                table.add_row(vec!["Public Key", &keygen.public_key]);
                if let Some(path) = &keygen.trust_path {
                    table.add_row(vec!["Trust Section", &path.display().to_string()]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(keygen, "keygen"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_release(&self, release: &ReleaseOutput, command: &str) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Product", &release.product_name]);
                table.add_row(vec!["Version", &release.version]);
                table.add_row(vec!["Manifest", &release.manifest_path.display().to_string()]);
                table.add_row(vec!["Payloads", &release.payload_count.to_string()]);
                table.add_row(vec!["Total Size", &format_bytes(release.total_bytes)]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(release, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_manifest(&self, manifest: &ManifestOutput) -> String {
        match self.format {
            OutputFormat::Table => self.manifest_table(manifest),
            OutputFormat::Json => self.to_json_response(manifest, "inspect"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_check(&self, check: &CheckOutput) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Product", &check.product_name]);
                table.add_row(vec!["Installed", &check.installed_version]);
                table.add_row(vec!["Available", &check.available_version]);
                table.add_row(vec!["Newer", if check.newer { "yes" } else { "no" }]);
                if let Some(pending) = check.pending_bytes {
                    table.add_row(vec!["Pending", &format_bytes(pending)]);
                }
                if let Some(path) = &check.staged_path {
                    table.add_row(vec!["Staged At", &path.display().to_string()]);
                }
                if !check.changes.is_empty() {
                    table.add_row(vec!["Changes", &check.changes]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(check, "check"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress message, shown in verbose table mode only
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        if self.format == OutputFormat::Table {
            eprintln!("⚠ {message}");
        }
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        serde_json::to_string_pretty(&JsonResponse::success(value, command))
            .unwrap_or_else(|e| format!("{{\"success\": false, \"error\": \"{e}\"}}"))
    }

    fn manifest_table(&self, manifest: &ManifestOutput) -> String {
        let mut summary = property_table();
        summary.add_row(vec!["Product", &manifest.product_name]);
        summary.add_row(vec!["Delivery", &manifest.mode]);
        summary.add_row(vec!["Version", &manifest.new_version]);
        summary.add_row(vec!["Published", &format_time(manifest.publish_date)]);

        let mut versions = Table::new();
        versions.load_preset(UTF8_FULL);
        versions.set_header(vec!["Version", "Published", "Changes"]);
        for version in &manifest.versions {
            versions.add_row(vec![
                &version.version,
                &format_time(version.publish_date),
                &version.changes,
            ]);
        }

        let mut rendered = format!("{summary}\n{versions}");
        if !manifest.files.is_empty() {
            let mut files = Table::new();
            files.load_preset(UTF8_FULL);
            files.set_header(vec!["Path", "Size", "Modified", "SHA-512"]);
            for file in &manifest.files {
                let hash = if self.verbose {
                    file.hash.clone()
                } else {
                    format!("{}…", &file.hash[..16])
                };
                files.add_row(vec![
                    &file.relative_path,
                    &format_bytes(file.size),
                    &format_time(file.modified),
                    &hash,
                ]);
            }
            rendered = format!("{rendered}\n{files}");
        }
        rendered
    }
}

fn property_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    table
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// JSON output structures

#[derive(Debug, Serialize)]
pub struct KeygenOutput {
    pub keys_path: PathBuf,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseOutput {
    pub product_name: String,
    pub version: String,
    pub manifest_path: PathBuf,
    pub payload_count: usize,
    pub total_bytes: u64,
}

impl ReleaseOutput {
    pub fn new(product_name: &str, version: &semver::Version, summary: &PublishSummary) -> Self {
        Self {
            product_name: product_name.to_string(),
            version: version.to_string(),
            manifest_path: summary.manifest_path.clone(),
            payload_count: summary.payload_paths.len(),
            total_bytes: summary.total_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionOutput {
    pub version: String,
    pub publish_date: DateTime<Utc>,
    pub changes: String,
}

#[derive(Debug, Serialize)]
pub struct FileOutput {
    pub relative_path: String,
    pub url: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub hash: String,
}

#[derive(Debug, Serialize)]
pub struct ManifestOutput {
    pub product_name: String,
    pub mode: String,
    pub new_version: String,
    pub publish_date: DateTime<Utc>,
    pub versions: Vec<VersionOutput>,
    pub files: Vec<FileOutput>,
}

impl From<&AvailableUpdate> for ManifestOutput {
    fn from(update: &AvailableUpdate) -> Self {
        let (versions, files) = match update {
            AvailableUpdate::Incremental(manifest) => (
                manifest
                    .versions()
                    .iter()
                    .map(|entry| VersionOutput {
                        version: entry.version().to_string(),
                        publish_date: entry.publish_date(),
                        changes: entry.changes().to_string(),
                    })
                    .collect(),
                manifest
                    .files()
                    .iter()
                    .map(|file| FileOutput {
                        relative_path: file.relative_path().to_string(),
                        url: file.remote_url().to_string(),
                        size: file.length(),
                        modified: file.modified(),
                        hash: to_hex(file.hash()),
                    })
                    .collect(),
            ),
            AvailableUpdate::Bundle(manifest) => (
                vec![VersionOutput {
                    version: manifest.new_version().to_string(),
                    publish_date: manifest.publish_date(),
                    changes: manifest.description().to_string(),
                }],
                Vec::new(),
            ),
        };

        Self {
            product_name: update.product_name().to_string(),
            mode: update.mode().to_string(),
            new_version: update.new_version().to_string(),
            publish_date: update.publish_date(),
            versions,
            files,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckOutput {
    pub product_name: String,
    pub installed_version: String,
    pub available_version: String,
    pub newer: bool,
    pub changes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_path: Option<PathBuf>,
}

impl CheckOutput {
    pub fn new(update: &AvailableUpdate, installed: &semver::Version, install_dir: &Path) -> Self {
        let pending_bytes = match update {
            AvailableUpdate::Incremental(manifest) => manifest.total_pending_bytes(install_dir).ok(),
            AvailableUpdate::Bundle(_) => None,
        };
        Self {
            product_name: update.product_name().to_string(),
            installed_version: installed.to_string(),
            available_version: update.new_version().to_string(),
            newer: update.is_newer_than(installed),
            changes: update.changes(installed),
            pending_bytes,
            staged_path: None,
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
