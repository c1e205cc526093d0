//! CLI command definitions and argument parsing

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use patchline_updater::{
    AvailableUpdate, BundleManifest, DeliveryMode, Downloader, ManifestFetcher, ProgressCounter,
    ProgressReporter, Publisher, PublisherKeys, ReleaseSpec, SyncOutcome, TrustConfig,
    TrustContext, UpdateClient, UpdateError, UpdateManifest, UpdaterConfig,
};
use semver::Version;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::output::{
    CheckOutput, KeygenOutput, ManifestOutput, OutputFormat, OutputFormatter, ReleaseOutput,
};
use crate::ExitCode;

/// patchline-publish - publish and inspect update feeds
#[derive(Parser, Debug)]
#[command(name = "patchline-publish")]
#[command(version, about = "Publish and inspect patchline update feeds")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose);
        match self.command {
            Commands::Keygen(args) => args.execute(&formatter),
            Commands::Release(args) => args.execute(&formatter, DeliveryMode::Incremental),
            Commands::Bundle(args) => args.execute(&formatter, DeliveryMode::Bundle),
            Commands::Inspect(args) => args.execute(&formatter).await,
            Commands::Check(args) => args.execute(&formatter).await,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate publisher keys and the matching client trust section
    Keygen(KeygenArgs),
    /// Publish an incremental release (one payload per file)
    Release(ReleaseArgs),
    /// Publish a whole-tree encrypted bundle
    Bundle(ReleaseArgs),
    /// Verify and display a published manifest
    Inspect(InspectArgs),
    /// Check a feed for an update and optionally stage it
    Check(CheckArgs),
}

/// Arguments for the keygen command
#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the publisher keys
    #[arg(long, default_value = "publisher-keys.toml")]
    pub out: PathBuf,

    /// Also write the client `[trust]` section to this file
    #[arg(long)]
    pub trust_out: Option<PathBuf>,

    /// Overwrite existing files
    #[arg(long)]
    pub force: bool,
}

/// `[trust]` section as it appears in a client's updater config.
#[derive(Serialize)]
struct TrustSection {
    trust: TrustConfig,
}

impl KeygenArgs {
    pub fn execute(self, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        refuse_overwrite(&self.out, self.force)?;
        if let Some(path) = &self.trust_out {
            refuse_overwrite(path, self.force)?;
        }

        let keys = Publisher::generate_keys();
        keys.save_to_file(&self.out)
            .with_context(|| format!("writing {}", self.out.display()))?;
        let trust = keys.trust_config()?;
        info!(path = %self.out.display(), "Publisher keys written");

        if let Some(path) = &self.trust_out {
            let section = toml::to_string_pretty(&TrustSection {
                trust: trust.clone(),
            })?;
            fs::write(path, section).with_context(|| format!("writing {}", path.display()))?;
        }

        formatter.emit(&formatter.format_keygen(&KeygenOutput {
            keys_path: self.out,
            public_key: trust.public_key,
            trust_path: self.trust_out,
        }));
        Ok(ExitCode::Success)
    }
}

fn refuse_overwrite(path: &Path, force: bool) -> Result<(), UpdateError> {
    if path.exists() && !force {
        return Err(UpdateError::InvalidOperation(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    Ok(())
}

/// Arguments shared by the release and bundle commands
#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Publisher keys file
    #[arg(long, env = "PATCHLINE_KEYS")]
    pub keys: PathBuf,

    /// Product name; the manifest is written as `{product}.xml`
    #[arg(long)]
    pub product: String,

    /// Version being released
    #[arg(long = "release-version", value_parser = parse_version)]
    pub version: Version,

    /// URL the output directory will be served from
    #[arg(long)]
    pub base_url: Url,

    /// Directory holding the files to release
    #[arg(long)]
    pub source: PathBuf,

    /// Directory the feed is written to
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Changelog text for this version
    #[arg(long, conflicts_with = "changes_file")]
    pub changes: Option<String>,

    /// Read the changelog text from a file
    #[arg(long)]
    pub changes_file: Option<PathBuf>,

    /// Publish date (RFC 3339), defaults to now
    #[arg(long, value_parser = parse_date)]
    pub date: Option<DateTime<Utc>>,
}

impl ReleaseArgs {
    pub fn execute(self, formatter: &OutputFormatter, mode: DeliveryMode) -> anyhow::Result<ExitCode> {
        let keys = PublisherKeys::load_from_file(&self.keys)
            .with_context(|| format!("loading keys from {}", self.keys.display()))?;
        let publisher = Publisher::from_keys(&keys)?;
        let release = self.release_spec()?;

        formatter.progress(&format!(
            "Publishing {} {} from {}",
            release.product_name,
            release.version,
            self.source.display()
        ));
        let summary = match mode {
            DeliveryMode::Incremental => {
                publisher.publish_incremental(&release, &self.source, &self.output_dir)?
            }
            DeliveryMode::Bundle => publisher.publish_bundle(&release, &self.source, &self.output_dir)?,
        };

        let command = match mode {
            DeliveryMode::Incremental => "release",
            DeliveryMode::Bundle => "bundle",
        };
        formatter.emit(&formatter.format_release(
            &ReleaseOutput::new(&release.product_name, &release.version, &summary),
            command,
        ));
        Ok(ExitCode::Success)
    }

    pub fn release_spec(&self) -> anyhow::Result<ReleaseSpec> {
        let changes = match (&self.changes, &self.changes_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?
                .trim_end()
                .to_string(),
            (None, None) => String::new(),
        };

        Ok(ReleaseSpec {
            product_name: self.product.clone(),
            version: self.version.clone(),
            publish_date: self.date.unwrap_or_else(Utc::now),
            changes,
            base_url: self.base_url.clone(),
        })
    }
}

/// Arguments for the inspect command
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Manifest file path or http(s) URL
    pub manifest: String,

    /// Verify with the trust derived from these publisher keys
    #[arg(long, conflicts_with = "config", required_unless_present = "config")]
    pub keys: Option<PathBuf>,

    /// Verify with the trust section of this updater config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// URL the manifest is served from, used to resolve relative file URLs
    /// of a local manifest
    #[arg(long)]
    pub url: Option<Url>,

    /// Treat the manifest as a legacy bundle manifest
    #[arg(long)]
    pub bundle: bool,
}

impl InspectArgs {
    pub async fn execute(self, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        let client = self.client()?;
        let (xml, manifest_url) = self.load(&client).await?;
        debug!(url = %manifest_url, "Inspecting manifest");

        let update = if self.bundle {
            let payload_url = sibling_url(&manifest_url, "bundle")?;
            AvailableUpdate::Bundle(BundleManifest::parse(&xml, payload_url, client)?)
        } else {
            AvailableUpdate::Incremental(UpdateManifest::parse(&xml, &manifest_url, client)?)
        };

        formatter.success("Manifest verified");
        formatter.emit(&formatter.format_manifest(&ManifestOutput::from(&update)));
        Ok(ExitCode::Success)
    }

    fn client(&self) -> anyhow::Result<UpdateClient> {
        let trust = match (&self.keys, &self.config) {
            (Some(path), _) => {
                let keys = PublisherKeys::load_from_file(path)
                    .with_context(|| format!("loading keys from {}", path.display()))?;
                TrustContext::from_config(&keys.trust_config()?)?
            }
            (None, Some(path)) => {
                let config = load_config(path)?;
                TrustContext::from_config(&config.trust)?
            }
            (None, None) => {
                return Err(UpdateError::ConfigError("pass --keys or --config".to_string()).into())
            }
        };
        Ok(UpdateClient::new(Downloader::new()?, trust, std::env::temp_dir()))
    }

    async fn load(&self, client: &UpdateClient) -> anyhow::Result<(String, Url)> {
        if let Ok(url) = Url::parse(&self.manifest) {
            if matches!(url.scheme(), "http" | "https") {
                let xml = client.downloader().fetch_text(&url).await?;
                return Ok((xml, url));
            }
        }

        let path = PathBuf::from(&self.manifest);
        let xml = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let url = match (&self.url, &self.config) {
            (Some(url), _) => url.clone(),
            (None, Some(config)) => {
                let config = load_config(config)?;
                let product = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(&config.product_name);
                ManifestFetcher::new(&config.base_uri, client.clone())?.manifest_url(product)?
            }
            (None, None) => {
                return Err(UpdateError::ConfigError(
                    "pass --url to resolve a local manifest".to_string(),
                )
                .into())
            }
        };
        Ok((xml, url))
    }
}

/// `{dir}/{stem}.{extension}` next to `url`.
fn sibling_url(url: &Url, extension: &str) -> anyhow::Result<Url> {
    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    if stem.is_empty() {
        return Err(UpdateError::ConfigError(format!("no file name in {}", url)).into());
    }
    Ok(url.join(&format!("{stem}.{extension}"))?)
}

/// Arguments for the check command
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Updater config file
    #[arg(long, env = "PATCHLINE_CONFIG")]
    pub config: PathBuf,

    /// Installed application directory
    #[arg(long)]
    pub install_dir: PathBuf,

    /// Currently installed version
    #[arg(long, value_parser = parse_version)]
    pub installed: Version,

    /// Download and stage the update if one is available
    #[arg(long)]
    pub apply: bool,
}

impl CheckArgs {
    pub async fn execute(self, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        let config = load_config(&self.config)?;
        let fetcher = ManifestFetcher::from_config(&config)?;

        let update = match config.mode {
            DeliveryMode::Incremental => {
                AvailableUpdate::Incremental(fetcher.try_find_update(&config.product_name).await?)
            }
            DeliveryMode::Bundle => {
                AvailableUpdate::Bundle(fetcher.try_find_bundle_update(&config.product_name).await?)
            }
        };

        let mut report = CheckOutput::new(&update, &self.installed, &self.install_dir);
        if !report.newer {
            formatter.success(&format!("{} is up to date", config.product_name));
            formatter.emit(&formatter.format_check(&report));
            return Ok(ExitCode::Success);
        }
        if !self.apply {
            formatter.emit(&formatter.format_check(&report));
            return Ok(ExitCode::Success);
        }

        let progress = ProgressCounter::new();
        let token = progress.token().clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });

        formatter.progress(&format!("Downloading {} {}", config.product_name, update.new_version()));
        let outcome = update.apply(&self.install_dir, &progress).await;
        interrupt.abort();

        match outcome? {
            SyncOutcome::Staged(path) => {
                formatter.success(&format!(
                    "Staged {} of {} bytes",
                    progress.progress(),
                    progress.maximum()
                ));
                report.staged_path = Some(path);
                formatter.emit(&formatter.format_check(&report));
                Ok(ExitCode::Success)
            }
            SyncOutcome::Cancelled => {
                formatter.warning("Download cancelled");
                Ok(ExitCode::Cancelled)
            }
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<UpdaterConfig> {
    UpdaterConfig::load_from_file(path).with_context(|| format!("loading config from {}", path.display()))
}

fn parse_version(s: &str) -> Result<Version, String> {
    Version::parse(s).map_err(|e| format!("invalid version {s:?}: {e}"))
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 date {s:?}: {e}"))
}
