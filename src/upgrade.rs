//! Self-upgrade from a release feed.
//!
//! The feed is a GitHub-style "latest release" document. The asset named
//! `<prefix>-<os>-<arch>` (optionally `.tar.gz`) replaces the binary at the
//! target path. The old binary is restored if the swap fails.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const USER_AGENT: &str = concat!("toolwire-upgrader/", env!("CARGO_PKG_VERSION"));

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeSettings {
    /// URL of the latest-release JSON document.
    pub releases_url: String,
    /// Asset and binary name prefix.
    #[serde(default = "default_asset_prefix")]
    pub asset_prefix: String,
}

fn default_asset_prefix() -> String {
    "toolwire".to_string()
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("no upgrade source configured (set `upgrade.releases_url`)")]
    NotConfigured,

    #[error("HTTP error talking to {url}: {reason}")]
    Http { url: String, reason: String },

    #[error("failed to decode release info: {reason}")]
    Decode { reason: String },

    #[error("release {tag} has no asset for {platform}")]
    NoAsset { tag: String, platform: String },

    #[error("archive does not contain a '{binary}' binary")]
    MissingBinary { binary: String },

    #[error("I/O error at {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> UpgradeError + '_ {
    move |e| UpgradeError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

// ─── Release Feed ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

impl Release {
    /// The asset for `platform`, raw binary or tarball.
    pub fn asset_for(&self, prefix: &str, platform: &str) -> Option<&ReleaseAsset> {
        let stem = format!("{prefix}-{platform}");
        let tarball = format!("{stem}.tar.gz");
        self.assets
            .iter()
            .find(|a| a.name == stem || a.name == tarball)
    }
}

/// `<os>-<arch>` of the running build, e.g. `linux-x86_64`.
pub fn platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Compare `major.minor.patch`, ignoring a leading `v`.
pub fn version_is_newer(release: &str, current: &str) -> bool {
    let parse = |v: &str| -> (u32, u32, u32) {
        let v = v.trim_start_matches('v');
        let parts: Vec<&str> = v.split('.').collect();
        let major = parts.first().and_then(|s| s.parse().ok()).unwrap_or(0);
        let minor = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        let patch = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
        (major, minor, patch)
    };
    parse(release) > parse(current)
}

// ─── Upgrader ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    UpToDate { version: String },
    Installed { version: String, path: PathBuf },
}

pub struct Upgrader {
    settings: UpgradeSettings,
    http: reqwest::Client,
    target: PathBuf,
    current_version: String,
}

impl Upgrader {
    pub fn new(settings: UpgradeSettings, target: impl Into<PathBuf>) -> Result<Self, UpgradeError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| UpgradeError::Http {
                url: settings.releases_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            settings,
            http,
            target: target.into(),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Upgrade the running executable, following symlinks to the real file.
    pub fn for_current_exe(settings: UpgradeSettings) -> Result<Self, UpgradeError> {
        let exe = std::env::current_exe().map_err(|e| UpgradeError::Io {
            path: PathBuf::from("<current exe>"),
            reason: e.to_string(),
        })?;
        let target = exe.canonicalize().map_err(io_error(&exe))?;
        Self::new(settings, target)
    }

    pub fn with_current_version(mut self, version: &str) -> Self {
        self.current_version = version.to_string();
        self
    }

    pub async fn latest_release(&self) -> Result<Release, UpgradeError> {
        let url = self.settings.releases_url.as_str();
        let http_error = |reason: String| UpgradeError::Http {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .timeout(CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| http_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_error(format!("status {}", status.as_u16())));
        }
        let body = response.text().await.map_err(|e| http_error(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| UpgradeError::Decode {
            reason: e.to_string(),
        })
    }

    /// Install the latest release if it is newer, or unconditionally with `force`.
    pub async fn run(&self, force: bool) -> Result<UpgradeOutcome, UpgradeError> {
        tracing::info!(current = %self.current_version, feed = %self.settings.releases_url, "checking for upgrade");
        let release = self.latest_release().await?;
        if !force && !version_is_newer(&release.tag_name, &self.current_version) {
            tracing::info!(version = %self.current_version, "already up to date");
            return Ok(UpgradeOutcome::UpToDate {
                version: self.current_version.clone(),
            });
        }

        let platform = platform();
        let asset = release
            .asset_for(&self.settings.asset_prefix, &platform)
            .ok_or_else(|| UpgradeError::NoAsset {
                tag: release.tag_name.clone(),
                platform: platform.clone(),
            })?;

        tracing::info!(tag = %release.tag_name, asset = %asset.name, "downloading upgrade");
        let bytes = self.download(&asset.browser_download_url).await?;
        let binary = if asset.name.ends_with(".tar.gz") {
            extract_binary(&bytes, &self.settings.asset_prefix)?
        } else {
            bytes
        };

        install_binary(&self.target, &binary)?;
        tracing::info!(tag = %release.tag_name, path = %self.target.display(), "upgrade installed");
        Ok(UpgradeOutcome::Installed {
            version: release.tag_name.clone(),
            path: self.target.clone(),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, UpgradeError> {
        let http_error = |reason: String| UpgradeError::Http {
            url: url.to_string(),
            reason,
        };
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| http_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_error(format!("status {}", status.as_u16())));
        }
        let bytes = response.bytes().await.map_err(|e| http_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ─── Install ─────────────────────────────────────────────────────────────────

/// Pull the file named `binary` out of a gzipped tarball.
pub fn extract_binary(tarball: &[u8], binary: &str) -> Result<Vec<u8>, UpgradeError> {
    let archive_path = Path::new("<archive>");
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(tarball));
    let entries = archive.entries().map_err(io_error(archive_path))?;

    for entry in entries {
        let mut entry = entry.map_err(io_error(archive_path))?;
        let matches = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n == binary))
            .unwrap_or(false);
        if matches {
            let mut out = Vec::new();
            entry.read_to_end(&mut out).map_err(io_error(archive_path))?;
            return Ok(out);
        }
    }
    Err(UpgradeError::MissingBinary {
        binary: binary.to_string(),
    })
}

/// Replace `target` with `bytes`: stage next to it, move the old file aside,
/// swap, then drop the backup.
pub fn install_binary(target: &Path, bytes: &[u8]) -> Result<(), UpgradeError> {
    let staged = sibling(target, "new");
    let backup = sibling(target, "old");

    std::fs::write(&staged, bytes).map_err(io_error(&staged))?;
    set_executable(&staged)?;

    let had_target = target.exists();
    if had_target {
        std::fs::rename(target, &backup).map_err(io_error(target))?;
    }
    if let Err(e) = std::fs::rename(&staged, target) {
        if had_target {
            let _ = std::fs::rename(&backup, target);
        }
        let _ = std::fs::remove_file(&staged);
        return Err(io_error(target)(e));
    }
    if had_target {
        let _ = std::fs::remove_file(&backup);
    }
    Ok(())
}

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(format!(".{suffix}"));
    PathBuf::from(name)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), UpgradeError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(io_error(path))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), UpgradeError> {
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
