//! On-disk OAuth token store.
//!
//! One JSON file per backend name under the token directory. Every token is
//! loaded when the store is opened; later writes go through to disk
//! immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use super::errors::OAuthError;
use super::types::{OAuthToken, TokenStatus};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Floor for the device-flow polling interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How much a `slow_down` answer adds to the polling interval.
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Timeout for each request to the provider.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Poll Settings ───────────────────────────────────────────────────────────

/// Pacing for [`TokenStore::poll_for_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub min_interval: Duration,
    pub slow_down_step: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            min_interval: MIN_POLL_INTERVAL,
            slow_down_step: SLOW_DOWN_STEP,
        }
    }
}

// ─── TokenStore ──────────────────────────────────────────────────────────────

/// OAuth tokens keyed by backend name.
pub struct TokenStore {
    dir: PathBuf,
    tokens: RwLock<HashMap<String, OAuthToken>>,
    pub(super) http: reqwest::Client,
    pub(super) poll: PollSettings,
}

impl TokenStore {
    /// Default location: `~/.toolwire/oauth-tokens`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".toolwire")
            .join("oauth-tokens")
    }

    /// Open (creating if needed) the token directory and load every token in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OAuthError> {
        let dir = dir.into();
        create_private_dir(&dir)?;

        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| OAuthError::Http {
                endpoint: "client".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let store = Self {
            tokens: RwLock::new(load_all(&dir)?),
            dir,
            http,
            poll: PollSettings::default(),
        };

        tracing::info!(
            dir = %store.dir.display(),
            tokens = store.tokens.read().len(),
            "loaded OAuth tokens"
        );
        Ok(store)
    }

    /// Override device-flow pacing.
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The stored token for `name`, unless it is expired or about to be.
    pub fn get_token(&self, name: &str) -> Option<OAuthToken> {
        let tokens = self.tokens.read();
        let token = tokens.get(name)?;
        if token.is_expired() {
            tracing::debug!(server = name, "stored OAuth token is expired");
            return None;
        }
        Some(token.clone())
    }

    pub fn has_valid_token(&self, name: &str) -> bool {
        self.get_token(name).is_some()
    }

    /// Store and persist a token for `name`.
    pub fn set_token(&self, name: &str, token: OAuthToken) -> Result<(), OAuthError> {
        let path = self.token_path(name)?;
        let json = serde_json::to_vec_pretty(&token).map_err(|e| OAuthError::Decode {
            what: "token".into(),
            reason: e.to_string(),
        })?;
        write_private_file(&path, &json)?;

        self.tokens.write().insert(name.to_string(), token);
        tracing::info!(server = name, "saved OAuth token");
        Ok(())
    }

    /// Remove a token from memory and disk. Missing tokens are not an error.
    pub fn delete_token(&self, name: &str) -> Result<(), OAuthError> {
        self.tokens.write().remove(name);
        let path = self.token_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    pub fn token_status(&self, name: &str) -> TokenStatus {
        match self.tokens.read().get(name) {
            Some(token) => TokenStatus::for_token(token, Utc::now()),
            None => TokenStatus::not_authenticated(),
        }
    }

    /// Status of every stored token, sorted by name.
    pub fn token_statuses(&self) -> Vec<(String, TokenStatus)> {
        let now = Utc::now();
        let mut statuses: Vec<_> = self
            .tokens
            .read()
            .iter()
            .map(|(name, token)| (name.clone(), TokenStatus::for_token(token, now)))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    fn token_path(&self, name: &str) -> Result<PathBuf, OAuthError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(OAuthError::NotConfigured {
                reason: format!("invalid server name for token file: '{name}'"),
            });
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

// ─── Filesystem ──────────────────────────────────────────────────────────────

fn io_error(path: &Path, e: std::io::Error) -> OAuthError {
    OAuthError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn create_private_dir(dir: &Path) -> Result<(), OAuthError> {
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| io_error(dir, e))?;
    }
    Ok(())
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), OAuthError> {
    std::fs::write(path, contents).map_err(|e| io_error(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io_error(path, e))?;
    }
    Ok(())
}

fn load_all(dir: &Path) -> Result<HashMap<String, OAuthToken>, OAuthError> {
    let mut tokens = HashMap::new();
    let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let parsed = std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_slice::<OAuthToken>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(token) => {
                tokens.insert(name.to_string(), token);
            }
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "skipping unreadable token file");
            }
        }
    }

    Ok(tokens)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
