//! Node configuration.
//!
//! Loaded from YAML or JSON (picked by file extension) with `${VAR}` and
//! `${VAR:-default}` environment interpolation applied to the raw text first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use crate::oauth::OAuthConfig;
use crate::upgrade::UpgradeSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default heartbeat interval for the tunnel.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default wait for a `master_tool_call` response.
pub const DEFAULT_MASTER_CALL_TIMEOUT_SECS: u64 = 60;

// ─── Types ───────────────────────────────────────────────────────────────────

/// How a configured backend is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

/// One configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, alias = "type")]
    pub transport: TransportKind,

    // stdio
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    // http
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,

    /// Per-request timeout. Falls back to the transport default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// A stdio backend running `command`.
    pub fn stdio(command: &str) -> Self {
        Self {
            enabled: true,
            transport: TransportKind::Stdio,
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            oauth: None,
            timeout_secs: None,
        }
    }

    /// An HTTP backend at `url`.
    pub fn http(url: &str) -> Self {
        Self {
            transport: TransportKind::Http,
            url: Some(url.to_string()),
            ..Self::stdio("")
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Check that the fields required by the transport kind are present.
    pub fn validate(&self, name: &str) -> Result<(), McpError> {
        match self.transport {
            TransportKind::Stdio if self.command.trim().is_empty() => Err(McpError::ConfigError {
                reason: format!("server '{name}': stdio transport requires a command"),
            }),
            TransportKind::Http if self.url.as_deref().map_or(true, str::is_empty) => {
                Err(McpError::ConfigError {
                    reason: format!("server '{name}': http transport requires a url"),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Where and how the slave reaches its master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// `host:port` of the master.
    pub master_addr: String,
    /// Name announced in `register`. Defaults to the machine hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
    #[serde(default)]
    pub master_call_timeout_secs: Option<u64>,
}

impl TunnelSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS))
    }

    pub fn master_call_timeout(&self) -> Duration {
        Duration::from_secs(
            self.master_call_timeout_secs
                .unwrap_or(DEFAULT_MASTER_CALL_TIMEOUT_SECS),
        )
    }
}

/// Top-level configuration for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub tunnel: Option<TunnelSettings>,
    /// Defaults to `~/.toolwire/oauth-tokens`.
    #[serde(default)]
    pub token_dir: Option<PathBuf>,
    /// Release feed used by `toolwire upgrade`.
    #[serde(default)]
    pub upgrade: Option<UpgradeSettings>,
}

impl NodeConfig {
    /// Enabled servers, sorted by name.
    pub fn enabled_servers(&self) -> Vec<(&str, &ServerConfig)> {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(n, c)| (n.as_str(), c))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        servers
    }
}

fn default_true() -> bool {
    true
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load a node config from disk.
///
/// `.json` files are parsed as JSON, everything else as YAML. Paths in the
/// result have a leading `~` expanded.
pub fn load_node_config(path: &Path) -> Result<NodeConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let mut config = parse_node_config(&raw, is_json)?;
    expand_paths(&mut config);

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        tunnel = config.tunnel.is_some(),
        "loaded node config"
    );
    Ok(config)
}

fn parse_node_config(raw: &str, is_json: bool) -> Result<NodeConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    let parsed = if is_json {
        serde_json::from_str(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    };
    parsed.map_err(|reason| McpError::ConfigError {
        reason: format!("failed to parse config: {reason}"),
    })
}

fn expand_paths(config: &mut NodeConfig) {
    let expand = |p: &PathBuf| PathBuf::from(expand_tilde(&p.to_string_lossy()));

    for server in config.servers.values_mut() {
        if let Some(cwd) = &server.cwd {
            server.cwd = Some(expand(cwd));
        }
    }
    if let Some(tunnel) = &mut config.tunnel {
        tunnel.cert_path = expand(&tunnel.cert_path);
        tunnel.key_path = expand(&tunnel.key_path);
        tunnel.ca_path = expand(&tunnel.ca_path);
    }
    if let Some(dir) = &config.token_dir {
        config.token_dir = Some(expand(dir));
    }
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
