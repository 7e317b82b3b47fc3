pub mod mcp_client;
pub mod oauth;
pub mod tunnel;
pub mod upgrade;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mcp_client::{load_node_config, McpClient, NodeConfig, ToolRegistry, TransportClient};
use oauth::TokenStore;
use tunnel::{ProcessExitHook, TlsDialer, TunnelClient, TunnelOptions};
use upgrade::{UpgradeError, UpgradeOutcome, Upgrader};

/// Return the platform-standard data directory for toolwire.
///
/// - macOS: `~/Library/Application Support/toolwire/`
/// - Linux: `$XDG_DATA_HOME/toolwire/` (fallback `~/.local/share/toolwire/`)
///
/// Falls back to `~/.toolwire/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolwire");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolwire")
}

// ─── Logging ─────────────────────────────────────────────────────────────────

/// Install the tracing subscriber, writing to `<log_dir>/toolwire.log`.
///
/// Previous logs are rotated first (`toolwire.log` → `.1` → `.2` → `.3`).
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("toolwire.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolwire=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolwire starting ==="
    );
    Ok(())
}

/// Rotate log files: `base` → `base.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write so log lines survive a
/// crash or `process::exit`.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "toolwire", version, about = "Tool-calling node: local MCP servers plus an optional master tunnel")]
pub struct Cli {
    /// Node configuration file (YAML, or JSON with a `.json` extension).
    #[arg(long, short, global = true, env = "TOOLWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start every enabled server and the master tunnel, run until Ctrl-C.
    ///
    /// SIGHUP reloads the server list from the configuration file.
    Serve,
    /// Start every enabled server once and print its status as JSON.
    Status,
    /// Run the OAuth device flow for one HTTP server.
    Auth {
        /// Server name from the configuration.
        server: String,
    },
    /// Print stored OAuth token statuses as JSON.
    Tokens,
    /// Delete the stored OAuth token for one server.
    Logout { server: String },
    /// Replace this binary with the latest published release.
    Upgrade {
        /// Reinstall even if the latest release is not newer.
        #[arg(long, short)]
        force: bool,
    },
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| data_dir().join("node.yaml"))
    }
}

/// Parse arguments, install logging and run the selected command.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&data_dir())?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let path = cli.config_path();
    let config = load_node_config(&path)
        .with_context(|| format!("failed to load node config {}", path.display()))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&path, config).await,
        Command::Status => {
            let tokens = open_token_store(&config)?;
            status(config, tokens).await
        }
        Command::Auth { server } => {
            let tokens = open_token_store(&config)?;
            authenticate(&config, &tokens, &server).await
        }
        Command::Tokens => {
            let tokens = open_token_store(&config)?;
            let mut statuses = serde_json::Map::new();
            for (name, status) in tokens.token_statuses() {
                statuses.insert(name, serde_json::to_value(status)?);
            }
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(())
        }
        Command::Logout { server } => {
            open_token_store(&config)?.delete_token(&server)?;
            println!("removed token for {server}");
            Ok(())
        }
        Command::Upgrade { force } => {
            let settings = config.upgrade.clone().ok_or(UpgradeError::NotConfigured)?;
            match Upgrader::for_current_exe(settings)?.run(force).await? {
                UpgradeOutcome::UpToDate { version } => println!("already up to date ({version})"),
                UpgradeOutcome::Installed { version, path } => {
                    println!("installed {version} at {}", path.display())
                }
            }
            Ok(())
        }
    }
}

fn open_token_store(config: &NodeConfig) -> anyhow::Result<Arc<TokenStore>> {
    let dir = config
        .token_dir
        .clone()
        .unwrap_or_else(TokenStore::default_dir);
    Ok(Arc::new(TokenStore::open(dir)?))
}

fn build_pool(config: &NodeConfig, tokens: Arc<TokenStore>) -> (McpClient, Arc<ToolRegistry>) {
    let registry = Arc::new(ToolRegistry::new());
    let pool = McpClient::new(config.servers.clone(), registry.clone()).with_token_store(tokens);
    (pool, registry)
}

async fn start_pool(pool: &McpClient) {
    let failures = pool.start_all().await;
    for (name, err) in &failures {
        // Non-fatal: one broken server must not take the node down.
        tracing::error!(server = %name, error = %err, "server failed to start");
    }
    tracing::info!(
        running = pool.running_server_count().await,
        failed = failures.len(),
        "local servers started"
    );
}

async fn serve(path: &Path, config: NodeConfig) -> anyhow::Result<()> {
    let tokens = open_token_store(&config)?;
    let (pool, registry) = build_pool(&config, tokens);
    start_pool(&pool).await;

    let tunnel = match &config.tunnel {
        Some(settings) => {
            let dialer = TlsDialer::from_settings(settings)?;
            tracing::info!(url = %dialer.url(), "tunnel configured");
            let tunnel = TunnelClient::new(
                TunnelOptions::from_settings(settings),
                Arc::new(dialer),
                registry.clone(),
                Arc::new(ProcessExitHook::for_current_exe().with_config(path)),
            );
            tunnel.set_registry(registry.clone());
            tunnel.forward_catalog_changes(pool.catalog_changes());
            tunnel.start().await;
            Some(tunnel)
        }
        None => None,
    };

    wait_for_shutdown(path, &pool).await?;
    tracing::info!("shutting down");

    if let Some(tunnel) = &tunnel {
        if let Err(e) = tunnel.close().await {
            tracing::warn!(error = %e, "tunnel close failed");
        }
    }
    pool.shutdown_all().await;
    Ok(())
}

/// Block until Ctrl-C, reloading the server list on every SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(path: &Path, pool: &McpClient) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("failed to listen for Ctrl-C");
            }
            _ = hangup.recv() => reload(path, pool).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_path: &Path, _pool: &McpClient) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}

/// A config that fails to load leaves the running servers untouched.
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(path: &Path, pool: &McpClient) {
    tracing::info!(path = %path.display(), "reloading configuration");
    match load_node_config(path) {
        Ok(config) => {
            for (name, err) in pool.reload(config.servers).await {
                tracing::error!(server = %name, error = %err, "server failed to start after reload");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to reload configuration, keeping current"),
    }
}

async fn status(config: NodeConfig, tokens: Arc<TokenStore>) -> anyhow::Result<()> {
    let (pool, _registry) = build_pool(&config, tokens);
    start_pool(&pool).await;
    let statuses = pool.server_status().await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    pool.shutdown_all().await;
    Ok(())
}

async fn authenticate(config: &NodeConfig, tokens: &TokenStore, server: &str) -> anyhow::Result<()> {
    let provider = config
        .servers
        .get(server)
        .and_then(|s| s.oauth.as_ref())
        .and_then(|o| o.provider_config())
        .with_context(|| format!("server '{server}' has no usable oauth configuration"))?;

    let device = tokens.start_device_flow(&provider).await?;
    println!(
        "Open {} and enter code {}",
        device
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&device.verification_uri),
        device.user_code
    );

    let token = tokens.poll_for_token(server, &provider, &device).await?;
    match token.expires_at {
        Some(at) => println!("authenticated {server}; token expires {at}"),
        None => println!("authenticated {server}"),
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
