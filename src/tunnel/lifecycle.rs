//! Restart and upgrade commands from the master.
//!
//! Both end the process so an external supervisor (systemd, launchd) can
//! start it again. Upgrade first runs `<binary> [--config <path>] upgrade`
//! to replace the binary in place.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// Administrative command carried by `restart` / `upgrade` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Restart,
    Upgrade,
}

impl AdminCommand {
    /// Delay before acting, so in-flight writes can drain.
    pub fn grace(self) -> Duration {
        match self {
            Self::Restart => Duration::from_secs(1),
            Self::Upgrade => Duration::from_millis(500),
        }
    }
}

/// Runs after the grace delay, once the tunnel connection is closed.
#[async_trait]
pub trait LifecycleHook: Send + Sync + 'static {
    async fn on_command(&self, command: AdminCommand);
}

/// Default hook: optionally upgrade, then exit with status 0.
pub struct ProcessExitHook {
    binary: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessExitHook {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config: None,
        }
    }

    /// Hand the node's config file to the upgrade run, which reads its
    /// release feed from there.
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// Arguments passed to the binary for an upgrade.
    pub fn upgrade_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push(OsString::from("--config"));
            args.push(config.clone().into_os_string());
        }
        args.push(OsString::from("upgrade"));
        args
    }

    /// Use the running executable for upgrades.
    pub fn for_current_exe() -> Self {
        let binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("toolwire"));
        Self::new(binary)
    }

    async fn run_upgrade(&self) {
        tracing::info!(binary = %self.binary.display(), "starting upgrade");
        match tokio::process::Command::new(&self.binary)
            .args(self.upgrade_args())
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                tracing::info!(
                    output = %String::from_utf8_lossy(&output.stdout).trim(),
                    "upgrade completed"
                );
            }
            Ok(output) => {
                tracing::error!(
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "upgrade failed"
                );
            }
            Err(e) => tracing::error!(error = %e, "failed to run upgrade"),
        }
    }
}

#[async_trait]
impl LifecycleHook for ProcessExitHook {
    async fn on_command(&self, command: AdminCommand) {
        if command == AdminCommand::Upgrade {
            self.run_upgrade().await;
        }
        tracing::info!(?command, "exiting for supervisor restart");
        std::process::exit(0);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
