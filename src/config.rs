//! Daemon configuration: defaults, optional TOML file, environment
//! overrides, CLI flags on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agents::LaunchMode;
use crate::core::Scope;

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// TCP address the stream protocol listens on.
    pub listen_addr: SocketAddr,

    /// HTTP address the telemetry ingest listens on. Port 0 binds an
    /// ephemeral port (embedded mode, tests).
    pub telemetry_addr: SocketAddr,

    /// SQLite store path.
    pub db_path: PathBuf,

    /// Directory for per-session notify files.
    pub notify_dir: PathBuf,

    /// Shared auth token. Connections are unauthenticated when unset
    /// (loopback development default).
    pub auth_token: Option<String>,

    /// Whether verbose codex SSE deltas reach the fan-out.
    pub verbose_telemetry: bool,

    /// Default launch mode for new sessions.
    pub launch_mode: LaunchMode,

    /// Tenant/user/workspace scope from the harness environment.
    pub scope: Scope,

    /// Outbound lifecycle webhook URLs.
    pub webhook_urls: Vec<String>,

    /// Optional categorical ping endpoint.
    pub peon_ping_url: Option<String>,

    /// Optional thread-title naming endpoint.
    pub title_provider_url: Option<String>,

    /// Per-connector delivery timeout in milliseconds.
    pub connector_timeout_ms: u64,
}

/// On-disk TOML shape; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    listen_addr: Option<SocketAddr>,
    telemetry_addr: Option<SocketAddr>,
    db_path: Option<PathBuf>,
    notify_dir: Option<PathBuf>,
    auth_token: Option<String>,
    verbose_telemetry: Option<bool>,
    launch_mode: Option<String>,
    webhook_urls: Option<Vec<String>>,
    peon_ping_url: Option<String>,
    title_provider_url: Option<String>,
    connector_timeout_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let base = base_dir();
        Self {
            listen_addr: "127.0.0.1:7433".parse().unwrap_or_else(|_| unreachable!()),
            telemetry_addr: "127.0.0.1:4318".parse().unwrap_or_else(|_| unreachable!()),
            db_path: base.join("state.sqlite3"),
            notify_dir: base.join("notify"),
            auth_token: None,
            verbose_telemetry: false,
            launch_mode: LaunchMode::Standard,
            scope: Scope::default(),
            webhook_urls: Vec::new(),
            peon_ping_url: None,
            title_provider_url: None,
            connector_timeout_ms: 5_000,
        }
    }
}

impl DaemonConfig {
    /// Resolve configuration: defaults, then the TOML file (explicit path
    /// or the default location), then environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when an explicit config file is unreadable or any
    /// value fails to parse.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.scope = Scope::from_env();

        let file = match config_path {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("cannot read config file {}: {e}", path.display())
            })?),
            None => {
                let default_path = default_config_path();
                std::fs::read_to_string(default_path).ok()
            }
        };
        if let Some(contents) = file {
            let parsed: ConfigFile = toml::from_str(&contents)?;
            config.apply_file(parsed)?;
        }

        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) -> anyhow::Result<()> {
        if let Some(addr) = file.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(addr) = file.telemetry_addr {
            self.telemetry_addr = addr;
        }
        if let Some(path) = file.db_path {
            self.db_path = path;
        }
        if let Some(path) = file.notify_dir {
            self.notify_dir = path;
        }
        if let Some(token) = file.auth_token {
            self.auth_token = Some(token);
        }
        if let Some(verbose) = file.verbose_telemetry {
            self.verbose_telemetry = verbose;
        }
        if let Some(mode) = file.launch_mode {
            self.launch_mode = mode.parse()?;
        }
        if let Some(urls) = file.webhook_urls {
            self.webhook_urls = urls;
        }
        if let Some(url) = file.peon_ping_url {
            self.peon_ping_url = Some(url);
        }
        if let Some(url) = file.title_provider_url {
            self.title_provider_url = Some(url);
        }
        if let Some(timeout) = file.connector_timeout_ms {
            self.connector_timeout_ms = timeout;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(addr) = std::env::var("SWITCHBOARD_LISTEN_ADDR") {
            self.listen_addr = addr.parse()?;
        }
        if let Ok(addr) = std::env::var("SWITCHBOARD_TELEMETRY_ADDR") {
            self.telemetry_addr = addr.parse()?;
        }
        if let Ok(path) = std::env::var("SWITCHBOARD_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(token) = std::env::var("SWITCHBOARD_AUTH_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        if let Ok(verbose) = std::env::var("SWITCHBOARD_VERBOSE_TELEMETRY") {
            self.verbose_telemetry = verbose == "1" || verbose.eq_ignore_ascii_case("true");
        }
        if let Ok(mode) = std::env::var("SWITCHBOARD_LAUNCH_MODE") {
            self.launch_mode = mode.parse()?;
        }
        Ok(())
    }
}

/// Base data directory: `~/.switchboard`.
#[must_use]
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

/// Default config file path, honoring `XDG_CONFIG_HOME`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    let config_root = std::env::var("XDG_CONFIG_HOME").map_or_else(
        |_| dirs::config_dir().unwrap_or_else(|| base_dir()),
        PathBuf::from,
    );
    config_root.join("switchboard").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr.port(), 7433);
        assert_eq!(config.telemetry_addr.port(), 4318);
        assert!(config.auth_token.is_none());
        assert!(!config.verbose_telemetry);
    }

    #[test]
    fn test_file_overlay() {
        let mut config = DaemonConfig::default();
        let file: ConfigFile = toml::from_str(
            r#"
            listen-addr = "127.0.0.1:9000"
            verbose-telemetry = true
            launch-mode = "yolo"
            webhook-urls = ["http://localhost:9999/hook"]
            "#,
        )
        .unwrap();
        config.apply_file(file).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert!(config.verbose_telemetry);
        assert_eq!(config.launch_mode, LaunchMode::Yolo);
        assert_eq!(config.webhook_urls.len(), 1);
    }

    #[test]
    fn test_bad_launch_mode_rejected() {
        let mut config = DaemonConfig::default();
        let file: ConfigFile = toml::from_str("launch-mode = \"chaotic\"").unwrap();
        assert!(config.apply_file(file).is_err());
    }
}
