//! Server configuration: TOML file + CLI/env overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wamux_core::{GatewayError, GatewayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub media: MediaSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required `X-API-Key` for `/api` routes. Unset disables the check.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

/// `[webhook]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSection {
    /// Destination for outbound events. Unset drops events silently.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_webhook_timeout(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_database_path")]
    pub database: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

/// `[media]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaSection {
    #[serde(default = "default_media_dir")]
    pub dir: String,
    #[serde(default = "default_media_url_prefix")]
    pub url_prefix: String,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            dir: default_media_dir(),
            url_prefix: default_media_url_prefix(),
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_url")]
    pub url: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
        }
    }
}

/// `[sessions]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_connect_wait")]
    pub connect_wait_secs: u64,
    #[serde(default = "default_qr_wait")]
    pub qr_wait_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            connect_wait_secs: default_connect_wait(),
            qr_wait_secs: default_qr_wait(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_webhook_timeout() -> u64 {
    30
}
fn default_database_path() -> String {
    "~/.wamux/wamux.db".to_string()
}
fn default_media_dir() -> String {
    "~/.wamux/media".to_string()
}
fn default_media_url_prefix() -> String {
    "/media".to_string()
}
fn default_engine_url() -> String {
    "ws://127.0.0.1:4500/engine".to_string()
}
fn default_connect_wait() -> u64 {
    10
}
fn default_qr_wait() -> u64 {
    30
}
fn default_io_timeout() -> u64 {
    60
}

/// Values supplied on the command line or through the environment.
/// `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_api_key: Option<String>,
    pub database: Option<String>,
    pub media_dir: Option<String>,
    pub engine_url: Option<String>,
    pub ephemeral: bool,
}

/// Resolved server configuration (all paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_api_key: Option<String>,
    pub webhook_timeout: Duration,
    pub database_path: PathBuf,
    /// Keep all state in memory instead of SQLite.
    pub ephemeral: bool,
    pub media_dir: PathBuf,
    pub media_url_prefix: String,
    pub engine_url: String,
    pub connect_wait: Duration,
    pub qr_wait: Duration,
    pub io_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> GatewayResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self::resolve(file_config, overrides))
    }

    fn resolve(file: ConfigFile, overrides: &Overrides) -> Self {
        let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());

        let database = overrides
            .database
            .clone()
            .unwrap_or(file.storage.database);
        let media_dir = overrides.media_dir.clone().unwrap_or(file.media.dir);

        Self {
            port: overrides.port.unwrap_or(file.server.port),
            api_key: non_empty(overrides.api_key.clone().or(file.server.api_key)),
            webhook_url: non_empty(overrides.webhook_url.clone().or(file.webhook.url)),
            webhook_api_key: non_empty(
                overrides.webhook_api_key.clone().or(file.webhook.api_key),
            ),
            webhook_timeout: Duration::from_secs(file.webhook.timeout_secs),
            database_path: expand_tilde_str(&database),
            ephemeral: overrides.ephemeral,
            media_dir: expand_tilde_str(&media_dir),
            media_url_prefix: normalize_prefix(&file.media.url_prefix),
            engine_url: overrides.engine_url.clone().unwrap_or(file.engine.url),
            connect_wait: Duration::from_secs(file.sessions.connect_wait_secs),
            qr_wait: Duration::from_secs(file.sessions.qr_wait_secs),
            io_timeout: Duration::from_secs(file.sessions.io_timeout_secs),
        }
    }
}

/// `media/` and `/media/` both become `/media`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    format!("/{trimmed}")
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
