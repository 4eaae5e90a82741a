use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::proxy::config::ProxyConfig;

/// Application configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub accounts: AccountsConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountsConfig {
    #[serde(default = "default_accounts_dir")]
    pub directory: PathBuf,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            directory: default_accounts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Tried in order; later entries are fallbacks.
    #[serde(default = "default_base_urls")]
    pub base_urls: Vec<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Optional outbound proxy for upstream calls.
    #[serde(default)]
    pub proxy_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_urls: default_base_urls(),
            connect_timeout_secs: default_connect_timeout(),
            proxy_url: String::new(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicyKind {
    RoundRobin,
    LeastRecentlyUsed,
}

impl Default for SelectionPolicyKind {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionConfig {
    #[serde(default)]
    pub policy: SelectionPolicyKind,

    /// Default cool-down for an account after an auth or quota failure.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicyKind::default(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// How long `stop` waits for in-flight requests before closing them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_connect_timeout() -> u64 { 20 }
fn default_cooldown_seconds() -> u64 { 60 }
fn default_shutdown_grace() -> u64 { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_user_agent() -> String { format!("modelgate/{}", env!("CARGO_PKG_VERSION")) }

fn default_base_urls() -> Vec<String> {
    vec![
        "https://cloudcode-pa.googleapis.com/v1internal".to_string(),
        "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal".to_string(),
    ]
}

fn default_accounts_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelgate")
        .join("accounts")
}

/// Get default config file path
/// Uses ~/.config/modelgate/config.toml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("modelgate")
        .join("config.toml")
}

/// Resolve which file to use.
///
/// Order:
/// 1. Specified path (if provided)
/// 2. ./config.toml (if exists)
/// 3. default_config_path()
pub fn resolve_config_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }
    let local_config = PathBuf::from("config.toml");
    if local_config.exists() {
        return local_config;
    }
    default_config_path()
}

pub fn read_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {:?}: {}", path, e))?;
    Ok(config)
}

/// Load config from `path`; on first run write generated defaults there.
pub fn load_or_init(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = read_config(path)?;
        tracing::info!("Loaded config from {:?}", path);
        return Ok(config);
    }

    let config = AppConfig::default();
    save_config(path, &config)?;
    tracing::info!("No config file found, wrote defaults to {:?}", path);
    Ok(config)
}

/// Write atomically: temp file in the same directory, then rename.
pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Expand ~ in path to home directory
pub fn expand_path(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(rest) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_generated_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let first = load_or_init(&path).unwrap();
        assert!(path.exists());
        assert!(first.proxy.api_key.starts_with("sk-"));
        assert_eq!(first.proxy.port, 8045);

        // The generated key persists across loads.
        let second = load_or_init(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn save_round_trips_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config
            .proxy
            .openai_mapping
            .insert("gpt-4-series".into(), "gemini-3-pro-high".into());
        config.selection.policy = SelectionPolicyKind::LeastRecentlyUsed;
        save_config(&path, &config).unwrap();

        let loaded = read_config(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_sections() {
        let config: AppConfig = toml::from_str(
            r#"
            [proxy]
            port = 9100
            api_key = "K"

            [selection]
            cooldown_seconds = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.api_key, "K");
        assert_eq!(config.selection.cooldown_seconds, 5);
        assert_eq!(config.selection.policy, SelectionPolicyKind::RoundRobin);
        assert_eq!(config.upstream.base_urls.len(), 2);
        assert_eq!(config.server.shutdown_grace_secs, 5);
    }

    #[test]
    fn tilde_is_expanded() {
        let expanded = expand_path(Path::new("~/accounts"));
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
    }
}
