//! Proxy configuration
//!
//! The user-facing gateway settings. Every field carries a reload policy:
//! listener-level fields need a restart, everything else is swapped into
//! the live snapshot.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::mapping::MappingTables;

pub const DEFAULT_PORT: u16 = 8045;
pub const PORT_RANGE: RangeInclusive<u16> = 1024..=65535;
pub const REQUEST_TIMEOUT_RANGE: RangeInclusive<u64> = 30..=600;

/// Proxy server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "generate_api_key")]
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub allow_lan_access: bool,
    #[serde(default)]
    pub anthropic_mapping: HashMap<String, String>,
    #[serde(default)]
    pub openai_mapping: HashMap<String, String>,
    #[serde(default)]
    pub custom_mapping: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: generate_api_key(),
            request_timeout: default_request_timeout(),
            auto_start: false,
            allow_lan_access: false,
            anthropic_mapping: HashMap::new(),
            openai_mapping: HashMap::new(),
            custom_mapping: HashMap::new(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout() -> u64 {
    120
}

impl ProxyConfig {
    pub fn get_bind_address(&self) -> &'static str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.get_bind_address(), self.port)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if !PORT_RANGE.contains(&self.port) {
            return Err(GatewayError::InvalidConfig(format!(
                "port {} outside {}-{}",
                self.port,
                PORT_RANGE.start(),
                PORT_RANGE.end()
            )));
        }
        if !REQUEST_TIMEOUT_RANGE.contains(&self.request_timeout) {
            return Err(GatewayError::InvalidConfig(format!(
                "request_timeout {}s outside {}-{}s",
                self.request_timeout,
                REQUEST_TIMEOUT_RANGE.start(),
                REQUEST_TIMEOUT_RANGE.end()
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(GatewayError::InvalidConfig("api_key must not be empty".into()));
        }
        Ok(())
    }

    pub fn mapping_tables(&self) -> MappingTables {
        MappingTables {
            anthropic: self.anthropic_mapping.clone(),
            openai: self.openai_mapping.clone(),
            custom: self.custom_mapping.clone(),
        }
    }

    pub fn set_mapping_tables(&mut self, tables: MappingTables) {
        self.anthropic_mapping = tables.anthropic;
        self.openai_mapping = tables.openai;
        self.custom_mapping = tables.custom;
    }

    /// Fields whose value differs between `self` and `other`.
    pub fn changed_fields(&self, other: &ProxyConfig) -> Vec<ConfigField> {
        ConfigField::ALL
            .into_iter()
            .filter(|field| match field {
                ConfigField::Port => self.port != other.port,
                ConfigField::ApiKey => self.api_key != other.api_key,
                ConfigField::RequestTimeout => self.request_timeout != other.request_timeout,
                ConfigField::AutoStart => self.auto_start != other.auto_start,
                ConfigField::AllowLanAccess => self.allow_lan_access != other.allow_lan_access,
                ConfigField::AnthropicMapping => self.anthropic_mapping != other.anthropic_mapping,
                ConfigField::OpenaiMapping => self.openai_mapping != other.openai_mapping,
                ConfigField::CustomMapping => self.custom_mapping != other.custom_mapping,
            })
            .collect()
    }
}

/// The hot part of the config as seen by one request. Swapped whole on
/// update; a request keeps the snapshot it started with.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub api_key: String,
    pub request_timeout: Duration,
    pub mapping: MappingTables,
}

impl From<&ProxyConfig> for RuntimeConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            request_timeout: Duration::from_secs(config.request_timeout),
            mapping: config.mapping_tables(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigField {
    Port,
    ApiKey,
    RequestTimeout,
    AutoStart,
    AllowLanAccess,
    AnthropicMapping,
    OpenaiMapping,
    CustomMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Applied to new requests as soon as the snapshot is swapped.
    Hot,
    /// Bound into the listener; takes effect after stop + start.
    RestartRequired,
}

impl ConfigField {
    pub const ALL: [ConfigField; 8] = [
        ConfigField::Port,
        ConfigField::ApiKey,
        ConfigField::RequestTimeout,
        ConfigField::AutoStart,
        ConfigField::AllowLanAccess,
        ConfigField::AnthropicMapping,
        ConfigField::OpenaiMapping,
        ConfigField::CustomMapping,
    ];

    pub fn reload_policy(self) -> ReloadPolicy {
        match self {
            ConfigField::Port | ConfigField::AllowLanAccess => ReloadPolicy::RestartRequired,
            _ => ReloadPolicy::Hot,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConfigField::Port => "port",
            ConfigField::ApiKey => "api_key",
            ConfigField::RequestTimeout => "request_timeout",
            ConfigField::AutoStart => "auto_start",
            ConfigField::AllowLanAccess => "allow_lan_access",
            ConfigField::AnthropicMapping => "anthropic_mapping",
            ConfigField::OpenaiMapping => "openai_mapping",
            ConfigField::CustomMapping => "custom_mapping",
        }
    }
}

/// New `sk-` key with 192 bits from the thread-local CSPRNG.
pub fn generate_api_key() -> String {
    let bytes: [u8; 24] = rand::rng().random();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sk-{}", hex)
}

/// Short digest for logs; the key itself is never logged.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8045);
        assert!(config.mapping_tables().is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn validation_bounds() {
        let mut config = ProxyConfig::default();
        config.port = 80;
        assert!(matches!(config.validate(), Err(GatewayError::InvalidConfig(_))));

        config.port = 1024;
        config.request_timeout = 29;
        assert!(config.validate().is_err());
        config.request_timeout = 600;
        config.validate().unwrap();
        config.request_timeout = 601;
        assert!(config.validate().is_err());
    }

    #[test]
    fn generated_keys_are_unique_and_long() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert!(a.starts_with("sk-"));
        assert_eq!(a.len(), 3 + 48);
        assert_eq!(key_fingerprint(&a).len(), 12);
    }

    #[test]
    fn bind_address_follows_lan_flag() {
        let mut config = ProxyConfig::default();
        assert_eq!(config.base_url(), "http://127.0.0.1:8045");
        config.allow_lan_access = true;
        assert_eq!(config.get_bind_address(), "0.0.0.0");
    }

    #[test]
    fn listener_fields_need_restart() {
        let a = ProxyConfig::default();
        let mut b = a.clone();
        b.allow_lan_access = true;
        b.request_timeout = 300;
        b.openai_mapping.insert("gpt-4-series".into(), "gemini-3-flash".into());

        let changed = a.changed_fields(&b);
        assert_eq!(
            changed,
            vec![
                ConfigField::RequestTimeout,
                ConfigField::AllowLanAccess,
                ConfigField::OpenaiMapping
            ]
        );
        let restart: Vec<_> = changed
            .into_iter()
            .filter(|f| f.reload_policy() == ReloadPolicy::RestartRequired)
            .collect();
        assert_eq!(restart, vec![ConfigField::AllowLanAccess]);
    }

    #[test]
    fn runtime_snapshot_carries_hot_fields() {
        let mut config = ProxyConfig::default();
        config.request_timeout = 45;
        config.custom_mapping.insert("a".into(), "b".into());
        let runtime = RuntimeConfig::from(&config);
        assert_eq!(runtime.request_timeout, Duration::from_secs(45));
        assert_eq!(runtime.api_key, config.api_key);
        assert_eq!(runtime.mapping.custom.get("a").map(String::as_str), Some("b"));
    }

    #[test]
    fn missing_fields_get_defaults() {
        let config: ProxyConfig = toml::from_str("port = 9000").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.request_timeout, 120);
        assert!(config.api_key.starts_with("sk-"));
    }
}
