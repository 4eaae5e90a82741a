//! Control plane
//!
//! The operations a supervisor (desktop shell, CLI) drives: lifecycle,
//! mapping edits, key rotation and config load/save. Every mutation is
//! persisted before it is applied, so a failed write changes nothing.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{self, AppConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::config::{generate_api_key, key_fingerprint, ConfigField, ProxyConfig, ReloadPolicy};
use crate::proxy::mapping::{MappingPatch, MappingTables};
use crate::proxy::server::{ProxyService, ProxyStatus};
use crate::proxy::token_manager::TokenManager;

/// Where the `AppConfig` lives between runs.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> GatewayResult<AppConfig>;
    fn save(&self, config: &AppConfig) -> GatewayResult<()>;
}

/// TOML file on disk; first load writes generated defaults.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> GatewayResult<AppConfig> {
        config::load_or_init(&self.path).map_err(|e| GatewayError::Persistence(e.to_string()))
    }

    fn save(&self, config: &AppConfig) -> GatewayResult<()> {
        config::save_config(&self.path, config)
            .map_err(|e| GatewayError::Persistence(e.to_string()))
    }
}

/// In-process store for embedding and tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    config: RwLock<AppConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> GatewayResult<AppConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| GatewayError::Persistence("config lock poisoned".into()))
    }

    fn save(&self, config: &AppConfig) -> GatewayResult<()> {
        let mut slot = self
            .config
            .write()
            .map_err(|_| GatewayError::Persistence("config lock poisoned".into()))?;
        *slot = config.clone();
        Ok(())
    }
}

/// What `save_config` did with each changed field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    /// Live immediately.
    pub hot: Vec<ConfigField>,
    /// Saved, but the running listener keeps the old value until restart.
    pub restart_required: Vec<ConfigField>,
}

pub struct ControlPlane {
    store: Box<dyn ConfigStore>,
    service: Arc<ProxyService>,
    /// Last persisted config. Held across persist+apply so updates are
    /// serialized and never interleave.
    config: Mutex<AppConfig>,
}

impl ControlPlane {
    /// Load config from `store`, build the account pool from the configured
    /// directory, and prepare a stopped gateway.
    pub fn open(store: Box<dyn ConfigStore>) -> GatewayResult<Self> {
        let config = store.load()?;
        let token_manager = Arc::new(TokenManager::new(
            config.selection.policy,
            Duration::from_secs(config.selection.cooldown_seconds),
        ));
        load_pool(&token_manager, &config);
        Ok(Self::with_token_manager(store, config, token_manager))
    }

    /// Use an already populated pool.
    pub fn with_token_manager(
        store: Box<dyn ConfigStore>,
        config: AppConfig,
        token_manager: Arc<TokenManager>,
    ) -> Self {
        let service = Arc::new(ProxyService::new(token_manager, &config));
        Self {
            store,
            service,
            config: Mutex::new(config),
        }
    }

    pub fn service(&self) -> &Arc<ProxyService> {
        &self.service
    }

    /// Start the gateway if `auto_start` is set.
    pub async fn boot(&self) -> GatewayResult<Option<ProxyStatus>> {
        let proxy = self.config.lock().await.proxy.clone();
        if !proxy.auto_start {
            return Ok(None);
        }
        tracing::info!("auto_start enabled, starting gateway on port {}", proxy.port);
        self.start_proxy_service(proxy).await.map(Some)
    }

    pub fn get_proxy_status(&self) -> ProxyStatus {
        self.service.status()
    }

    /// Start with `proxy`. On success it becomes the saved proxy config, so
    /// later hot updates build on what is actually running. If that save
    /// fails the gateway is stopped again and the error returned.
    pub async fn start_proxy_service(&self, proxy: ProxyConfig) -> GatewayResult<ProxyStatus> {
        let mut current = self.config.lock().await;
        let status = self.service.start(&proxy).await?;
        if current.proxy != proxy {
            let mut next = current.clone();
            next.proxy = proxy;
            if let Err(e) = self.store.save(&next) {
                tracing::warn!("Could not persist started config, stopping gateway: {}", e);
                self.service.stop().await;
                return Err(e);
            }
            *current = next;
        }
        Ok(status)
    }

    pub async fn stop_proxy_service(&self) -> ProxyStatus {
        self.service.stop().await;
        self.service.status()
    }

    /// Merge `patch` into the three tables as one update: all entries apply
    /// or none do. Untouched entries are kept.
    pub async fn update_model_mapping(&self, patch: &MappingPatch) -> GatewayResult<MappingTables> {
        let mut current = self.config.lock().await;
        let tables = current.proxy.mapping_tables().merged(patch)?;
        self.replace_mapping(&mut current, tables.clone())?;
        tracing::info!(
            "Model mapping updated ({} change(s))",
            patch.len()
        );
        Ok(tables)
    }

    /// Clear every table; group defaults apply again.
    pub async fn reset_model_mapping(&self) -> GatewayResult<MappingTables> {
        let mut current = self.config.lock().await;
        self.replace_mapping(&mut current, MappingTables::default())?;
        tracing::info!("Model mapping reset to defaults");
        Ok(MappingTables::default())
    }

    pub async fn model_mapping(&self) -> MappingTables {
        self.config.lock().await.proxy.mapping_tables()
    }

    /// Rotate the API key. Persisted, then live for the next request.
    pub async fn generate_api_key(&self) -> GatewayResult<String> {
        let mut current = self.config.lock().await;
        let mut next = current.clone();
        next.proxy.api_key = generate_api_key();
        self.store.save(&next)?;
        self.service.apply_hot(&next.proxy);
        tracing::info!("API key regenerated ({})", key_fingerprint(&next.proxy.api_key));
        let key = next.proxy.api_key.clone();
        *current = next;
        Ok(key)
    }

    pub async fn load_config(&self) -> AppConfig {
        self.config.lock().await.clone()
    }

    /// Persist `config` and apply what can be applied live.
    pub async fn save_config(&self, config: AppConfig) -> GatewayResult<ApplyReport> {
        config.proxy.validate()?;

        let mut current = self.config.lock().await;
        let changed = current.proxy.changed_fields(&config.proxy);
        self.store.save(&config)?;

        self.service.apply_hot(&config.proxy);
        self.service.configure(&config);

        let token_manager = self.service.token_manager();
        if current.selection.policy != config.selection.policy {
            token_manager.set_policy(config.selection.policy).await;
        }
        token_manager.set_default_cooldown(Duration::from_secs(config.selection.cooldown_seconds));
        if current.accounts.directory != config.accounts.directory {
            load_pool(token_manager, &config);
        }

        *current = config;

        let running = self.service.status().running;
        let (restart_required, hot): (Vec<_>, Vec<_>) = changed
            .into_iter()
            .partition(|f| running && f.reload_policy() == ReloadPolicy::RestartRequired);
        if !restart_required.is_empty() {
            tracing::warn!(
                "Restart required to apply: {}",
                restart_required
                    .iter()
                    .map(|f| f.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(ApplyReport {
            hot,
            restart_required,
        })
    }

    /// Re-read the account directory.
    pub async fn reload_accounts(&self) -> GatewayResult<usize> {
        let config = self.config.lock().await;
        let dir = config::expand_path(&config.accounts.directory);
        self.service
            .token_manager()
            .load_accounts(&dir)
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))
    }

    fn replace_mapping(&self, current: &mut AppConfig, tables: MappingTables) -> GatewayResult<()> {
        let mut next = current.clone();
        next.proxy.set_mapping_tables(tables);
        self.store.save(&next)?;
        self.service.apply_hot(&next.proxy);
        *current = next;
        Ok(())
    }
}

fn load_pool(token_manager: &TokenManager, config: &AppConfig) {
    let dir = config::expand_path(&config.accounts.directory);
    if let Err(e) = token_manager.load_accounts(&dir) {
        tracing::warn!("No accounts loaded: {}", e);
        token_manager.replace_accounts(Vec::new());
    }
}
