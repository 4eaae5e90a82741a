//! Proxy Server - Axum HTTP server
//!
//! `ProxyService` owns the listener lifecycle:
//! Stopped -> Starting -> Running -> Stopping -> Stopped, with Failed on a
//! bind error. Start and stop are serialized; status reads a snapshot and
//! never waits on either.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{AppConfig, UpstreamConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::config::{key_fingerprint, ProxyConfig, RuntimeConfig};
use crate::proxy::handlers::{claude, gemini, openai};
use crate::proxy::mapping::ModelResolver;
use crate::proxy::middleware::auth_middleware;
use crate::proxy::token_manager::TokenManager;
use crate::proxy::upstream::{Dispatcher, UpstreamClient};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Hot config; each request loads it once.
    pub runtime: Arc<ArcSwap<RuntimeConfig>>,
    pub resolver: Arc<ModelResolver>,
    pub dispatcher: Arc<Dispatcher>,
    pub token_manager: Arc<TokenManager>,
    /// Fires when the stop grace period runs out.
    pub force_close: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
    pub base_url: String,
    pub active_accounts: usize,
    pub phase: ServerPhase,
}

#[derive(Debug, Clone)]
struct Snapshot {
    phase: ServerPhase,
    port: u16,
    base_url: String,
}

#[derive(Debug, Clone)]
struct ServiceOptions {
    upstream: UpstreamConfig,
    shutdown_grace: Duration,
}

struct RunningServer {
    port: u16,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ProxyService {
    token_manager: Arc<TokenManager>,
    resolver: Arc<ModelResolver>,
    runtime: Arc<ArcSwap<RuntimeConfig>>,
    options: ArcSwap<ServiceOptions>,
    snapshot: ArcSwap<Snapshot>,
    lifecycle: Mutex<Option<RunningServer>>,
}

impl ProxyService {
    pub fn new(token_manager: Arc<TokenManager>, config: &AppConfig) -> Self {
        Self {
            token_manager,
            resolver: Arc::new(ModelResolver::standard()),
            runtime: Arc::new(ArcSwap::from_pointee(RuntimeConfig::from(&config.proxy))),
            options: ArcSwap::from_pointee(options_from(config)),
            snapshot: ArcSwap::from_pointee(Snapshot {
                phase: ServerPhase::Stopped,
                port: config.proxy.port,
                base_url: config.proxy.base_url(),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.token_manager
    }

    /// Snapshot of the listener and pool. Never blocks.
    pub fn status(&self) -> ProxyStatus {
        let snapshot = self.snapshot.load();
        ProxyStatus {
            running: snapshot.phase == ServerPhase::Running,
            port: snapshot.port,
            base_url: snapshot.base_url.clone(),
            active_accounts: self.token_manager.active_count(),
            phase: snapshot.phase,
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.snapshot.load().phase
    }

    /// The hot config new requests will see.
    pub fn runtime(&self) -> Arc<RuntimeConfig> {
        self.runtime.load_full()
    }

    /// Swap the hot fields in. In-flight requests keep their snapshot.
    pub fn apply_hot(&self, config: &ProxyConfig) {
        self.runtime.store(Arc::new(RuntimeConfig::from(config)));
    }

    /// Upstream and shutdown settings; used from the next start on.
    pub fn configure(&self, config: &AppConfig) {
        self.options.store(Arc::new(options_from(config)));
        self.snapshot.rcu(|current| {
            if current.phase == ServerPhase::Stopped {
                Arc::new(Snapshot {
                    phase: ServerPhase::Stopped,
                    port: config.proxy.port,
                    base_url: config.proxy.base_url(),
                })
            } else {
                Arc::clone(current)
            }
        });
    }

    pub async fn start(&self, config: &ProxyConfig) -> GatewayResult<ProxyStatus> {
        config.validate()?;

        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_ref() {
            return Err(if running.port == config.port {
                GatewayError::PortInUse(config.port)
            } else {
                GatewayError::InvalidConfig(format!(
                    "gateway already running on port {}; stop it before starting on {}",
                    running.port, config.port
                ))
            });
        }

        self.set_phase(ServerPhase::Starting, config);
        let options = self.options.load_full();

        let client = match UpstreamClient::new(&options.upstream) {
            Ok(client) => client,
            Err(e) => {
                self.set_phase(ServerPhase::Stopped, config);
                return Err(e);
            }
        };

        let addr = format!("{}:{}", config.get_bind_address(), config.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind {}: {}", addr, e);
                self.set_phase(ServerPhase::Failed, config);
                self.set_phase(ServerPhase::Stopped, config);
                return Err(GatewayError::PortInUse(config.port));
            }
        };

        self.runtime.store(Arc::new(RuntimeConfig::from(config)));

        let shutdown = CancellationToken::new();
        let force_close = CancellationToken::new();
        let state = AppState {
            runtime: Arc::clone(&self.runtime),
            resolver: Arc::clone(&self.resolver),
            dispatcher: Arc::new(Dispatcher::new(client, Arc::clone(&self.token_manager))),
            token_manager: Arc::clone(&self.token_manager),
            force_close: force_close.clone(),
        };
        let app = build_router(state);

        let graceful = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
            {
                tracing::error!("Proxy server error: {}", e);
            }
        });

        *lifecycle = Some(RunningServer {
            port: config.port,
            shutdown,
            force_close,
            handle,
        });
        self.set_phase(ServerPhase::Running, config);

        tracing::info!(
            "Proxy server listening on {} (key {}, {} account(s) active)",
            addr,
            key_fingerprint(&config.api_key),
            self.token_manager.active_count()
        );
        Ok(self.status())
    }

    /// Drain for the grace period, then close what is left. Always ends
    /// Stopped; stopping a stopped server is a no-op.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut running) = lifecycle.take() else {
            return;
        };

        self.snapshot.rcu(|current| {
            Arc::new(Snapshot {
                phase: ServerPhase::Stopping,
                ..Snapshot::clone(current)
            })
        });

        let grace = self.options.load().shutdown_grace;
        running.shutdown.cancel();
        if tokio::time::timeout(grace, &mut running.handle).await.is_err() {
            tracing::warn!(
                "Grace period of {}s elapsed, closing remaining connections",
                grace.as_secs()
            );
            running.force_close.cancel();
            if tokio::time::timeout(Duration::from_secs(1), &mut running.handle)
                .await
                .is_err()
            {
                running.handle.abort();
            }
        }

        self.snapshot.rcu(|current| {
            Arc::new(Snapshot {
                phase: ServerPhase::Stopped,
                ..Snapshot::clone(current)
            })
        });
        tracing::info!("Proxy server stopped");
    }

    fn set_phase(&self, phase: ServerPhase, config: &ProxyConfig) {
        self.snapshot.store(Arc::new(Snapshot {
            phase,
            port: config.port,
            base_url: config.base_url(),
        }));
    }
}

fn options_from(config: &AppConfig) -> ServiceOptions {
    ServiceOptions {
        upstream: config.upstream.clone(),
        shutdown_grace: Duration::from_secs(config.server.shutdown_grace_secs),
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/healthz", get(health_check_handler))
        .route("/health", get(health_check_handler))
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(openai::handle_chat_completions))
        .route("/v1/completions", post(openai::handle_completions))
        .route("/v1/responses", post(openai::handle_responses))
        .route("/v1/models", get(openai::handle_list_models))
        // Claude/Anthropic-compatible endpoints
        .route("/v1/messages", post(claude::handle_messages))
        // Gemini endpoints
        .route("/v1beta/models", get(gemini::handle_list_models))
        .route("/v1beta/models/:model_action", any(gemini::handle_model_action))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_check_handler() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}
