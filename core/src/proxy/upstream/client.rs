//! Upstream client for calling the Cloud Code v1internal API

use reqwest::{header, Client, Response};
use serde_json::Value;
use tokio::time::Duration;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, GatewayResult};

#[derive(Clone)]
pub struct UpstreamClient {
    http_client: Client,
    base_urls: Vec<String>,
    user_agent: String,
}

impl UpstreamClient {
    /// No overall request timeout is set here; the dispatcher owns deadlines
    /// so long streams are not cut off.
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        if config.base_urls.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "upstream.base_urls must not be empty".into(),
            ));
        }

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(config.user_agent.clone());

        if !config.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&config.proxy_url).map_err(|e| {
                GatewayError::InvalidConfig(format!("upstream.proxy_url: {}", e))
            })?;
            builder = builder.proxy(proxy);
            tracing::info!("Using upstream proxy: {}", config.proxy_url);
        }

        let http_client = builder
            .build()
            .map_err(|e| GatewayError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_urls: config
                .base_urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn build_url(base_url: &str, method: &str, query_string: Option<&str>) -> String {
        if let Some(qs) = query_string {
            format!("{}:{}?{}", base_url, method, qs)
        } else {
            format!("{}:{}", base_url, method)
        }
    }

    fn should_try_next_endpoint(status: reqwest::StatusCode) -> bool {
        status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::NOT_FOUND
            || status.is_server_error()
    }

    /// Call v1internal API with automatic endpoint fallback.
    ///
    /// Returns the first success, or the last endpoint's error response.
    /// `Err` only when no endpoint could be reached.
    pub async fn call_v1_internal(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
    ) -> GatewayResult<Response> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|e| GatewayError::InvalidRequest(format!("account token: {}", e)))?,
        );

        let mut last_err: Option<String> = None;

        for (idx, base_url) in self.base_urls.iter().enumerate() {
            let url = Self::build_url(base_url, method, query_string);
            let has_next = idx + 1 < self.base_urls.len();

            let response = self
                .http_client
                .post(&url)
                .headers(headers.clone())
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if idx > 0 {
                            tracing::info!(
                                "Upstream fallback succeeded: {} (attempt {})",
                                base_url,
                                idx + 1
                            );
                        }
                        return Ok(resp);
                    }

                    if has_next && Self::should_try_next_endpoint(status) {
                        tracing::warn!("Upstream {} returned {}, trying next", base_url, status);
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    let msg = format!("Request failed at {}: {}", base_url, e);
                    tracing::debug!("{}", msg);
                    last_err = Some(msg);
                }
            }
        }

        Err(GatewayError::UpstreamUnavailable(
            last_err.unwrap_or_else(|| "All endpoints failed".to_string()),
        ))
    }
}
