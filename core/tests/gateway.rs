//! End-to-end tests: a real gateway in front of a mock v1internal upstream.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modelgate_core::account::Account;
use modelgate_core::config::{AppConfig, SelectionPolicyKind};
use modelgate_core::proxy::{MappingPatch, MappingTable, ServerPhase, TokenManager};
use modelgate_core::{ControlPlane, GatewayError, MemoryConfigStore};

const KEY: &str = "sk-test-key";

/// What `:streamGenerateContent` sends.
#[derive(Clone, Copy, Default)]
enum StreamScript {
    /// A "tick" every 50ms until the reader goes away.
    #[default]
    Endless,
    /// "hel", then "lo" with `finishReason: STOP`, then EOF.
    Finite,
    /// One chunk, then a Google error object.
    FailAfterFirst,
}

#[derive(Clone, Default)]
struct Upstream {
    hits: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    reject_token: Option<String>,
    delay: Option<Duration>,
    stream: StreamScript,
    stream_dropped: Arc<AtomicBool>,
}

/// Flags the upstream stream as gone when the gateway stops reading it.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn gemini_chunk(text: &str, finish: Option<&str>) -> Value {
    let mut candidate = json!({ "content": { "role": "model", "parts": [{ "text": text }] } });
    if let Some(reason) = finish {
        candidate["finishReason"] = json!(reason);
    }
    json!({
        "response": {
            "candidates": [candidate],
            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 1 }
        }
    })
}

async fn upstream_handler(
    State(up): State<Upstream>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    up.hits.fetch_add(1, Ordering::SeqCst);
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    up.tokens.lock().unwrap().push(token.clone());
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        up.bodies.lock().unwrap().push(value);
    }

    if up.reject_token.as_deref() == Some(token.as_str()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "120")],
            json!({ "error": { "code": 429, "message": "quota exhausted" } }).to_string(),
        )
            .into_response();
    }
    if let Some(delay) = up.delay {
        tokio::time::sleep(delay).await;
    }

    if uri.path().ends_with(":streamGenerateContent") {
        let flag = up.stream_dropped.clone();
        let script = up.stream;
        let events = async_stream::stream! {
            let _guard = DropFlag(flag);
            match script {
                StreamScript::Endless => loop {
                    let data = format!("data: {}\n\n", gemini_chunk("tick", None));
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(data));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                },
                StreamScript::Finite => {
                    yield Ok(Bytes::from(format!("data: {}\n\n", gemini_chunk("hel", None))));
                    yield Ok(Bytes::from(format!(
                        "data: {}\n\n",
                        gemini_chunk("lo", Some("STOP"))
                    )));
                }
                StreamScript::FailAfterFirst => {
                    yield Ok(Bytes::from(format!("data: {}\n\n", gemini_chunk("par", None))));
                    let error = json!({ "error": { "code": 500, "message": "backend crashed" } });
                    yield Ok(Bytes::from(format!("data: {}\n\n", error)));
                }
            }
        };
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(events))
            .unwrap();
    }

    axum::Json(gemini_chunk("hello", Some("STOP"))).into_response()
}

async fn spawn_upstream(up: Upstream) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(upstream_handler).with_state(up);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Harness {
    plane: ControlPlane,
    pool: Arc<TokenManager>,
    base_url: String,
    client: reqwest::Client,
}

async fn gateway(up: &Upstream, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let upstream_addr = spawn_upstream(up.clone()).await;

    let mut config = AppConfig::default();
    config.proxy.port = free_port();
    config.proxy.api_key = KEY.to_string();
    config.upstream.base_urls = vec![format!("http://{}/v1internal", upstream_addr)];
    config.upstream.connect_timeout_secs = 2;
    config.server.shutdown_grace_secs = 1;
    configure(&mut config);

    let pool = Arc::new(TokenManager::with_accounts(
        vec![
            Account::new("a", "a@example.com", "tok-a"),
            Account::new("b", "b@example.com", "tok-b"),
        ],
        SelectionPolicyKind::RoundRobin,
        Duration::from_secs(60),
    ));
    let plane = ControlPlane::with_token_manager(
        Box::new(MemoryConfigStore::new(config.clone())),
        config.clone(),
        Arc::clone(&pool),
    );
    let status = plane.start_proxy_service(config.proxy.clone()).await.unwrap();

    Harness {
        plane,
        pool,
        base_url: status.base_url,
        client: reqwest::Client::new(),
    }
}

impl Harness {
    async fn chat(&self, key: &str, model: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&json!({ "model": model, "messages": [{ "role": "user", "content": "hi" }] }))
            .send()
            .await
            .unwrap()
    }

    async fn messages(&self, model: &str, stream: bool) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", KEY)
            .json(&json!({
                "model": model,
                "max_tokens": 64,
                "stream": stream,
                "messages": [{ "role": "user", "content": "hi" }]
            }))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn gpt4_is_routed_through_its_group() {
    let up = Upstream::default();
    let h = gateway(&up, |c| {
        c.proxy
            .openai_mapping
            .insert("gpt-4-series".into(), "gemini-3-pro-high".into());
    })
    .await;

    let response = h.chat(KEY, "gpt-4").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["model"], "gpt-4");

    let sent = up.bodies.lock().unwrap().last().cloned().unwrap();
    assert_eq!(sent["model"], "gemini-3-pro-high");
    assert_eq!(sent["requestType"], "agent");

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn bad_key_is_rejected_before_dispatch() {
    let up = Upstream::default();
    let h = gateway(&up, |_| {}).await;

    let response = h.chat("sk-wrong", "gpt-4").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let response = h
        .client
        .post(format!("{}/v1/messages", h.base_url))
        .json(&json!({ "model": "claude-sonnet-4-5", "messages": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");

    assert_eq!(up.hits.load(Ordering::SeqCst), 0);
    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn image_model_is_never_forwarded_for_anthropic() {
    let up = Upstream::default();
    let h = gateway(&up, |c| {
        c.proxy
            .custom_mapping
            .insert("claude-sonnet-4-5".into(), "gemini-3-pro-image".into());
    })
    .await;

    for model in ["gemini-3-pro-image", "gemini-3-pro-image-16x9", "claude-sonnet-4-5"] {
        let response = h.messages(model, false).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", model);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["type"], "error");
    }
    assert_eq!(up.hits.load(Ordering::SeqCst), 0);
    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn unhealthy_pool_fails_without_network_io() {
    let up = Upstream::default();
    let h = gateway(&up, |_| {}).await;
    h.pool
        .mark_unhealthy("a", Duration::from_secs(60), "HTTP 401")
        .await;
    h.pool
        .mark_unhealthy("b", Duration::from_secs(60), "HTTP 401")
        .await;
    assert_eq!(h.plane.get_proxy_status().active_accounts, 0);

    let response = h.messages("claude-sonnet-4-5", false).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "overloaded_error");
    assert_eq!(up.hits.load(Ordering::SeqCst), 0);

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn quota_failure_retries_once_on_another_account() {
    let up = Upstream {
        reject_token: Some("tok-a".into()),
        ..Default::default()
    };
    let h = gateway(&up, |_| {}).await;

    let response = h.chat(KEY, "gemini-3-flash").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*up.tokens.lock().unwrap(), vec!["tok-a", "tok-b"]);
    assert!(h.pool.is_cooling_down("a"));
    assert!(!h.pool.is_cooling_down("b"));

    // The cooled account is skipped from now on.
    let response = h.chat(KEY, "gemini-3-flash").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(up.tokens.lock().unwrap().last().unwrap(), "tok-b");

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn network_failure_is_not_retried() {
    let up = Upstream::default();
    let dead = free_port();
    let h = gateway(&up, |c| {
        c.upstream.base_urls = vec![format!("http://127.0.0.1:{}/v1internal", dead)];
        c.upstream.connect_timeout_secs = 1;
    })
    .await;

    let response = h.chat(KEY, "gemini-3-flash").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upstream_unavailable");

    // Nobody is blamed for a transport failure.
    assert!(!h.pool.is_cooling_down("a"));
    assert!(!h.pool.is_cooling_down("b"));
    assert_eq!(h.plane.get_proxy_status().active_accounts, 2);

    // Round robin handed out "a" only; a retry would have moved past "b".
    let next = h.pool.select(&HashSet::new()).await.unwrap();
    assert_eq!(next.id, "b");

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn upstream_error_mid_stream_ends_messages_with_one_error_event() {
    let up = Upstream {
        stream: StreamScript::FailAfterFirst,
        ..Default::default()
    };
    let h = gateway(&up, |_| {}).await;

    let response = h.messages("claude-sonnet-4-5", true).await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = response.text().await.unwrap();

    assert!(text.contains("event: message_start"));
    assert!(text.contains("par"));
    assert_eq!(text.matches("event: error").count(), 1);
    assert!(text.contains("backend crashed"));
    assert!(!text.contains("message_stop"));
    let last = text
        .trim_end()
        .rsplit("\n\n")
        .next()
        .unwrap_or_default();
    assert!(last.starts_with("event: error"), "{}", last);

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn slow_upstream_reports_timeout() {
    let up = Upstream {
        delay: Some(Duration::from_secs(3)),
        ..Default::default()
    };
    let h = gateway(&up, |_| {}).await;

    // Below the validated range, so set straight on the live snapshot.
    let mut proxy = h.plane.load_config().await.proxy;
    proxy.request_timeout = 1;
    h.plane.service().apply_hot(&proxy);

    let response = h.chat(KEY, "gemini-3-flash").await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upstream_timeout");

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn second_start_on_same_port_is_port_in_use() {
    let up = Upstream::default();
    let h = gateway(&up, |_| {}).await;
    let proxy = h.plane.load_config().await.proxy;

    let err = h.plane.start_proxy_service(proxy.clone()).await.unwrap_err();
    assert_eq!(err, GatewayError::PortInUse(proxy.port));

    let status = h.plane.get_proxy_status();
    assert!(status.running);
    assert_eq!(status.port, proxy.port);

    let status = h.plane.stop_proxy_service().await;
    assert!(!status.running);
    assert_eq!(status.phase, ServerPhase::Stopped);

    // The port is free again after a stop.
    assert!(h.plane.start_proxy_service(proxy).await.unwrap().running);
    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn port_held_elsewhere_is_port_in_use() {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let mut config = AppConfig::default();
    config.proxy.port = port;
    let plane = ControlPlane::with_token_manager(
        Box::new(MemoryConfigStore::new(config.clone())),
        config.clone(),
        Arc::new(TokenManager::new(
            SelectionPolicyKind::RoundRobin,
            Duration::from_secs(60),
        )),
    );

    let err = plane.start_proxy_service(config.proxy).await.unwrap_err();
    assert_eq!(err, GatewayError::PortInUse(port));
    assert_eq!(plane.get_proxy_status().phase, ServerPhase::Stopped);
}

#[tokio::test]
async fn client_disconnect_cancels_upstream_stream() {
    let up = Upstream::default();
    let h = gateway(&up, |_| {}).await;

    let mut response = h.messages("claude-sonnet-4-5", true).await;
    assert_eq!(response.status(), StatusCode::OK);
    let first = response.chunk().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("message_start"));
    assert!(!up.stream_dropped.load(Ordering::SeqCst));

    drop(response);

    let cancelled = async {
        while !up.stream_dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), cancelled)
        .await
        .expect("upstream stream was not cancelled");

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn mapping_update_applies_to_next_request() {
    let up = Upstream::default();
    let h = gateway(&up, |c| {
        c.proxy
            .anthropic_mapping
            .insert("claude-4.5-series".into(), "gemini-3-flash".into());
    })
    .await;

    h.plane
        .update_model_mapping(
            &MappingPatch::default().set(MappingTable::OpenAi, "gpt-4-series", "gemini-2.5-pro"),
        )
        .await
        .unwrap();

    let response = h.chat(KEY, "gpt-4-turbo").await;
    assert_eq!(response.status(), StatusCode::OK);
    let sent = up.bodies.lock().unwrap().last().cloned().unwrap();
    assert_eq!(sent["model"], "gemini-2.5-pro");

    // The earlier anthropic entry survived the merge.
    let tables = h.plane.model_mapping().await;
    assert_eq!(
        tables.anthropic.get("claude-4.5-series").map(String::as_str),
        Some("gemini-3-flash")
    );

    h.plane.reset_model_mapping().await.unwrap();
    let response = h.chat(KEY, "gpt-4-turbo").await;
    assert_eq!(response.status(), StatusCode::OK);
    let sent = up.bodies.lock().unwrap().last().cloned().unwrap();
    assert_eq!(sent["model"], "gemini-3-pro-high");

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn rotated_key_is_enforced_immediately() {
    let up = Upstream::default();
    let h = gateway(&up, |_| {}).await;

    let new_key = h.plane.generate_api_key().await.unwrap();
    assert_eq!(h.chat(KEY, "gemini-3-flash").await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.chat(&new_key, "gemini-3-flash").await.status(), StatusCode::OK);

    h.plane.stop_proxy_service().await;
}

#[tokio::test]
async fn gemini_path_streams_with_query_key() {
    let up = Upstream {
        stream: StreamScript::Finite,
        ..Default::default()
    };
    let h = gateway(&up, |_| {}).await;

    let response = h
        .client
        .post(format!(
            "{}/v1beta/models/gemini-3-flash:streamGenerateContent?alt=sse&key={}",
            h.base_url, KEY
        ))
        .json(&json!({ "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    let text = response.text().await.unwrap();

    let events: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let streamed: String = events
        .iter()
        .filter_map(|e| e["candidates"][0]["content"]["parts"][0]["text"].as_str())
        .collect();
    assert_eq!(streamed, "hello");
    let last = events.last().unwrap();
    assert_eq!(last["candidates"][0]["finishReason"], "STOP");
    assert_eq!(
        events
            .iter()
            .filter(|e| !e["candidates"][0]["finishReason"].is_null())
            .count(),
        1
    );

    // The non-streaming action answers on the same key.
    let response = h
        .client
        .post(format!(
            "{}/v1beta/models/gemini-3-flash:generateContent?key={}",
            h.base_url, KEY
        ))
        .json(&json!({ "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "hello");

    let models: Value = h
        .client
        .get(format!("{}/v1beta/models", h.base_url))
        .header("x-goog-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(models["models"].as_array().is_some_and(|m| !m.is_empty()));

    h.plane.stop_proxy_service().await;
}
