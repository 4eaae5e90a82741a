//! Upstream dispatch
//!
//! Picks an account, issues the call, and turns the upstream answer into
//! canonical chunks. Auth and quota failures get one retry on another
//! account; everything else propagates as is.

use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{header, Response};
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::mappers::canonical::{CanonicalChunk, UpstreamCall};
use crate::proxy::rate_limit::is_account_failure;
use crate::proxy::token_manager::TokenManager;
use crate::proxy::upstream::client::UpstreamClient;

/// First try plus one retry on a different account.
pub const MAX_ATTEMPTS: usize = 2;

pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<CanonicalChunk>> + Send>>;

pub enum DispatchOutcome {
    Complete(CanonicalChunk),
    /// Yields at least one item; ends after the first `Err`.
    Stream(ChunkStream),
}

enum AttemptError {
    Account {
        status: u16,
        retry_after: Option<String>,
        body: String,
    },
    Fatal(GatewayError),
}

pub struct Dispatcher {
    client: UpstreamClient,
    token_manager: Arc<TokenManager>,
}

impl Dispatcher {
    pub fn new(client: UpstreamClient, token_manager: Arc<TokenManager>) -> Self {
        Self {
            client,
            token_manager,
        }
    }

    pub async fn dispatch(
        &self,
        call: &UpstreamCall,
        request_timeout: Duration,
        trace_id: &str,
    ) -> GatewayResult<DispatchOutcome> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_failure: Option<GatewayError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let account = match self.token_manager.select(&tried).await {
                Ok(account) => account,
                // A retry with nobody left surfaces the original failure.
                Err(e) => return Err(last_failure.unwrap_or(e)),
            };
            tried.insert(account.id.clone());

            info!(
                "[{}] Using account: {} (model: {}, attempt {}/{})",
                trace_id,
                account.email,
                call.model,
                attempt + 1,
                MAX_ATTEMPTS
            );

            match self.attempt(&account, call, request_timeout).await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Fatal(e)) => {
                    debug!("[{}] Upstream failed: {}", trace_id, e);
                    return Err(e);
                }
                Err(AttemptError::Account {
                    status,
                    retry_after,
                    body,
                }) => {
                    self.token_manager
                        .report_failure(&account.id, status, retry_after.as_deref(), &body)
                        .await;
                    warn!(
                        "[{}] Account {} rejected with HTTP {}",
                        trace_id, account.email, status
                    );
                    last_failure = Some(GatewayError::UpstreamStatus {
                        status,
                        message: error_message(&body),
                    });
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            GatewayError::NoAvailableAccount("all attempts exhausted".into())
        }))
    }

    async fn attempt(
        &self,
        account: &Account,
        call: &UpstreamCall,
        request_timeout: Duration,
    ) -> Result<DispatchOutcome, AttemptError> {
        let deadline = Instant::now() + request_timeout;
        let timed_out = || AttemptError::Fatal(GatewayError::UpstreamTimeout(request_timeout.as_secs()));

        let body = call.envelope(account.token.project_id.as_deref(), self.client.user_agent());
        let response = timeout_at(
            deadline,
            self.client.call_v1_internal(
                call.method(),
                &account.token.access_token,
                &body,
                call.query(),
            ),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(AttemptError::Fatal)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = timeout_at(deadline, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_else(|| format!("HTTP {}", status));

            if is_account_failure(status) {
                return Err(AttemptError::Account {
                    status,
                    retry_after,
                    body: text,
                });
            }
            let message = error_message(&text);
            let err = if status == 404 {
                GatewayError::UnknownModel {
                    model: call.model.clone(),
                    message,
                }
            } else {
                GatewayError::UpstreamStatus { status, message }
            };
            return Err(AttemptError::Fatal(err));
        }

        if !call.stream {
            let bytes = timeout_at(deadline, response.bytes())
                .await
                .map_err(|_| timed_out())?
                .map_err(|e| AttemptError::Fatal(GatewayError::UpstreamUnavailable(e.to_string())))?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                AttemptError::Fatal(GatewayError::UpstreamProtocolError(format!(
                    "invalid JSON: {}",
                    e
                )))
            })?;
            let chunk = CanonicalChunk::from_gemini(&value).map_err(AttemptError::Fatal)?;
            return Ok(DispatchOutcome::Complete(chunk));
        }

        // Nothing is sent to the client until the first event arrives, so a
        // slow start is still reportable as a plain timeout.
        let mut events = chunk_stream(response);
        let first = match timeout_at(deadline, events.next()).await {
            Err(_) => return Err(timed_out()),
            Ok(None) => {
                return Err(AttemptError::Fatal(GatewayError::UpstreamProtocolError(
                    "stream closed before the first event".into(),
                )))
            }
            Ok(Some(Err(e))) => return Err(AttemptError::Fatal(e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let rest = with_idle_timeout(events, request_timeout);
        let stream = stream::once(async move { Ok::<_, GatewayError>(first) }).chain(rest);
        Ok(DispatchOutcome::Stream(Box::pin(stream)))
    }
}

/// Parse upstream SSE into canonical chunks.
fn chunk_stream(response: Response) -> ChunkStream {
    let events = response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        return None;
                    }
                    let parsed = serde_json::from_str::<Value>(data)
                        .map_err(|e| {
                            GatewayError::UpstreamProtocolError(format!("invalid SSE payload: {}", e))
                        })
                        .and_then(|v| CanonicalChunk::from_gemini(&v));
                    Some(parsed)
                }
                Err(e) => Some(Err(GatewayError::UpstreamStreamInterrupted(e.to_string()))),
            }
        });
    Box::pin(events)
}

/// End the stream with `UpstreamStreamInterrupted` if the upstream goes
/// quiet for longer than `idle`, and stop after the first error.
fn with_idle_timeout(mut inner: ChunkStream, idle: Duration) -> ChunkStream {
    Box::pin(async_stream::stream! {
        loop {
            match timeout(idle, inner.next()).await {
                Ok(Some(Ok(chunk))) => yield Ok(chunk),
                Ok(Some(Err(e))) => {
                    yield Err(e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    yield Err(GatewayError::UpstreamStreamInterrupted(format!(
                        "no data for {}s",
                        idle.as_secs()
                    )));
                    break;
                }
            }
        }
    })
}

/// Pull `error.message` out of a Google error body, else a trimmed body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}
