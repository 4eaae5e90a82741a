//! Shared request pipeline
//!
//! parse -> resolve -> plan -> dispatch -> format. Every protocol handler
//! funnels into [`handle_generation`]; only the adapter differs.

use axum::{
    body::{Body, Bytes},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::adapter::{Adapter, RequestMeta};
use crate::proxy::mappers::canonical;
use crate::proxy::server::AppState;
use crate::proxy::upstream::dispatcher::{ChunkStream, DispatchOutcome};

/// Six lowercase alphanumerics, unique enough to follow one request in logs.
pub fn new_trace_id() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn parse_body(body: &Bytes) -> GatewayResult<Value> {
    if body.is_empty() {
        return Err(GatewayError::InvalidRequest("request body is empty".into()));
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid JSON body: {}", e)))
}

pub async fn handle_generation(
    state: AppState,
    adapter: Adapter,
    body: Bytes,
    meta: RequestMeta,
) -> Response {
    let trace_id = new_trace_id();
    match run(&state, adapter, &body, meta, &trace_id).await {
        Ok(response) => response,
        Err(e) => {
            warn!("[{}] {} request failed: {}", trace_id, adapter.protocol(), e);
            adapter.error_response(&e)
        }
    }
}

async fn run(
    state: &AppState,
    adapter: Adapter,
    body: &Bytes,
    meta: RequestMeta,
    trace_id: &str,
) -> GatewayResult<Response> {
    // One snapshot for the whole request; later updates do not tear it.
    let runtime = state.runtime.load_full();

    let value = parse_body(body)?;
    let request = adapter.parse_request(value, &meta)?;
    let resolution = state
        .resolver
        .resolve(adapter.protocol(), &runtime.mapping, &request.model)?;
    let call = canonical::plan(&request, &resolution.target)?;

    info!(
        "[{}] {} request | {} -> {} ({:?}) | stream: {}",
        trace_id,
        adapter.protocol(),
        resolution.requested,
        call.model,
        resolution.source,
        call.stream
    );

    let outcome = tokio::select! {
        outcome = state.dispatcher.dispatch(&call, runtime.request_timeout, trace_id) => outcome?,
        _ = state.force_close.cancelled() => {
            return Err(GatewayError::UpstreamUnavailable("gateway is shutting down".into()));
        }
    };

    match outcome {
        DispatchOutcome::Complete(chunk) => {
            if let Some(usage) = chunk.usage {
                info!(
                    "[{}] Completed | In: {} | Out: {}",
                    trace_id, usage.input_tokens, usage.output_tokens
                );
            }
            Ok(Json(adapter.format_response(&chunk, &resolution.requested)).into_response())
        }
        DispatchOutcome::Stream(chunks) => Ok(sse_response(
            adapter,
            &resolution.requested,
            chunks,
            state.force_close.clone(),
            trace_id.to_string(),
        )),
    }
}

/// Logs how a stream ended, including when the client walks away and the
/// body is dropped mid-flight.
struct StreamGuard {
    trace_id: String,
    started: Instant,
    completed: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.completed {
            debug!(
                "[{}] Stream finished in {:?}",
                self.trace_id,
                self.started.elapsed()
            );
        } else {
            info!(
                "[{}] Client disconnected after {:?}, upstream call dropped",
                self.trace_id,
                self.started.elapsed()
            );
        }
    }
}

/// Frame canonical chunks as the client protocol's SSE. Dropping the body
/// drops the upstream stream with it, which closes the upstream connection.
fn sse_response(
    adapter: Adapter,
    model: &str,
    mut chunks: ChunkStream,
    force_close: CancellationToken,
    trace_id: String,
) -> Response {
    let mut framer = adapter.stream_framer(model);

    let body = async_stream::stream! {
        let mut guard = StreamGuard {
            trace_id,
            started: Instant::now(),
            completed: false,
        };

        for event in framer.start() {
            yield Ok::<Bytes, std::io::Error>(event);
        }

        let mut failure: Option<GatewayError> = None;
        loop {
            let next = tokio::select! {
                next = chunks.next() => next,
                _ = force_close.cancelled() => {
                    failure = Some(GatewayError::UpstreamStreamInterrupted(
                        "gateway is shutting down".into(),
                    ));
                    break;
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    for event in framer.chunk(&chunk) {
                        yield Ok(event);
                    }
                }
                Some(Err(e)) => {
                    warn!("[{}] Stream ended with error: {}", guard.trace_id, e);
                    failure = Some(e);
                    break;
                }
                None => break,
            }
        }

        for event in framer.finish(failure.as_ref()) {
            yield Ok(event);
        }
        guard.completed = true;
    };

    let mut response = Body::from_stream(body).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_short_and_lowercase() {
        let id = new_trace_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn body_must_be_json() {
        assert!(matches!(
            parse_body(&Bytes::new()),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_body(&Bytes::from_static(b"{not json")),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(parse_body(&Bytes::from_static(b"{}")).is_ok());
    }

    #[tokio::test]
    async fn stream_is_terminated_once_on_error() {
        use crate::proxy::adapter::OpenAiRoute;
        use crate::proxy::mappers::canonical::{CanonicalChunk, ChunkPart};
        use futures::stream;

        let chunk = CanonicalChunk {
            parts: vec![ChunkPart::Text("hi".into())],
            ..Default::default()
        };
        let chunks: ChunkStream = Box::pin(stream::iter(vec![
            Ok(chunk),
            Err(GatewayError::UpstreamStreamInterrupted("idle".into())),
        ]));
        let response = sse_response(
            Adapter::OpenAi(OpenAiRoute::ChatCompletions),
            "gpt-4",
            chunks,
            CancellationToken::new(),
            "abcdef".into(),
        );
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"hi\""));
        assert!(text.contains("upstream_stream_interrupted"));
        assert_eq!(text.matches("[DONE]").count(), 1);
    }
}
