//! Protocol adapters
//!
//! A closed set of wire protocols, selected by route prefix. Every variant
//! offers the same capabilities: parse a request into canonical form, format
//! a canonical response, frame a stream, and render errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde_json::Value;

use crate::catalog::Protocol;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::mappers::canonical::{CanonicalChunk, CanonicalRequest};
use crate::proxy::mappers::claude::{self, ClaudeFramer};
use crate::proxy::mappers::gemini::{self, GeminiFramer};
use crate::proxy::mappers::openai::{self, ChatFramer, ResponsesFramer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiRoute {
    ChatCompletions,
    Completions,
    /// Codex-style Responses API.
    Responses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    OpenAi(OpenAiRoute),
    Anthropic,
    Gemini,
}

/// Request facts that live outside the body (Gemini carries them in the path).
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub model: Option<String>,
    pub stream: bool,
}

impl Adapter {
    pub const ALL: [Adapter; 5] = [
        Adapter::OpenAi(OpenAiRoute::ChatCompletions),
        Adapter::OpenAi(OpenAiRoute::Completions),
        Adapter::OpenAi(OpenAiRoute::Responses),
        Adapter::Anthropic,
        Adapter::Gemini,
    ];

    pub fn protocol(self) -> Protocol {
        match self {
            Adapter::OpenAi(_) => Protocol::OpenAi,
            Adapter::Anthropic => Protocol::Anthropic,
            Adapter::Gemini => Protocol::Gemini,
        }
    }

    pub fn route_prefix(self) -> &'static str {
        match self {
            Adapter::OpenAi(OpenAiRoute::ChatCompletions) => "/v1/chat/completions",
            Adapter::OpenAi(OpenAiRoute::Completions) => "/v1/completions",
            Adapter::OpenAi(OpenAiRoute::Responses) => "/v1/responses",
            Adapter::Anthropic => "/v1/messages",
            Adapter::Gemini => "/v1beta/models",
        }
    }

    /// The adapter owning `path`. Other `/v1/` paths fall back to OpenAI so
    /// their errors still get a familiar shape.
    pub fn for_path(path: &str) -> Option<Self> {
        if let Some(adapter) = Self::ALL
            .into_iter()
            .find(|a| path.starts_with(a.route_prefix()))
        {
            return Some(adapter);
        }
        if path.starts_with("/v1beta") {
            return Some(Adapter::Gemini);
        }
        path.starts_with("/v1/")
            .then_some(Adapter::OpenAi(OpenAiRoute::ChatCompletions))
    }

    pub fn parse_request(self, body: Value, meta: &RequestMeta) -> GatewayResult<CanonicalRequest> {
        match self {
            Adapter::OpenAi(OpenAiRoute::ChatCompletions) => openai::parse_chat_request(&body),
            Adapter::OpenAi(OpenAiRoute::Completions) => openai::parse_completion_request(&body),
            Adapter::OpenAi(OpenAiRoute::Responses) => openai::parse_responses_request(&body),
            Adapter::Anthropic => claude::parse_request(body),
            Adapter::Gemini => {
                let model = meta.model.as_deref().ok_or_else(|| {
                    GatewayError::InvalidRequest("model missing from path".into())
                })?;
                gemini::parse_request(body, model, meta.stream)
            }
        }
    }

    pub fn format_response(self, chunk: &CanonicalChunk, model: &str) -> Value {
        match self {
            Adapter::OpenAi(OpenAiRoute::ChatCompletions) => openai::format_chat_response(chunk, model),
            Adapter::OpenAi(OpenAiRoute::Completions) => openai::format_completion_response(chunk, model),
            Adapter::OpenAi(OpenAiRoute::Responses) => openai::format_responses_response(chunk, model),
            Adapter::Anthropic => claude::format_response(chunk, model),
            Adapter::Gemini => gemini::format_response(chunk, model),
        }
    }

    pub fn stream_framer(self, model: &str) -> StreamFramer {
        match self {
            Adapter::OpenAi(OpenAiRoute::ChatCompletions) => {
                StreamFramer::OpenAiChat(ChatFramer::new(model, false))
            }
            Adapter::OpenAi(OpenAiRoute::Completions) => {
                StreamFramer::OpenAiChat(ChatFramer::new(model, true))
            }
            Adapter::OpenAi(OpenAiRoute::Responses) => {
                StreamFramer::OpenAiResponses(ResponsesFramer::new(model))
            }
            Adapter::Anthropic => StreamFramer::Anthropic(ClaudeFramer::new(model)),
            Adapter::Gemini => StreamFramer::Gemini(GeminiFramer::new(model)),
        }
    }

    pub fn error_body(self, err: &GatewayError) -> Value {
        match self {
            Adapter::OpenAi(_) => openai::error_body(err),
            Adapter::Anthropic => claude::error_body(err),
            Adapter::Gemini => gemini::error_body(err),
        }
    }

    pub fn error_response(self, err: &GatewayError) -> Response {
        let status = err.status_code();
        let status = if status.is_client_error() || status.is_server_error() {
            status
        } else {
            StatusCode::BAD_GATEWAY
        };
        (status, Json(self.error_body(err))).into_response()
    }
}

/// Per-stream framing state, one variant per wire format.
pub enum StreamFramer {
    OpenAiChat(ChatFramer),
    OpenAiResponses(ResponsesFramer),
    Anthropic(ClaudeFramer),
    Gemini(GeminiFramer),
}

impl StreamFramer {
    /// Events sent before the first upstream chunk.
    pub fn start(&mut self) -> Vec<Bytes> {
        match self {
            StreamFramer::OpenAiChat(f) => f.start(),
            StreamFramer::OpenAiResponses(f) => f.start(),
            StreamFramer::Anthropic(f) => f.start(),
            StreamFramer::Gemini(f) => f.start(),
        }
    }

    pub fn chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        match self {
            StreamFramer::OpenAiChat(f) => f.chunk(chunk),
            StreamFramer::OpenAiResponses(f) => f.chunk(chunk),
            StreamFramer::Anthropic(f) => f.chunk(chunk),
            StreamFramer::Gemini(f) => f.chunk(chunk),
        }
    }

    /// Terminal event(s). Only the first call produces output.
    pub fn finish(&mut self, error: Option<&GatewayError>) -> Vec<Bytes> {
        match self {
            StreamFramer::OpenAiChat(f) => f.finish(error),
            StreamFramer::OpenAiResponses(f) => f.finish(error),
            StreamFramer::Anthropic(f) => f.finish(error),
            StreamFramer::Gemini(f) => f.finish(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routes_by_prefix() {
        assert_eq!(
            Adapter::for_path("/v1/chat/completions"),
            Some(Adapter::OpenAi(OpenAiRoute::ChatCompletions))
        );
        assert_eq!(
            Adapter::for_path("/v1/responses"),
            Some(Adapter::OpenAi(OpenAiRoute::Responses))
        );
        assert_eq!(Adapter::for_path("/v1/messages"), Some(Adapter::Anthropic));
        assert_eq!(
            Adapter::for_path("/v1beta/models/gemini-3-flash:generateContent"),
            Some(Adapter::Gemini)
        );
        assert_eq!(
            Adapter::for_path("/v1/models"),
            Some(Adapter::OpenAi(OpenAiRoute::ChatCompletions))
        );
        assert_eq!(Adapter::for_path("/healthz"), None);
    }

    #[test]
    fn every_adapter_names_its_protocol() {
        for adapter in Adapter::ALL {
            assert!(adapter.route_prefix().starts_with("/v1"));
        }
        assert_eq!(Adapter::Anthropic.protocol(), Protocol::Anthropic);
        assert_eq!(Adapter::OpenAi(OpenAiRoute::Completions).protocol(), Protocol::OpenAi);
    }

    #[test]
    fn gemini_needs_model_from_path() {
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        assert!(Adapter::Gemini
            .parse_request(body.clone(), &RequestMeta::default())
            .is_err());
        let meta = RequestMeta {
            model: Some("gemini-3-flash".into()),
            stream: true,
        };
        let req = Adapter::Gemini.parse_request(body, &meta).unwrap();
        assert_eq!(req.model, "gemini-3-flash");
        assert!(req.stream);
    }

    #[test]
    fn errors_use_native_shapes() {
        let err = GatewayError::UnsupportedCapability {
            model: "gemini-3-pro-image".into(),
            protocol: "anthropic".into(),
            reason: "x".into(),
        };
        assert_eq!(Adapter::Anthropic.error_body(&err)["type"], "error");
        assert_eq!(
            Adapter::OpenAi(OpenAiRoute::ChatCompletions).error_body(&err)["error"]["code"],
            "unsupported_capability"
        );
        assert_eq!(Adapter::Gemini.error_body(&err)["error"]["status"], "INVALID_ARGUMENT");
        assert_eq!(
            Adapter::Anthropic.error_response(&err).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn every_framer_terminates_once() {
        for adapter in Adapter::ALL {
            let mut framer = adapter.stream_framer("m");
            framer.start();
            assert!(!framer.finish(None).is_empty(), "{:?}", adapter);
            assert!(framer.finish(None).is_empty(), "{:?}", adapter);
            assert!(framer.finish(Some(&GatewayError::UpstreamTimeout(1))).is_empty());
        }
    }
}
