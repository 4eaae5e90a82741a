//! API key authentication
//!
//! Each protocol carries its credential its own way. The key is compared in
//! constant time against the live snapshot, so a regenerated key applies to
//! the next request without a restart.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use crate::catalog::Protocol;
use crate::error::GatewayError;
use crate::proxy::adapter::Adapter;
use crate::proxy::server::AppState;

/// Paths reachable without a key.
const OPEN_PATHS: &[&str] = &["/healthz", "/health"];

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if OPEN_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    // Unknown paths fall through to the router's 404.
    let Some(adapter) = Adapter::for_path(&path) else {
        return next.run(request).await;
    };

    let authorized = {
        let runtime = state.runtime.load();
        let query_key = Query::<HashMap<String, String>>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(mut q)| q.remove("key"));
        extract_key(adapter.protocol(), request.headers(), query_key.as_deref())
            .is_some_and(|key| key_matches(key, &runtime.api_key))
    };

    if authorized {
        return next.run(request).await;
    }
    tracing::warn!(
        "Rejected unauthenticated request to {} ({})",
        path,
        adapter.protocol()
    );
    adapter.error_response(&GatewayError::Unauthorized)
}

/// Pull the client credential out of the places `protocol` puts it.
pub fn extract_key<'a>(
    protocol: Protocol,
    headers: &'a HeaderMap,
    query_key: Option<&'a str>,
) -> Option<&'a str> {
    let bearer = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(str::trim)
    };
    let named = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };

    let key = match protocol {
        Protocol::OpenAi => bearer(),
        Protocol::Anthropic => named("x-api-key").or_else(bearer),
        Protocol::Gemini => named("x-goog-api-key")
            .or(query_key.map(str::trim))
            .or_else(bearer),
    };
    key.filter(|k| !k.is_empty())
}

fn key_matches(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn openai_requires_bearer() {
        let h = headers(&[("authorization", "Bearer sk-1")]);
        assert_eq!(extract_key(Protocol::OpenAi, &h, None), Some("sk-1"));

        let h = headers(&[("x-api-key", "sk-1")]);
        assert_eq!(extract_key(Protocol::OpenAi, &h, None), None);
    }

    #[test]
    fn anthropic_prefers_x_api_key() {
        let h = headers(&[("x-api-key", "a"), ("authorization", "Bearer b")]);
        assert_eq!(extract_key(Protocol::Anthropic, &h, None), Some("a"));

        let h = headers(&[("authorization", "Bearer b")]);
        assert_eq!(extract_key(Protocol::Anthropic, &h, None), Some("b"));
    }

    #[test]
    fn gemini_accepts_header_or_query() {
        let h = headers(&[("x-goog-api-key", "g")]);
        assert_eq!(extract_key(Protocol::Gemini, &h, Some("q")), Some("g"));
        assert_eq!(extract_key(Protocol::Gemini, &HeaderMap::new(), Some("q")), Some("q"));
        assert_eq!(extract_key(Protocol::Gemini, &HeaderMap::new(), Some("")), None);
    }

    #[test]
    fn comparison_is_exact() {
        assert!(key_matches("sk-abc", "sk-abc"));
        assert!(!key_matches("sk-ab", "sk-abc"));
        assert!(!key_matches("", ""));
    }
}
