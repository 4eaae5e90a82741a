//! Anthropic Messages handler

use axum::{body::Bytes, extract::State, response::Response};

use crate::proxy::adapter::{Adapter, RequestMeta};
use crate::proxy::handlers::common::handle_generation;
use crate::proxy::server::AppState;

/// Handle POST /v1/messages
pub async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    handle_generation(state, Adapter::Anthropic, body, RequestMeta::default()).await
}
