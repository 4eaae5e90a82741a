//! OpenAI-compatible handlers
//! Handles /v1/chat/completions, /v1/completions, /v1/responses, /v1/models

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Json, Response},
};

use crate::proxy::adapter::{Adapter, OpenAiRoute, RequestMeta};
use crate::proxy::handlers::common::handle_generation;
use crate::proxy::mappers::openai;
use crate::proxy::server::AppState;

/// Handle POST /v1/chat/completions
pub async fn handle_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    handle_generation(
        state,
        Adapter::OpenAi(OpenAiRoute::ChatCompletions),
        body,
        RequestMeta::default(),
    )
    .await
}

/// Handle POST /v1/completions
pub async fn handle_completions(State(state): State<AppState>, body: Bytes) -> Response {
    handle_generation(
        state,
        Adapter::OpenAi(OpenAiRoute::Completions),
        body,
        RequestMeta::default(),
    )
    .await
}

/// Handle POST /v1/responses (Codex-style clients)
pub async fn handle_responses(State(state): State<AppState>, body: Bytes) -> Response {
    handle_generation(
        state,
        Adapter::OpenAi(OpenAiRoute::Responses),
        body,
        RequestMeta::default(),
    )
    .await
}

/// Handle GET /v1/models
pub async fn handle_list_models() -> Response {
    Json(openai::format_model_list()).into_response()
}
