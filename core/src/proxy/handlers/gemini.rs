//! Gemini REST handlers
//! Handles /v1beta/models and /v1beta/models/:model_action

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::Method,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::catalog;
use crate::error::GatewayError;
use crate::proxy::adapter::{Adapter, RequestMeta};
use crate::proxy::handlers::common::handle_generation;
use crate::proxy::mappers::gemini;
use crate::proxy::server::AppState;

/// Handle GET /v1beta/models
pub async fn handle_list_models() -> Response {
    Json(gemini::format_model_list()).into_response()
}

/// Handle `/v1beta/models/{model}:{action}` and `GET /v1beta/models/{model}`
pub async fn handle_model_action(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    method: Method,
    body: Bytes,
) -> Response {
    if method == Method::GET && !model_action.contains(':') {
        return get_model(&model_action);
    }
    if method != Method::POST {
        return Adapter::Gemini.error_response(&GatewayError::InvalidRequest(format!(
            "{} is not supported on this path",
            method
        )));
    }

    let (model, action) = match gemini::split_model_action(&model_action) {
        Ok(parts) => parts,
        Err(e) => return Adapter::Gemini.error_response(&e),
    };
    let stream = match action.as_str() {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Adapter::Gemini.error_response(&GatewayError::InvalidRequest(format!(
                "unsupported action '{}'",
                other
            )))
        }
    };

    let meta = RequestMeta {
        model: Some(model),
        stream,
    };
    handle_generation(state, Adapter::Gemini, body, meta).await
}

fn get_model(model: &str) -> Response {
    let id = model.trim_start_matches("models/");
    match catalog::find(id) {
        Some(entry) => Json(json!({
            "name": format!("models/{}", entry.id),
            "displayName": entry.display_name,
            "description": entry.description,
            "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
        }))
        .into_response(),
        None => Adapter::Gemini.error_response(&GatewayError::UnknownModel {
            model: id.to_string(),
            message: "not in the model catalog".into(),
        }),
    }
}
