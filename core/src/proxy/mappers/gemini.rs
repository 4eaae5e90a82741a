//! Gemini REST <-> canonical conversion
//!
//! The canonical shape already is Gemini's, so this side mostly validates
//! and re-wraps.

use bytes::Bytes;
use serde_json::{json, Map, Value};

use super::canonical::{
    CanonicalChunk, CanonicalRequest, ChunkPart, FinishReason, ThinkingRequest, Usage,
    DEFAULT_THINKING_BUDGET,
};
use super::image::AspectRatio;
use super::sse_data;
use crate::catalog::{self, Protocol};
use crate::error::{GatewayError, GatewayResult};

const PASSTHROUGH_FIELDS: [&str; 3] = ["tools", "toolConfig", "safetySettings"];

/// Split `gemini-3-flash:streamGenerateContent` into model and action.
pub fn split_model_action(model_action: &str) -> GatewayResult<(String, String)> {
    let trimmed = model_action.trim_start_matches("models/");
    match trimmed.rsplit_once(':') {
        Some((model, action)) if !model.is_empty() => Ok((model.to_string(), action.to_string())),
        _ => Err(GatewayError::InvalidRequest(format!(
            "expected '{{model}}:{{action}}', got '{}'",
            model_action
        ))),
    }
}

pub fn parse_request(body: Value, model: &str, stream: bool) -> GatewayResult<CanonicalRequest> {
    let Value::Object(mut body) = body else {
        return Err(GatewayError::InvalidRequest("body must be a JSON object".into()));
    };

    let contents = match body.remove("contents") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => {
            return Err(GatewayError::InvalidRequest(
                "'contents' must be a non-empty array".into(),
            ))
        }
    };

    let system_instruction = body
        .remove("systemInstruction")
        .or_else(|| body.remove("system_instruction"));

    let mut generation_config = match body.remove("generationConfig") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let thinking = generation_config.get("thinkingConfig").and_then(|cfg| {
        let include = cfg
            .get("includeThoughts")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let budget = cfg.get("thinkingBudget").and_then(Value::as_i64);
        match budget {
            Some(b) if b > 0 => Some(ThinkingRequest { budget: b }),
            Some(0) => None,
            _ if include => Some(ThinkingRequest {
                budget: DEFAULT_THINKING_BUDGET,
            }),
            _ => None,
        }
    });

    let image_size = generation_config
        .get("imageConfig")
        .and_then(|c| c.get("aspectRatio"))
        .and_then(Value::as_str)
        .and_then(AspectRatio::from_ratio)
        .map(|r| r.size().to_string());
    generation_config.remove("imageConfig");

    let mut passthrough = Map::new();
    for field in PASSTHROUGH_FIELDS {
        if let Some(value) = body.remove(field) {
            passthrough.insert(field.to_string(), value);
        }
    }

    Ok(CanonicalRequest {
        model: model.to_string(),
        contents,
        system_instruction,
        generation_config,
        passthrough,
        stream,
        thinking,
        image_size,
    })
}

fn part_json(part: &ChunkPart) -> Value {
    match part {
        ChunkPart::Text(text) => json!({ "text": text }),
        ChunkPart::Thought { text, signature } => {
            let mut v = json!({ "text": text, "thought": true });
            if let Some(sig) = signature {
                v["thoughtSignature"] = json!(sig);
            }
            v
        }
        ChunkPart::Image { mime_type, data } => {
            json!({ "inlineData": { "mimeType": mime_type, "data": data } })
        }
    }
}

fn response_json(
    parts: Vec<Value>,
    finish: Option<&FinishReason>,
    usage: Option<Usage>,
    model: &str,
) -> Value {
    let mut candidate = json!({
        "content": { "role": "model", "parts": parts },
        "index": 0,
    });
    if let Some(reason) = finish {
        candidate["finishReason"] = json!(reason.as_gemini());
    }
    let mut resp = json!({
        "candidates": [candidate],
        "modelVersion": model,
    });
    if let Some(usage) = usage {
        resp["usageMetadata"] = usage.to_gemini();
    }
    resp
}

pub fn format_response(chunk: &CanonicalChunk, model: &str) -> Value {
    response_json(
        chunk.parts.iter().map(part_json).collect(),
        Some(chunk.finish_reason.as_ref().unwrap_or(&FinishReason::Stop)),
        chunk.usage,
        model,
    )
}

pub fn error_body(err: &GatewayError) -> Value {
    let code = err.status_code().as_u16();
    let status = match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    };
    json!({
        "error": { "code": code, "message": err.to_string(), "status": status }
    })
}

/// GET /v1beta/models body
pub fn format_model_list() -> Value {
    let models: Vec<Value> = catalog::models_for(Protocol::Gemini)
        .map(|m| {
            json!({
                "name": format!("models/{}", m.id),
                "displayName": m.display_name,
                "description": m.description,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    json!({ "models": models })
}

/// Re-emits canonical chunks as Gemini SSE; the last event always carries
/// `finishReason`, or is an `error` object.
pub struct GeminiFramer {
    model: String,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,
}

impl GeminiFramer {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finish: None,
            usage: None,
            finished: false,
        }
    }

    pub fn start(&mut self) -> Vec<Bytes> {
        Vec::new()
    }

    pub fn chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        if chunk.finish_reason.is_some() {
            self.finish = chunk.finish_reason.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.parts.is_empty() {
            return Vec::new();
        }
        let parts = chunk.parts.iter().map(part_json).collect();
        vec![sse_data(&response_json(parts, None, None, &self.model))]
    }

    pub fn finish(&mut self, error: Option<&GatewayError>) -> Vec<Bytes> {
        if std::mem::replace(&mut self.finished, true) {
            return Vec::new();
        }
        if let Some(err) = error {
            return vec![sse_data(&error_body(err))];
        }
        let reason = self.finish.take().unwrap_or(FinishReason::Stop);
        vec![sse_data(&response_json(
            vec![json!({ "text": "" })],
            Some(&reason),
            self.usage,
            &self.model,
        ))]
    }
}
