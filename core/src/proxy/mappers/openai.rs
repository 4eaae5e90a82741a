//! OpenAI <-> canonical conversion
//!
//! Covers chat completions, legacy text completions and the Responses API.

use bytes::Bytes;
use serde_json::{json, Map, Value};

use super::canonical::{
    CanonicalChunk, CanonicalRequest, ChunkPart, FinishReason, ThinkingRequest, Usage,
};
use super::{parse_data_url, random_id, sse_data, sse_event};
use crate::catalog::{self, Protocol};
use crate::error::{GatewayError, GatewayResult};

const SSE_DONE: &str = "data: [DONE]\n\n";

// ===== Requests =====

/// Convert an OpenAI chat request to canonical form
pub fn parse_chat_request(body: &Value) -> GatewayResult<CanonicalRequest> {
    let model = require_model(body)?;
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            GatewayError::InvalidRequest("'messages' must be a non-empty array".into())
        })?;

    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for msg in messages {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        let parts = content_parts(msg.get("content"));

        match role {
            "system" | "developer" => system_parts.extend(parts),
            "assistant" => push_content(&mut contents, "model", parts),
            _ => push_content(&mut contents, "user", parts),
        }
    }

    if contents.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "request has no user or assistant content".into(),
        ));
    }

    Ok(CanonicalRequest {
        model,
        contents,
        system_instruction: system_instruction(system_parts),
        generation_config: generation_config(body, &["max_tokens", "max_completion_tokens"]),
        stream: is_stream(body),
        thinking: thinking_from_effort(body.get("reasoning_effort")),
        image_size: body
            .get("size")
            .and_then(Value::as_str)
            .map(str::to_string),
        ..Default::default()
    })
}

/// Convert legacy completions format to canonical form
pub fn parse_completion_request(body: &Value) -> GatewayResult<CanonicalRequest> {
    let prompt = match body.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    if prompt.is_empty() {
        return Err(GatewayError::InvalidRequest("'prompt' is required".into()));
    }

    let mut chat = body.clone();
    chat["messages"] = json!([{ "role": "user", "content": prompt }]);
    parse_chat_request(&chat)
}

/// Convert a Responses API request to canonical form
pub fn parse_responses_request(body: &Value) -> GatewayResult<CanonicalRequest> {
    let model = require_model(body)?;
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    if let Some(instructions) = body.get("instructions").and_then(Value::as_str) {
        system_parts.push(json!({ "text": instructions }));
    }

    match body.get("input") {
        Some(Value::String(text)) => {
            push_content(&mut contents, "user", vec![json!({ "text": text })]);
        }
        Some(Value::Array(items)) => {
            for item in items {
                let kind = item.get("type").and_then(Value::as_str).unwrap_or("message");
                if kind != "message" {
                    continue;
                }
                let parts = content_parts(item.get("content"));
                match item.get("role").and_then(Value::as_str).unwrap_or("user") {
                    "system" | "developer" => system_parts.extend(parts),
                    "assistant" => push_content(&mut contents, "model", parts),
                    _ => push_content(&mut contents, "user", parts),
                }
            }
        }
        _ => {}
    }

    if contents.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "'input' must contain at least one message".into(),
        ));
    }

    Ok(CanonicalRequest {
        model,
        contents,
        system_instruction: system_instruction(system_parts),
        generation_config: generation_config(body, &["max_output_tokens"]),
        stream: is_stream(body),
        thinking: thinking_from_effort(body.get("reasoning").and_then(|r| r.get("effort"))),
        ..Default::default()
    })
}

fn require_model(body: &Value) -> GatewayResult<String> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::InvalidRequest("'model' is required".into()))
}

fn is_stream(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

fn content_parts(content: Option<&Value>) -> Vec<Value> {
    let mut parts = Vec::new();
    match content {
        Some(Value::String(s)) => parts.push(json!({ "text": s })),
        Some(Value::Array(arr)) => {
            for item in arr {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    parts.push(json!({ "text": text }));
                    continue;
                }
                // chat: {"image_url": {"url"}}, responses: {"image_url": "..."}
                let url = item
                    .get("image_url")
                    .and_then(|u| u.get("url").or(Some(u)))
                    .and_then(Value::as_str);
                if let Some((mime, data)) = url.and_then(parse_data_url) {
                    parts.push(json!({
                        "inlineData": { "mimeType": mime, "data": data }
                    }));
                }
            }
        }
        _ => {}
    }
    parts
}

fn push_content(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if !parts.is_empty() {
        contents.push(json!({ "role": role, "parts": parts }));
    }
}

fn system_instruction(parts: Vec<Value>) -> Option<Value> {
    (!parts.is_empty()).then(|| json!({ "parts": parts }))
}

fn generation_config(body: &Value, max_token_keys: &[&str]) -> Map<String, Value> {
    let mut config = Map::new();
    if let Some(max) = max_token_keys.iter().find_map(|k| body.get(*k)) {
        config.insert("maxOutputTokens".into(), max.clone());
    }
    if let Some(temp) = body.get("temperature") {
        config.insert("temperature".into(), temp.clone());
    }
    if let Some(top_p) = body.get("top_p") {
        config.insert("topP".into(), top_p.clone());
    }
    match body.get("stop") {
        Some(Value::String(s)) => {
            config.insert("stopSequences".into(), json!([s]));
        }
        Some(stop @ Value::Array(_)) => {
            config.insert("stopSequences".into(), stop.clone());
        }
        _ => {}
    }
    config
}

fn thinking_from_effort(effort: Option<&Value>) -> Option<ThinkingRequest> {
    let budget = match effort.and_then(Value::as_str)? {
        "minimal" | "low" => 1024,
        "medium" => 8192,
        "high" => 24576,
        _ => return None,
    };
    Some(ThinkingRequest { budget })
}

// ===== Responses =====

/// Inline images become Markdown data URLs in text content.
fn visible_text(chunk: &CanonicalChunk) -> String {
    let mut out = String::new();
    for part in &chunk.parts {
        match part {
            ChunkPart::Text(t) => out.push_str(t),
            ChunkPart::Image { mime_type, data } => {
                out.push_str(&format!("![image](data:{};base64,{})", mime_type, data));
            }
            ChunkPart::Thought { .. } => {}
        }
    }
    out
}

fn usage_json(usage: Option<Usage>) -> Value {
    let usage = usage.unwrap_or_default();
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens + usage.thoughts_tokens,
        "total_tokens": usage.total(),
    })
}

fn finish_reason(chunk: &CanonicalChunk) -> &'static str {
    chunk
        .finish_reason
        .as_ref()
        .map(FinishReason::as_openai)
        .unwrap_or("stop")
}

/// Convert canonical response to OpenAI chat completion format
pub fn format_chat_response(chunk: &CanonicalChunk, model: &str) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": visible_text(chunk),
    });
    let thoughts = chunk.thoughts();
    if !thoughts.is_empty() {
        message["reasoning_content"] = json!(thoughts);
    }

    json!({
        "id": random_id("chatcmpl-"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason(chunk),
        }],
        "usage": usage_json(chunk.usage),
    })
}

pub fn format_completion_response(chunk: &CanonicalChunk, model: &str) -> Value {
    json!({
        "id": random_id("cmpl-"),
        "object": "text_completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "text": visible_text(chunk),
            "logprobs": null,
            "finish_reason": finish_reason(chunk),
        }],
        "usage": usage_json(chunk.usage),
    })
}

struct ResponseObject<'a> {
    id: &'a str,
    model: &'a str,
    created_at: i64,
    item_id: &'a str,
    text: &'a str,
    reasoning: &'a str,
    usage: Option<Usage>,
}

impl ResponseObject<'_> {
    fn message_item(&self, status: &str) -> Value {
        json!({
            "type": "message",
            "id": self.item_id,
            "status": status,
            "role": "assistant",
            "content": [{ "type": "output_text", "text": self.text, "annotations": [] }],
        })
    }

    fn render(&self, status: &str, error: Option<&GatewayError>) -> Value {
        // The message keeps output_index 0, as announced while streaming.
        let mut output = Vec::new();
        if status != "in_progress" {
            if error.is_none() {
                output.push(self.message_item("completed"));
            }
            if !self.reasoning.is_empty() {
                output.push(json!({
                    "type": "reasoning",
                    "id": format!("rs_{}", self.item_id.trim_start_matches("msg_")),
                    "summary": [{ "type": "summary_text", "text": self.reasoning }],
                }));
            }
        }

        let usage = self.usage.unwrap_or_default();
        let mut obj = json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created_at,
            "model": self.model,
            "status": status,
            "output": output,
            "usage": {
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens + usage.thoughts_tokens,
                "output_tokens_details": { "reasoning_tokens": usage.thoughts_tokens },
                "total_tokens": usage.total(),
            },
        });
        if let Some(err) = error {
            obj["error"] = json!({ "code": err.code(), "message": err.to_string() });
        }
        obj
    }
}

pub fn format_responses_response(chunk: &CanonicalChunk, model: &str) -> Value {
    let id = random_id("resp_");
    let item_id = random_id("msg_");
    let text = visible_text(chunk);
    let reasoning = chunk.thoughts();
    ResponseObject {
        id: &id,
        model,
        created_at: chrono::Utc::now().timestamp(),
        item_id: &item_id,
        text: &text,
        reasoning: &reasoning,
        usage: chunk.usage,
    }
    .render("completed", None)
}

/// GET /v1/models body
pub fn format_model_list() -> Value {
    let data: Vec<Value> = catalog::models_for(Protocol::OpenAi)
        .map(|m| model_object(m.id))
        .collect();
    json!({ "object": "list", "data": data })
}

fn model_object(id: &str) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": 1700000000,
        "owned_by": "modelgate"
    })
}

// ===== Errors =====

pub fn error_body(err: &GatewayError) -> Value {
    let kind = match err {
        GatewayError::Unauthorized => "authentication_error",
        GatewayError::InvalidRequest(_)
        | GatewayError::UnsupportedCapability { .. }
        | GatewayError::UnknownModel { .. } => "invalid_request_error",
        GatewayError::UpstreamStatus { status: 429, .. } => "rate_limit_error",
        _ => "server_error",
    };
    json!({
        "error": {
            "message": err.to_string(),
            "type": kind,
            "code": err.code(),
        }
    })
}

// ===== Streaming =====

/// Frames chat (or legacy text) completion chunks; ends with `[DONE]`.
pub struct ChatFramer {
    id: String,
    model: String,
    created: i64,
    legacy: bool,
    role_sent: bool,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,
}

impl ChatFramer {
    pub fn new(model: &str, legacy: bool) -> Self {
        Self {
            id: random_id(if legacy { "cmpl-" } else { "chatcmpl-" }),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            legacy,
            role_sent: false,
            finish: None,
            usage: None,
            finished: false,
        }
    }

    fn frame(&self, delta: Value, text: &str, finish: Option<&str>) -> Value {
        let choice = if self.legacy {
            json!({ "index": 0, "text": text, "logprobs": null, "finish_reason": finish })
        } else {
            json!({ "index": 0, "delta": delta, "finish_reason": finish })
        };
        json!({
            "id": self.id,
            "object": if self.legacy { "text_completion" } else { "chat.completion.chunk" },
            "created": self.created,
            "model": self.model,
            "choices": [choice],
        })
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

        let text = visible_text(chunk);
        let thoughts = chunk.thoughts();
        if text.is_empty() && (thoughts.is_empty() || self.legacy) {
            return Vec::new();
        }

        let mut delta = Map::new();
        if !self.role_sent {
            delta.insert("role".into(), json!("assistant"));
            self.role_sent = true;
        }
        if !thoughts.is_empty() {
            delta.insert("reasoning_content".into(), json!(thoughts));
        }
        if !text.is_empty() {
            delta.insert("content".into(), json!(text));
        }
        vec![sse_data(&self.frame(Value::Object(delta), &text, None))]
    }

    pub fn finish(&mut self, error: Option<&GatewayError>) -> Vec<Bytes> {
        if std::mem::replace(&mut self.finished, true) {
            return Vec::new();
        }
        let mut out = Vec::new();
        match error {
            Some(err) => out.push(sse_data(&error_body(err))),
            None => {
                let reason = self
                    .finish
                    .as_ref()
                    .map(FinishReason::as_openai)
                    .unwrap_or("stop");
                let mut last = self.frame(json!({}), "", Some(reason));
                if self.usage.is_some() {
                    last["usage"] = usage_json(self.usage);
                }
                out.push(sse_data(&last));
            }
        }
        out.push(Bytes::from_static(SSE_DONE.as_bytes()));
        out
    }
}

/// Frames Responses API events; ends with `response.completed` or
/// `response.failed`.
pub struct ResponsesFramer {
    id: String,
    item_id: String,
    model: String,
    created_at: i64,
    text: String,
    reasoning: String,
    usage: Option<Usage>,
    item_open: bool,
    finished: bool,
}

impl ResponsesFramer {
    pub fn new(model: &str) -> Self {
        Self {
            id: random_id("resp_"),
            item_id: random_id("msg_"),
            model: model.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            text: String::new(),
            reasoning: String::new(),
            usage: None,
            item_open: false,
            finished: false,
        }
    }

    fn object(&self) -> ResponseObject<'_> {
        ResponseObject {
            id: &self.id,
            model: &self.model,
            created_at: self.created_at,
            item_id: &self.item_id,
            text: &self.text,
            reasoning: &self.reasoning,
            usage: self.usage,
        }
    }

    pub fn start(&mut self) -> Vec<Bytes> {
        let response = self.object().render("in_progress", None);
        vec![sse_event(
            "response.created",
            &json!({ "type": "response.created", "response": response }),
        )]
    }

    pub fn chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        self.reasoning.push_str(&chunk.thoughts());

        let delta = visible_text(chunk);
        if delta.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        if !self.item_open {
            self.item_open = true;
            let mut item = self.object().message_item("in_progress");
            item["content"] = json!([]);
            out.push(sse_event(
                "response.output_item.added",
                &json!({ "type": "response.output_item.added", "output_index": 0, "item": item }),
            ));
        }
        self.text.push_str(&delta);
        out.push(sse_event(
            "response.output_text.delta",
            &json!({
                "type": "response.output_text.delta",
                "item_id": self.item_id,
                "output_index": 0,
                "content_index": 0,
                "delta": delta,
            }),
        ));
        out
    }

    pub fn finish(&mut self, error: Option<&GatewayError>) -> Vec<Bytes> {
        if std::mem::replace(&mut self.finished, true) {
            return Vec::new();
        }
        if let Some(err) = error {
            let response = self.object().render("failed", Some(err));
            return vec![sse_event(
                "response.failed",
                &json!({ "type": "response.failed", "response": response }),
            )];
        }

        let mut out = Vec::new();
        if self.item_open {
            out.push(sse_event(
                "response.output_text.done",
                &json!({
                    "type": "response.output_text.done",
                    "item_id": self.item_id,
                    "output_index": 0,
                    "content_index": 0,
                    "text": self.text,
                }),
            ));
            out.push(sse_event(
                "response.output_item.done",
                &json!({
                    "type": "response.output_item.done",
                    "output_index": 0,
                    "item": self.object().message_item("completed"),
                }),
            ));
        }
        let response = self.object().render("completed", None);
        out.push(sse_event(
            "response.completed",
            &json!({ "type": "response.completed", "response": response }),
        ));
        out
    }
}
