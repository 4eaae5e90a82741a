// Claude Messages <-> canonical conversion

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::canonical::{
    CanonicalChunk, CanonicalRequest, ChunkPart, FinishReason, ThinkingRequest, Usage,
    DEFAULT_THINKING_BUDGET,
};
use super::{random_id, sse_event};
use crate::error::{GatewayError, GatewayResult};

/// Signatures shorter than this are treated as missing.
const MIN_SIGNATURE_LENGTH: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemBlock {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub budget_tokens: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

fn has_valid_signature(signature: &Option<String>) -> bool {
    signature
        .as_ref()
        .map_or(false, |s| s.len() >= MIN_SIGNATURE_LENGTH)
}

fn block_to_part(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({ "text": text })),
        ContentBlock::Image { source } if source.kind == "base64" => {
            let data = source.data.as_deref()?;
            Some(json!({
                "inlineData": {
                    "mimeType": source.media_type.as_deref().unwrap_or("image/png"),
                    "data": data,
                }
            }))
        }
        ContentBlock::Image { .. } => None,
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            if has_valid_signature(signature) {
                Some(json!({
                    "text": thinking,
                    "thought": true,
                    "thoughtSignature": signature,
                }))
            } else if !thinking.is_empty() {
                // Unsigned thinking cannot be replayed; keep it as plain text.
                Some(json!({ "text": thinking }))
            } else {
                None
            }
        }
        ContentBlock::ToolResult { content } => {
            let text = match content {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .filter_map(|i| i.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => return None,
            };
            Some(json!({ "text": text }))
        }
        ContentBlock::Unsupported => None,
    }
}

/// Convert a Claude Messages request body to canonical form
pub fn parse_request(body: Value) -> GatewayResult<CanonicalRequest> {
    let request: ClaudeRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid request body: {}", e)))?;

    if request.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("'model' is required".into()));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "'messages' must be a non-empty array".into(),
        ));
    }

    let mut contents = Vec::new();
    for msg in &request.messages {
        let role = match msg.role.as_str() {
            "assistant" | "model" => "model",
            _ => "user",
        };
        let parts: Vec<Value> = match &msg.content {
            MessageContent::String(s) => vec![json!({ "text": s })],
            MessageContent::Array(blocks) => blocks.iter().filter_map(block_to_part).collect(),
        };
        if !parts.is_empty() {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }

    let system_instruction = match &request.system {
        Some(SystemPrompt::String(s)) if !s.is_empty() => Some(json!({ "parts": [{ "text": s }] })),
        Some(SystemPrompt::Array(blocks)) if !blocks.is_empty() => {
            let parts: Vec<Value> = blocks.iter().map(|b| json!({ "text": b.text })).collect();
            Some(json!({ "parts": parts }))
        }
        _ => None,
    };

    let mut generation_config = Map::new();
    if let Some(max) = request.max_tokens {
        generation_config.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(t) = request.temperature {
        generation_config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        generation_config.insert("topP".into(), json!(p));
    }
    if let Some(k) = request.top_k {
        generation_config.insert("topK".into(), json!(k));
    }
    if let Some(stop) = &request.stop_sequences {
        generation_config.insert("stopSequences".into(), json!(stop));
    }

    let thinking = request
        .thinking
        .as_ref()
        .filter(|t| t.kind == "enabled")
        .map(|t| ThinkingRequest {
            budget: t.budget_tokens.unwrap_or(DEFAULT_THINKING_BUDGET),
        });

    Ok(CanonicalRequest {
        model: request.model,
        contents,
        system_instruction,
        generation_config,
        stream: request.stream,
        thinking,
        ..Default::default()
    })
}

fn image_block(mime_type: &str, data: &str) -> Value {
    json!({
        "type": "image",
        "source": { "type": "base64", "media_type": mime_type, "data": data }
    })
}

/// Convert a canonical response to a Messages API response
pub fn format_response(chunk: &CanonicalChunk, model: &str) -> Value {
    let mut content: Vec<Value> = Vec::new();

    for part in &chunk.parts {
        match part {
            ChunkPart::Text(text) => {
                if let Some(last) = content.last_mut().filter(|b| b["type"] == "text") {
                    let merged = format!("{}{}", last["text"].as_str().unwrap_or_default(), text);
                    last["text"] = json!(merged);
                } else {
                    content.push(json!({ "type": "text", "text": text }));
                }
            }
            ChunkPart::Thought { text, signature } => {
                if let Some(last) = content.last_mut().filter(|b| b["type"] == "thinking") {
                    let merged =
                        format!("{}{}", last["thinking"].as_str().unwrap_or_default(), text);
                    last["thinking"] = json!(merged);
                    if signature.is_some() {
                        last["signature"] = json!(signature);
                    }
                } else {
                    content.push(json!({
                        "type": "thinking",
                        "thinking": text,
                        "signature": signature.clone().unwrap_or_default(),
                    }));
                }
            }
            ChunkPart::Image { mime_type, data } => content.push(image_block(mime_type, data)),
        }
    }

    let usage = chunk.usage.unwrap_or_default();
    json!({
        "id": random_id("msg_"),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": chunk
            .finish_reason
            .as_ref()
            .map(FinishReason::as_anthropic)
            .unwrap_or("end_turn"),
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens + usage.thoughts_tokens,
        }
    })
}

pub fn error_body(err: &GatewayError) -> Value {
    let kind = match err {
        GatewayError::Unauthorized => "authentication_error",
        GatewayError::InvalidRequest(_) | GatewayError::UnsupportedCapability { .. } => {
            "invalid_request_error"
        }
        GatewayError::UnknownModel { .. } => "not_found_error",
        GatewayError::NoAvailableAccount(_) => "overloaded_error",
        GatewayError::UpstreamStatus { status: 429, .. } => "rate_limit_error",
        _ => "api_error",
    };
    json!({
        "type": "error",
        "error": { "type": kind, "message": err.to_string() }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// Re-frames canonical chunks as Messages API stream events; ends with
/// `message_stop` or `error`.
pub struct ClaudeFramer {
    id: String,
    model: String,
    index: usize,
    open: Option<BlockKind>,
    pending_signature: Option<String>,
    stop_reason: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,
}

impl ClaudeFramer {
    pub fn new(model: &str) -> Self {
        Self {
            id: random_id("msg_"),
            model: model.to_string(),
            index: 0,
            open: None,
            pending_signature: None,
            stop_reason: None,
            usage: None,
            finished: false,
        }
    }

    pub fn start(&mut self) -> Vec<Bytes> {
        vec![sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            }),
        )]
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        let Some(kind) = self.open.take() else {
            return;
        };
        if kind == BlockKind::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                out.push(sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.index,
                        "delta": { "type": "signature_delta", "signature": signature }
                    }),
                ));
            }
        }
        out.push(sse_event(
            "content_block_stop",
            &json!({ "type": "content_block_stop", "index": self.index }),
        ));
        self.index += 1;
    }

    fn open_block(&mut self, kind: BlockKind, out: &mut Vec<Bytes>) {
        if self.open == Some(kind) {
            return;
        }
        self.close_block(out);
        let block = match kind {
            BlockKind::Text => json!({ "type": "text", "text": "" }),
            BlockKind::Thinking => json!({ "type": "thinking", "thinking": "" }),
        };
        out.push(sse_event(
            "content_block_start",
            &json!({ "type": "content_block_start", "index": self.index, "content_block": block }),
        ));
        self.open = Some(kind);
    }

    fn delta(&self, delta: Value) -> Bytes {
        sse_event(
            "content_block_delta",
            &json!({ "type": "content_block_delta", "index": self.index, "delta": delta }),
        )
    }

    pub fn chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        if chunk.finish_reason.is_some() {
            self.stop_reason = chunk.finish_reason.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let mut out = Vec::new();
        for part in &chunk.parts {
            match part {
                ChunkPart::Thought { text, signature } => {
                    self.open_block(BlockKind::Thinking, &mut out);
                    if !text.is_empty() {
                        out.push(self.delta(json!({ "type": "thinking_delta", "thinking": text })));
                    }
                    if signature.is_some() {
                        self.pending_signature = signature.clone();
                    }
                }
                ChunkPart::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.open_block(BlockKind::Text, &mut out);
                    out.push(self.delta(json!({ "type": "text_delta", "text": text })));
                }
                ChunkPart::Image { mime_type, data } => {
                    self.close_block(&mut out);
                    out.push(sse_event(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.index,
                            "content_block": image_block(mime_type, data)
                        }),
                    ));
                    out.push(sse_event(
                        "content_block_stop",
                        &json!({ "type": "content_block_stop", "index": self.index }),
                    ));
                    self.index += 1;
                }
            }
        }
        out
    }

    pub fn finish(&mut self, error: Option<&GatewayError>) -> Vec<Bytes> {
        if std::mem::replace(&mut self.finished, true) {
            return Vec::new();
        }
        if let Some(err) = error {
            return vec![sse_event("error", &error_body(err))];
        }

        let mut out = Vec::new();
        self.close_block(&mut out);
        let usage = self.usage.unwrap_or_default();
        out.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self
                        .stop_reason
                        .as_ref()
                        .map(FinishReason::as_anthropic)
                        .unwrap_or("end_turn"),
                    "stop_sequence": null
                },
                "usage": { "output_tokens": usage.output_tokens + usage.thoughts_tokens }
            }),
        ));
        out.push(sse_event("message_stop", &json!({ "type": "message_stop" })));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(frames: Vec<Bytes>) -> String {
        frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[test]
    fn parses_blocks_and_thinking() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 512,
            "system": [{"type": "text", "text": "sys"}],
            "thinking": {"type": "enabled", "budget_tokens": 4000},
            "stream": true,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "prior", "signature": "sig-abcdefghijk"},
                    {"type": "thinking", "thinking": "unsigned"},
                    {"type": "text", "text": "hello"}
                ]},
                {"role": "user", "content": [
                    {"type": "image", "source": {"type": "base64", "media_type": "image/gif", "data": "R0lG"}},
                    {"type": "tool_use", "id": "t", "name": "x", "input": {}}
                ]}
            ]
        });
        let req = parse_request(body).unwrap();
        assert!(req.stream);
        assert_eq!(req.thinking, Some(ThinkingRequest { budget: 4000 }));
        assert_eq!(req.system_instruction.unwrap()["parts"][0]["text"], "sys");
        assert_eq!(req.generation_config["maxOutputTokens"], 512);

        let assistant = &req.contents[1];
        assert_eq!(assistant["role"], "model");
        assert_eq!(assistant["parts"][0]["thought"], true);
        assert_eq!(assistant["parts"][1], json!({"text": "unsigned"}));
        let user = &req.contents[2];
        assert_eq!(user["parts"].as_array().unwrap().len(), 1);
        assert_eq!(user["parts"][0]["inlineData"]["mimeType"], "image/gif");
    }

    #[test]
    fn rejects_malformed_bodies() {
        assert!(matches!(
            parse_request(json!({"model": "claude-sonnet-4-5"})),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(parse_request(json!({"model": "", "messages": [{"role": "user", "content": "x"}]})).is_err());
    }

    #[test]
    fn response_merges_adjacent_parts() {
        let chunk = CanonicalChunk {
            parts: vec![
                ChunkPart::Thought { text: "a".into(), signature: None },
                ChunkPart::Thought { text: "b".into(), signature: Some("sig".into()) },
                ChunkPart::Text("x".into()),
                ChunkPart::Text("y".into()),
            ],
            finish_reason: Some(FinishReason::Stop),
            usage: Some(Usage { input_tokens: 4, output_tokens: 2, thoughts_tokens: 1 }),
        };
        let resp = format_response(&chunk, "claude-sonnet-4-5");
        assert_eq!(resp["content"].as_array().unwrap().len(), 2);
        assert_eq!(resp["content"][0]["thinking"], "ab");
        assert_eq!(resp["content"][0]["signature"], "sig");
        assert_eq!(resp["content"][1]["text"], "xy");
        assert_eq!(resp["stop_reason"], "end_turn");
        assert_eq!(resp["usage"]["output_tokens"], 3);
    }

    #[test]
    fn stream_event_order() {
        let mut framer = ClaudeFramer::new("claude-sonnet-4-5-thinking");
        let mut out = framer.start();
        out.extend(framer.chunk(&CanonicalChunk {
            parts: vec![ChunkPart::Thought { text: "think".into(), signature: Some("s1".into()) }],
            ..Default::default()
        }));
        out.extend(framer.chunk(&CanonicalChunk {
            parts: vec![ChunkPart::Text("Hi".into())],
            finish_reason: Some(FinishReason::MaxTokens),
            ..Default::default()
        }));
        out.extend(framer.finish(None));
        out.extend(framer.finish(None));
        let text = render(out);

        let order = [
            "event: message_start",
            r#""type":"thinking_delta""#,
            r#""type":"signature_delta""#,
            r#""index":0,"type":"content_block_stop""#,
            r#""type":"text_delta""#,
            r#""index":1,"type":"content_block_stop""#,
            r#""stop_reason":"max_tokens""#,
            "event: message_stop",
        ];
        let mut pos = 0;
        for needle in order {
            let found = text[pos..].find(needle).unwrap_or_else(|| panic!("missing {}", needle));
            pos += found + needle.len();
        }
        assert_eq!(text.matches("message_stop").count(), 2); // event name + type field
    }

    #[test]
    fn stream_error_replaces_message_stop() {
        let mut framer = ClaudeFramer::new("m");
        framer.start();
        framer.chunk(&CanonicalChunk {
            parts: vec![ChunkPart::Text("par".into())],
            ..Default::default()
        });
        let text = render(framer.finish(Some(&GatewayError::UpstreamStreamInterrupted("idle".into()))));
        assert!(text.starts_with("event: error"));
        assert!(!text.contains("message_stop"));
        assert!(framer.finish(None).is_empty());
    }

    #[test]
    fn overloaded_when_no_accounts() {
        let body = error_body(&GatewayError::NoAvailableAccount("empty".into()));
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "overloaded_error");
    }
}
