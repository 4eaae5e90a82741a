//! Protocol-neutral request and response shapes
//!
//! Requests are held in the Gemini `generateContent` content model; that is
//! also what the upstream speaks, so planning a call is mostly a matter of
//! fixing the model and generation config.

use serde_json::{json, Map, Value};

use crate::catalog;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::mappers::image;

pub const DEFAULT_THINKING_BUDGET: i64 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingRequest {
    pub budget: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRequest {
    /// Model id as the client sent it.
    pub model: String,
    pub contents: Vec<Value>,
    pub system_instruction: Option<Value>,
    pub generation_config: Map<String, Value>,
    /// Gemini-native fields forwarded untouched (tools, toolConfig, safetySettings).
    pub passthrough: Map<String, Value>,
    pub stream: bool,
    pub thinking: Option<ThinkingRequest>,
    /// OpenAI `size` for image generation.
    pub image_size: Option<String>,
}

/// A fully resolved upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCall {
    pub model: String,
    pub request: Value,
    pub request_type: &'static str,
    pub stream: bool,
}

impl UpstreamCall {
    pub fn method(&self) -> &'static str {
        if self.stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        }
    }

    pub fn query(&self) -> Option<&'static str> {
        self.stream.then_some("alt=sse")
    }

    /// Wrap the request in the v1internal envelope.
    pub fn envelope(&self, project: Option<&str>, user_agent: &str) -> Value {
        let mut body = json!({
            "requestId": format!("agent-{}", uuid::Uuid::new_v4().simple()),
            "request": self.request,
            "model": self.model,
            "userAgent": user_agent,
            "requestType": self.request_type,
        });
        if let Some(project) = project.filter(|p| !p.is_empty()) {
            body["project"] = json!(project);
        }
        body
    }
}

/// Turn a parsed request plus its resolved target into an upstream call.
pub fn plan(req: &CanonicalRequest, target: &str) -> GatewayResult<UpstreamCall> {
    let mut generation_config = req.generation_config.clone();
    generation_config.remove("thinkingConfig");
    generation_config.remove("imageConfig");

    let mut model = target.to_string();
    let mut request_type = "agent";

    if image::is_image_model(target) {
        let geometry = image::resolve_geometry(target, req.image_size.as_deref())?;
        model = geometry.model;
        request_type = "image_gen";
        generation_config.insert(
            "imageConfig".to_string(),
            json!({ "aspectRatio": geometry.aspect_ratio.as_str() }),
        );
    } else {
        if req.thinking.is_some() {
            if let Some(variant) = catalog::thinking_variant(&model) {
                model = variant.to_string();
            }
        }
        // Non-thinking targets never see a thinking flag.
        if catalog::is_thinking_model(&model) {
            let budget = req
                .thinking
                .map(|t| t.budget)
                .unwrap_or(DEFAULT_THINKING_BUDGET);
            generation_config.insert(
                "thinkingConfig".to_string(),
                json!({
                    "includeThoughts": req.thinking.is_some(),
                    "thinkingBudget": budget,
                }),
            );
            if let Some(max) = generation_config
                .get("maxOutputTokens")
                .and_then(Value::as_i64)
            {
                if max <= budget {
                    generation_config
                        .insert("maxOutputTokens".to_string(), json!(budget + max));
                }
            }
        }
    }

    let mut request = Map::new();
    request.insert("contents".to_string(), Value::Array(req.contents.clone()));
    if let Some(system) = &req.system_instruction {
        request.insert("systemInstruction".to_string(), system.clone());
    }
    if !generation_config.is_empty() {
        request.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }
    for (key, value) in &req.passthrough {
        request.entry(key.clone()).or_insert_with(|| value.clone());
    }
    request
        .entry("safetySettings".to_string())
        .or_insert_with(default_safety_settings);

    Ok(UpstreamCall {
        model,
        request: Value::Object(request),
        request_type,
        stream: req.stream,
    })
}

fn default_safety_settings() -> Value {
    json!([
        { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "OFF" }
    ])
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPart {
    Text(String),
    Thought {
        text: String,
        signature: Option<String>,
    },
    Image {
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Other(String),
}

impl FinishReason {
    pub fn from_gemini(raw: &str) -> Self {
        match raw {
            "STOP" => Self::Stop,
            "MAX_TOKENS" => Self::MaxTokens,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => Self::Safety,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_gemini(&self) -> &str {
        match self {
            Self::Stop => "STOP",
            Self::MaxTokens => "MAX_TOKENS",
            Self::Safety => "SAFETY",
            Self::Other(raw) => raw,
        }
    }

    pub fn as_openai(&self) -> &'static str {
        match self {
            Self::MaxTokens => "length",
            Self::Safety => "content_filter",
            Self::Stop | Self::Other(_) => "stop",
        }
    }

    pub fn as_anthropic(&self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::Safety => "refusal",
            Self::Stop | Self::Other(_) => "end_turn",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thoughts_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.thoughts_tokens
    }

    pub fn to_gemini(self) -> Value {
        json!({
            "promptTokenCount": self.input_tokens,
            "candidatesTokenCount": self.output_tokens,
            "thoughtsTokenCount": self.thoughts_tokens,
            "totalTokenCount": self.total(),
        })
    }
}

/// One upstream response, or one event of an upstream stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalChunk {
    pub parts: Vec<ChunkPart>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl CanonicalChunk {
    /// Read a Gemini response, unwrapping the v1internal `response` field.
    pub fn from_gemini(raw: &Value) -> GatewayResult<Self> {
        let resp = raw.get("response").unwrap_or(raw);
        if !resp.is_object() {
            return Err(GatewayError::UpstreamProtocolError(format!(
                "expected a JSON object, got {}",
                truncate(&resp.to_string())
            )));
        }
        if let Some(error) = resp.get("error") {
            let status = error
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(502);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string();
            return Err(GatewayError::UpstreamStatus { status, message });
        }

        let candidate = resp.get("candidates").and_then(|c| c.get(0));
        let mut chunk = CanonicalChunk::default();

        if let Some(parts) = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(parsed) = parse_part(part) {
                    chunk.parts.push(parsed);
                }
            }
        }

        chunk.finish_reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
            .map(FinishReason::from_gemini);

        chunk.usage = resp.get("usageMetadata").map(|u| {
            let count = |key: &str| u.get(key).and_then(Value::as_u64).unwrap_or(0);
            Usage {
                input_tokens: count("promptTokenCount"),
                output_tokens: count("candidatesTokenCount"),
                thoughts_tokens: count("thoughtsTokenCount"),
            }
        });

        Ok(chunk)
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ChunkPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn thoughts(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ChunkPart::Thought { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn parse_part(part: &Value) -> Option<ChunkPart> {
    let signature = part
        .get("thoughtSignature")
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);

    if let Some(inline) = part.get("inlineData") {
        return Some(ChunkPart::Image {
            mime_type: inline
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string(),
            data: inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let text = part.get("text").and_then(Value::as_str);
    match (text, is_thought) {
        (Some(text), true) => Some(ChunkPart::Thought {
            text: text.to_string(),
            signature,
        }),
        (None, _) if signature.is_some() => Some(ChunkPart::Thought {
            text: String::new(),
            signature,
        }),
        (Some(text), false) => Some(ChunkPart::Text(text.to_string())),
        (None, _) => None,
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str) -> CanonicalRequest {
        CanonicalRequest {
            model: model.to_string(),
            contents: vec![json!({"role": "user", "parts": [{"text": "hi"}]})],
            ..Default::default()
        }
    }

    #[test]
    fn plain_target_gets_no_thinking_config() {
        let mut req = request("gpt-4");
        req.generation_config
            .insert("thinkingConfig".into(), json!({"thinkingBudget": 100}));
        let call = plan(&req, "gemini-3-pro-high").unwrap();
        assert_eq!(call.model, "gemini-3-pro-high");
        assert_eq!(call.request_type, "agent");
        assert!(call.request["generationConfig"].get("thinkingConfig").is_none());
        assert_eq!(call.request["safetySettings"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn thinking_routes_to_distinct_variant() {
        let mut req = request("claude-sonnet-4-5");
        req.thinking = Some(ThinkingRequest { budget: 2048 });
        req.generation_config
            .insert("maxOutputTokens".into(), json!(1024));
        let call = plan(&req, "claude-sonnet-4-5").unwrap();
        assert_eq!(call.model, "claude-sonnet-4-5-thinking");
        let cfg = &call.request["generationConfig"];
        assert_eq!(cfg["thinkingConfig"]["thinkingBudget"], 2048);
        assert_eq!(cfg["thinkingConfig"]["includeThoughts"], true);
        assert_eq!(cfg["maxOutputTokens"], 3072);
    }

    #[test]
    fn thinking_without_variant_is_dropped() {
        let mut req = request("gemini-3-flash");
        req.thinking = Some(ThinkingRequest { budget: 1024 });
        let call = plan(&req, "gemini-3-flash").unwrap();
        assert_eq!(call.model, "gemini-3-flash");
        assert!(call.request.get("generationConfig").is_none());
    }

    #[test]
    fn image_target_sets_geometry() {
        let mut req = request("gemini-3-pro-image-16-9");
        req.image_size = Some("1280x720".into());
        let call = plan(&req, "gemini-3-pro-image-16-9").unwrap();
        assert_eq!(call.model, "gemini-3-pro-image");
        assert_eq!(call.request_type, "image_gen");
        assert_eq!(
            call.request["generationConfig"]["imageConfig"]["aspectRatio"],
            "16:9"
        );
    }

    #[test]
    fn envelope_wraps_request() {
        let mut req = request("x");
        req.stream = true;
        let call = plan(&req, "gemini-3-flash").unwrap();
        assert_eq!(call.method(), "streamGenerateContent");
        assert_eq!(call.query(), Some("alt=sse"));
        let env = call.envelope(Some("proj-1"), "modelgate/test");
        assert_eq!(env["project"], "proj-1");
        assert_eq!(env["model"], "gemini-3-flash");
        assert_eq!(env["requestType"], "agent");
        assert!(env["requestId"].as_str().unwrap().starts_with("agent-"));
        assert!(call.envelope(None, "ua").get("project").is_none());
    }

    #[test]
    fn reads_wrapped_response() {
        let raw = json!({"response": {
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true, "thoughtSignature": "sig-123"},
                    {"text": "Hello"},
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
                ]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 5}
        }});
        let chunk = CanonicalChunk::from_gemini(&raw).unwrap();
        assert_eq!(chunk.text(), "Hello");
        assert_eq!(chunk.thoughts(), "pondering");
        assert_eq!(chunk.parts.len(), 3);
        assert_eq!(chunk.finish_reason, Some(FinishReason::MaxTokens));
        assert_eq!(chunk.usage.unwrap().total(), 8);
    }

    #[test]
    fn malformed_and_error_payloads() {
        assert!(matches!(
            CanonicalChunk::from_gemini(&json!("nope")),
            Err(GatewayError::UpstreamProtocolError(_))
        ));
        let err = CanonicalChunk::from_gemini(&json!({"error": {"code": 500, "message": "boom"}}))
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::UpstreamStatus {
                status: 500,
                message: "boom".into()
            }
        );
    }
}
