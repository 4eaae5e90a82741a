// Mappers module
pub mod canonical;
pub mod claude;
pub mod gemini;
pub mod image;
pub mod openai;

use bytes::Bytes;
use serde_json::Value;

/// Named SSE event.
pub(crate) fn sse_event(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, data))
}

/// Anonymous SSE `data:` line.
pub(crate) fn sse_data(data: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

pub(crate) fn random_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Parse data URL to extract mime type and base64 data
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    // Format: data:image/png;base64,<data>
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.split(';').next().filter(|m| !m.is_empty());
    Some((
        mime.unwrap_or("application/octet-stream").to_string(),
        data.to_string(),
    ))
}
