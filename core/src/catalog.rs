//! Static model catalog
//!
//! Reference data only. The gateway reads it to decide pass-through,
//! thinking variants and per-protocol availability.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire protocol a client speaks to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::OpenAi, Protocol::Anthropic, Protocol::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!("Unknown protocol: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelCatalogEntry {
    pub id: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub supported_protocols: &'static [Protocol],
}

impl ModelCatalogEntry {
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.supported_protocols.contains(&protocol)
    }
}

const ALL_PROTOCOLS: &[Protocol] = &[Protocol::OpenAi, Protocol::Anthropic, Protocol::Gemini];
const NO_ANTHROPIC: &[Protocol] = &[Protocol::OpenAi, Protocol::Gemini];

pub static MODEL_CATALOG: &[ModelCatalogEntry] = &[
    // Gemini 3
    ModelCatalogEntry {
        id: "gemini-3-flash",
        display_name: "Gemini 3 Flash",
        description: "Fast preview model",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "gemini-3-pro-high",
        display_name: "Gemini 3 Pro (High)",
        description: "Highest quality reasoning",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "gemini-3-pro-low",
        display_name: "Gemini 3 Pro (Low)",
        description: "Balanced quality and latency",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "gemini-3-pro-image",
        display_name: "Gemini 3 Pro Image",
        description: "Image generation, 1:1 by default",
        supported_protocols: NO_ANTHROPIC,
    },
    // Gemini 2.5
    ModelCatalogEntry {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        description: "Fast general purpose model",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        description: "Lowest latency",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        description: "Previous generation pro model",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "gemini-2.5-flash-thinking",
        display_name: "Gemini 2.5 Flash (Thinking)",
        description: "Flash with extended thinking",
        supported_protocols: ALL_PROTOCOLS,
    },
    // Claude 4.5
    ModelCatalogEntry {
        id: "claude-sonnet-4-5",
        display_name: "Claude 4.5 Sonnet",
        description: "Balanced Claude model",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "claude-sonnet-4-5-thinking",
        display_name: "Claude 4.5 Sonnet (Thinking)",
        description: "Sonnet with extended thinking",
        supported_protocols: ALL_PROTOCOLS,
    },
    ModelCatalogEntry {
        id: "claude-opus-4-5-thinking",
        display_name: "Claude 4.5 Opus (Thinking)",
        description: "Most capable Claude model with extended thinking",
        supported_protocols: ALL_PROTOCOLS,
    },
];

pub fn find(id: &str) -> Option<&'static ModelCatalogEntry> {
    MODEL_CATALOG.iter().find(|m| m.id == id)
}

pub fn is_known(id: &str) -> bool {
    find(id).is_some()
}

/// Whether the id names an image-generation model.
pub fn has_image_capability(id: &str) -> bool {
    id.to_ascii_lowercase().contains("image")
}

pub fn is_thinking_model(id: &str) -> bool {
    id.ends_with("-thinking")
}

/// The catalog's distinct thinking target for `id`, if it has one.
pub fn thinking_variant(id: &str) -> Option<&'static str> {
    if is_thinking_model(id) {
        return find(id).map(|m| m.id);
    }
    let wanted = format!("{}-thinking", id);
    find(&wanted).map(|m| m.id)
}

pub fn models_for(protocol: Protocol) -> impl Iterator<Item = &'static ModelCatalogEntry> {
    MODEL_CATALOG.iter().filter(move |m| m.supports(protocol))
}
