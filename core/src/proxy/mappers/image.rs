//! Output geometry for the image generation model
//!
//! The geometry comes from either an OpenAI `size` value or an aspect-ratio
//! suffix on the model id (`gemini-3-pro-image-16-9`). When both are given
//! they must agree.

use crate::error::{GatewayError, GatewayResult};

pub const IMAGE_MODEL: &str = "gemini-3-pro-image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Square,
    Landscape,
    Portrait,
    Classic,
}

impl AspectRatio {
    const ALL: [AspectRatio; 4] = [
        AspectRatio::Square,
        AspectRatio::Landscape,
        AspectRatio::Portrait,
        AspectRatio::Classic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Classic => "4:3",
        }
    }

    pub fn size(self) -> &'static str {
        match self {
            AspectRatio::Square => "1024x1024",
            AspectRatio::Landscape => "1280x720",
            AspectRatio::Portrait => "720x1280",
            AspectRatio::Classic => "1216x896",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            AspectRatio::Square => "-1-1",
            AspectRatio::Landscape => "-16-9",
            AspectRatio::Portrait => "-9-16",
            AspectRatio::Classic => "-4-3",
        }
    }

    /// Parse a ratio written as `16:9`.
    pub fn from_ratio(ratio: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == ratio.trim())
    }

    pub fn from_size(size: &str) -> GatewayResult<Self> {
        let size = size.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.size() == size)
            .ok_or_else(|| {
                let allowed: Vec<_> = Self::ALL.iter().map(|r| r.size()).collect();
                GatewayError::InvalidRequest(format!(
                    "unsupported image size '{}', expected one of {}",
                    size,
                    allowed.join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGeometry {
    pub model: String,
    pub aspect_ratio: AspectRatio,
}

pub fn is_image_model(model: &str) -> bool {
    model.starts_with(IMAGE_MODEL)
}

/// Work out the upstream model and aspect ratio for an image request.
pub fn resolve_geometry(model: &str, size: Option<&str>) -> GatewayResult<ImageGeometry> {
    let rest = model.strip_prefix(IMAGE_MODEL).ok_or_else(|| {
        GatewayError::InvalidRequest(format!("'{}' is not an image model", model))
    })?;

    let from_suffix = if rest.is_empty() {
        None
    } else {
        let ratio = AspectRatio::ALL
            .into_iter()
            .find(|r| r.suffix() == rest)
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "unsupported aspect-ratio suffix '{}' on '{}'",
                    rest, model
                ))
            })?;
        Some(ratio)
    };
    let from_size = size
        .filter(|s| !s.trim().is_empty())
        .map(AspectRatio::from_size)
        .transpose()?;

    let aspect_ratio = match (from_suffix, from_size) {
        (Some(a), Some(b)) if a != b => {
            return Err(GatewayError::InvalidRequest(format!(
                "size {} conflicts with model suffix {} ({})",
                b.size(),
                rest,
                a.as_str()
            )));
        }
        (Some(r), _) | (None, Some(r)) => r,
        (None, None) => AspectRatio::Square,
    };

    Ok(ImageGeometry {
        model: IMAGE_MODEL.to_string(),
        aspect_ratio,
    })
}
