//! Gateway error taxonomy
//!
//! One enum for every failure the gateway can report. Protocol adapters
//! render these into their own wire shapes; nothing outside this crate
//! sees the Rust type.

use axum::http::StatusCode;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("invalid or missing API key")]
    Unauthorized,

    #[error("model '{model}' is not supported over the {protocol} protocol: {reason}")]
    UnsupportedCapability {
        model: String,
        protocol: String,
        reason: String,
    },

    #[error("no available account: {0}")]
    NoAvailableAccount(String),

    #[error("upstream produced no response within {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream stream interrupted: {0}")]
    UpstreamStreamInterrupted(String),

    #[error("malformed upstream response: {0}")]
    UpstreamProtocolError(String),

    #[error("unknown model '{model}': {message}")]
    UnknownModel { model: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream returned HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("upstream unreachable: {0}")]
    UpstreamUnavailable(String),

    #[error("config store error: {0}")]
    Persistence(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status used on the data plane.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidConfig(_) | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PortInUse(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UnsupportedCapability { .. } | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoAvailableAccount(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamStreamInterrupted(_)
            | Self::UpstreamProtocolError(_)
            | Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UnknownModel { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Stable snake_case name, used as the OpenAI `code` field and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::PortInUse(_) => "port_in_use",
            Self::Unauthorized => "unauthorized",
            Self::UnsupportedCapability { .. } => "unsupported_capability",
            Self::NoAvailableAccount(_) => "no_available_account",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamStreamInterrupted(_) => "upstream_stream_interrupted",
            Self::UpstreamProtocolError(_) => "upstream_protocol_error",
            Self::UnknownModel { .. } => "unknown_model",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UpstreamStatus { .. } => "upstream_error",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Persistence(_) => "persistence_error",
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_propagated() {
        let err = GatewayError::UpstreamStatus {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let bogus = GatewayError::UpstreamStatus {
            status: 42,
            message: String::new(),
        };
        assert_eq!(bogus.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn pool_exhaustion_is_503() {
        let err = GatewayError::NoAvailableAccount("pool is empty".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "no_available_account");
    }
}
