use std::time::Duration;

use crate::schema::ids::OwnerId;

/// Failure of a single generator call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("empty response")]
    EmptyResponse,
}

impl GenerationError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::MalformedResponse(_) => "malformed_response",
            Self::EmptyResponse => "empty_response",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Server { status, body },
            _ => Self::InvalidRequest(format!("HTTP {status}: {body}")),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialsError {
    #[error("no generation credentials configured for owner {0}")]
    Missing(OwnerId),
}
