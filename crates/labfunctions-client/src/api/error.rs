use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Cloneable so one failed refresh can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Credentials not found in {home} (tried: {tried})")]
    CredentialsNotFound { home: PathBuf, tried: String },

    #[error("Token refresh rejected: {0}")]
    AuthValidationFailed(String),

    #[error("Login failed for user {username} at {service}")]
    LoginError { service: String, username: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[source] Arc<reqwest::Error>),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Event stream closed before the exit signal (last event id: {last_event_id:?})")]
    StreamClosed { last_event_id: Option<String> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No project configured for this client")]
    MissingProject,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::NetworkError(Arc::new(err))
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Wrap a reqwest failure, reporting elapsed deadlines as `Timeout`.
    pub fn from_reqwest(err: reqwest::Error, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(limit) if err.is_timeout() => ApiError::Timeout(limit),
            _ => ApiError::NetworkError(Arc::new(err)),
        }
    }

    /// True when the caller has to log in again before retrying.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ApiError::CredentialsNotFound { .. }
                | ApiError::AuthValidationFailed(_)
                | ApiError::Unauthorized
        )
    }
}
