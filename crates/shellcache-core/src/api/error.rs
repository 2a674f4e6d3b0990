use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error. Please check your connection and try again.")]
    Network(String),

    #[error("Session expired. Please log in again.")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Internal server error. Please try again later.")]
    Server { status: u16, body: String },

    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("File error: {0}")]
    File(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

const FORBIDDEN_MESSAGE: &str = "You do not have permission to perform this action";
const NOT_FOUND_MESSAGE: &str = "Resource not found";

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

    /// Classify a non-success response.
    pub fn from_status(status: u16, retry_after: Option<&str>, body: &str) -> Self {
        match status {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden(FORBIDDEN_MESSAGE.to_string()),
            404 => ApiError::NotFound(NOT_FOUND_MESSAGE.to_string()),
            429 => ApiError::RateLimited {
                retry_after_secs: retry_after.and_then(|s| s.trim().parse().ok()),
            },
            500..=599 => ApiError::Server {
                status,
                body: Self::truncate_body(body),
            },
            _ => {
                let message = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .map(|m| Self::truncate_body(&m))
                    .unwrap_or_else(|| format!("Request failed with status {}", status));
                ApiError::Status { status, message }
            }
        }
    }

    /// HTTP status behind this error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized => Some(401),
            ApiError::Forbidden(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited { .. } => Some(429),
            ApiError::Server { status, .. } | ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Network failures, rate limiting and server errors may succeed on a
    /// later attempt. Nothing else is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_) | ApiError::RateLimited { .. } | ApiError::Server { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::File(e.to_string())
    }
}
