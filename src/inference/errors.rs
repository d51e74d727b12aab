//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility. These types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to a model provider.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Failed to parse a tool call from the model's response.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError {
        raw_response: String,
        reason: String,
    },

    /// The requested model name is not in the registry.
    #[error("unknown model: {name}")]
    UnknownModel {
        name: String,
    },

    /// The model is registered but not usable (missing endpoint or key).
    #[error("model {name} is unavailable: {reason}")]
    ModelUnavailable {
        name: String,
        reason: String,
    },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// Stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_http_error() {
        let err = InferenceError::HttpError {
            status: 500,
            body: "test body".to_string(),
        };
        assert_eq!(err.error_body(), Some("test body"));
    }

    #[test]
    fn test_error_body_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.error_body().is_none());
    }

    #[test]
    fn test_unavailable_display_names_model() {
        let err = InferenceError::ModelUnavailable {
            name: "deepseek-chat".into(),
            reason: "api_key is not set".into(),
        };
        assert_eq!(
            err.to_string(),
            "model deepseek-chat is unavailable: api_key is not set"
        );
    }
}
