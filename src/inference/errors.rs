//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to
//! build meaningful log entries.

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The model endpoint did not respond within the deadline.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// The turn was cancelled while waiting for the model.
    #[error("inference cancelled")]
    Cancelled,

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// The endpoint answered 2xx but the body was not a usable completion.
    #[error("malformed completion: {reason}")]
    MalformedResponse {
        reason: String,
    },

    /// Every model in the fallback chain failed.
    #[error("all models unavailable (tried: {}): {last_error}", .attempted.join(", "))]
    AllModelsUnavailable {
        attempted: Vec<String>,
        last_error: String,
    },

    /// Model configuration is unusable.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::ConfigError { .. } => ErrorKind::ConfigError,
            _ => ErrorKind::LlmError,
        }
    }

    /// Whether an error should move on to the next model in the chain.
    ///
    /// HTTP 404 is included because self-hosted runtimes return 404 for a
    /// model that is not installed; the next model may still be available.
    /// HTTP 500 covers transient generation failures (e.g. malformed tool
    /// call JSON from the model).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 404, .. }
                | InferenceError::HttpError { status: 500, .. }
                | InferenceError::HttpError { status: 502..=504, .. }
        )
    }

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
    fn test_is_retriable() {
        assert!(InferenceError::ConnectionFailed {
            endpoint: "".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(InferenceError::Timeout { duration_secs: 5 }.is_retriable());
        assert!(InferenceError::HttpError {
            status: 404,
            body: "model not found".into()
        }
        .is_retriable());
        assert!(InferenceError::HttpError {
            status: 503,
            body: "".into()
        }
        .is_retriable());
        assert!(!InferenceError::HttpError {
            status: 400,
            body: "".into()
        }
        .is_retriable());
        assert!(!InferenceError::Cancelled.is_retriable());
        assert!(!InferenceError::MalformedResponse { reason: "".into() }.is_retriable());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(InferenceError::Cancelled.kind(), ErrorKind::LlmError);
        assert_eq!(
            InferenceError::ConfigError { reason: "x".into() }.kind(),
            ErrorKind::ConfigError
        );
    }

    #[test]
    fn test_error_body() {
        let err = InferenceError::HttpError {
            status: 500,
            body: "test body".to_string(),
        };
        assert_eq!(err.error_body(), Some("test body"));
        assert!(InferenceError::Timeout { duration_secs: 5 }.error_body().is_none());
    }

    #[test]
    fn test_all_models_unavailable_message() {
        let err = InferenceError::AllModelsUnavailable {
            attempted: vec!["a".into(), "b".into()],
            last_error: "HTTP 503: busy".into(),
        };
        assert_eq!(err.to_string(), "all models unavailable (tried: a, b): HTTP 503: busy");
    }
}
