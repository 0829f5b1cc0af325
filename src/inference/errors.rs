//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors raised by the provider registry and model handles.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// No provider is registered under the requested name.
    #[error("unknown provider: '{name}' (available: {})", available.join(", "))]
    UnknownProvider {
        name: String,
        available: Vec<String>,
    },

    /// The provider rejected the supplied configuration before construction.
    #[error("provider '{provider}' configuration invalid: {reason}")]
    ProviderConfigError { provider: String, reason: String },

    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The endpoint answered but the body could not be interpreted.
    #[error("response parse error: {reason}")]
    ResponseParseError { reason: String },

    /// A streamed response broke off or carried a malformed chunk.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// Configuration loading or plugin manifest error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether this error was raised before any model construction took place.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            InferenceError::UnknownProvider { .. } | InferenceError::ProviderConfigError { .. }
        )
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_lists_available() {
        let err = InferenceError::UnknownProvider {
            name: "nope".into(),
            available: vec!["ollama".into(), "openai".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown provider: 'nope' (available: ollama, openai)"
        );
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_transport_errors_are_not_construction_errors() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(!err.is_construction_error());
        let err = InferenceError::StreamError {
            reason: "connection reset".into(),
        };
        assert_eq!(err.to_string(), "stream error: connection reset");
        assert!(!err.is_construction_error());
    }
}
