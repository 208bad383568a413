//! Error types for TULVA

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the pipeline
///
/// Only registration and setup errors surface to callers. Everything that
/// happens while streams are running is recovered locally and reported
/// through counters, logs and stream health.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Descriptor is missing required fields or is inconsistent
    #[error("invalid descriptor '{stream}': {reason}")]
    InvalidDescriptor { stream: String, reason: String },

    /// A stream with this name is already registered
    #[error("stream '{0}' is already registered")]
    DuplicateStream(String),

    /// No stream with this name is registered
    #[error("stream '{0}' is not registered")]
    UnknownStream(String),

    /// Shutdown has begun, no new registrations are accepted
    #[error("pipeline is shutting down")]
    ShuttingDown,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl PipelineError {
    pub(crate) fn invalid(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidDescriptor {
            stream: stream.into(),
            reason: reason.into(),
        }
    }
}

/// Error type for per-stream and per-plugin operations
///
/// These never escape the task that produced them.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Connection or request failed; retried with backoff
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote side closed the connection
    #[error("connection closed: {0}")]
    Closed(String),

    /// Raw payload could not be turned into data points
    #[error("parse error: {0}")]
    Parse(String),

    /// Deduplication cache could not be accessed
    #[error("dedup cache unavailable: {0}")]
    DedupCache(String),

    /// Subscriber or sink failed to accept an event
    #[error("publish failed: {0}")]
    Publish(String),

    /// Credentials could not be resolved
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Connection(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SourceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                SourceError::Closed(err.to_string())
            }
            other => SourceError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_descriptor_message() {
        let err = PipelineError::invalid("ticker", "endpoint is empty");
        assert_eq!(
            err.to_string(),
            "invalid descriptor 'ticker': endpoint is empty"
        );
    }

    #[test]
    fn test_serde_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let source_err: SourceError = err.into();
        assert!(matches!(source_err, SourceError::Serialization(_)));
    }
}
