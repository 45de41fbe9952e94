// src/error.rs
//! Error taxonomy shared by the ingestion pipeline.
//!
//! None of these are allowed to escape a component's run loop; they are
//! logged and turned into the next state transition (reject, skip, back off).

use thiserror::Error;

/// Malformed or incomplete item. Rejected, logged, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unparseable published timestamp '{0}'")]
    BadTimestamp(String),
}

/// Why the bus refused a publish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid item: {0}")]
    Invalid(#[from] ValidationError),
    #[error("rate limit exhausted for source '{0}'")]
    RateLimited(String),
    #[error("duplicate item id '{0}'")]
    Duplicate(String),
}

impl Rejection {
    /// Short label used for metrics and stats keys.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::Invalid(_) => "invalid",
            Rejection::RateLimited(_) => "rate_limited",
            Rejection::Duplicate(_) => "duplicate",
        }
    }
}

/// Webhook authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,
    #[error("malformed signature")]
    Malformed,
    #[error("invalid signature")]
    Mismatch,
}

/// Connection-level failure. Drives adapter or host backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("unsupported vendor '{0}'")]
    Unsupported(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Fatal errors stop the adapter supervisor instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Unsupported(_) | TransportError::InvalidConfig(_)
        )
    }
}

/// Malformed upstream content. The entry/message is skipped, siblings continue.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("xml: {0}")]
    Xml(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("body is not valid utf-8: {0}")]
    Encoding(String),
    #[error("unrecognized document: {0}")]
    Unrecognized(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_labels_are_stable() {
        assert_eq!(
            Rejection::Invalid(ValidationError::MissingField("title")).label(),
            "invalid"
        );
        assert_eq!(Rejection::RateLimited("x".into()).label(), "rate_limited");
        assert_eq!(Rejection::Duplicate("x".into()).label(), "duplicate");
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(TransportError::Unsupported("bloomberg".into()).is_fatal());
        assert!(TransportError::InvalidConfig("no host".into()).is_fatal());
        assert!(!TransportError::Closed.is_fatal());
        assert!(!TransportError::Timeout(std::time::Duration::from_secs(1)).is_fatal());
    }
}
