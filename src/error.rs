use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exception classes the remote service can report inside the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ServiceErrorKind {
    ValidationException,
    ModelStreamErrorException,
    InternalServerException,
    ThrottlingException,
    ModelTimeoutException,
    ServiceUnavailableException,
    #[serde(other)]
    Unknown,
}

impl ServiceErrorKind {
    /// Top-level frame keys that carry a service exception.
    pub const FRAME_KEYS: [&'static str; 6] = [
        "validationException",
        "modelStreamErrorException",
        "internalServerException",
        "throttlingException",
        "modelTimeoutException",
        "serviceUnavailableException",
    ];

    #[must_use]
    pub fn from_frame_key(key: &str) -> Self {
        match key {
            "validationException" => Self::ValidationException,
            "modelStreamErrorException" => Self::ModelStreamErrorException,
            "internalServerException" => Self::InternalServerException,
            "throttlingException" => Self::ThrottlingException,
            "modelTimeoutException" => Self::ModelTimeoutException,
            "serviceUnavailableException" => Self::ServiceUnavailableException,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Remote stream rejected a frame: {0}")]
    Validation(String),

    #[error("Remote service error: {0:?}")]
    Service(ServiceError),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("Session is not active")]
    SessionInactive,

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Tool '{0}' timed out")]
    ToolTimeout(String),

    #[error("Invalid client event: {0}")]
    InvalidClientEvent(String),

    #[error("Audio queue is full")]
    Backpressure,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Faults that end the session: broken transport or a rejected frame.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::ConnectionClosed | Self::Validation(_))
    }

    pub(crate) fn from_service(error: ServiceError) -> Self {
        match error.kind {
            ServiceErrorKind::ValidationException => Self::Validation(error.message),
            _ => Self::Service(error),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_exception_is_fatal() {
        let err = Error::from_service(ServiceError {
            kind: ServiceErrorKind::from_frame_key("validationException"),
            message: "bad frame".to_string(),
        });
        assert!(matches!(err, Error::Validation(ref msg) if msg == "bad frame"));
        assert!(err.is_fatal());
    }

    #[test]
    fn throttling_is_absorbed() {
        let err = Error::from_service(ServiceError {
            kind: ServiceErrorKind::ThrottlingException,
            message: "slow down".to_string(),
        });
        assert!(!err.is_fatal());
        assert!(!Error::Tool { tool: "x".into(), message: "boom".into() }.is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
    }
}
