//! Client error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    /// A connection was requested before `connect` created one.
    #[error("connection not initialized; call connect() after login")]
    NotInitialized,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("http_{status}:{body}")]
    Http { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// True for failures caused by reaching the backend rather than by what it said.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_)
                | Self::Connection(_)
                | Self::Timeout(_)
                | Self::NotConnected
                | Self::Request(_)
                | Self::Io(_)
        )
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
