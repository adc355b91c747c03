//! Error types for chunked uploads.

use std::sync::Arc;

/// Errors produced by a [`Transport`](crate::Transport) exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("exchange timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Errors surfaced by the [`Uploader`](crate::Uploader) API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("file not found: {0}")]
    UnknownFile(uuid::Uuid),

    #[error("uploader is shut down")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("preprocessing failed: {0}")]
    Preprocess(String),
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
