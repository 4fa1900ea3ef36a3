//! Client error types.

use iris_protocol::{ErrorCode, RequestId};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] iris_protocol::ProtocolError),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("failed to send frame: {0}")]
    Send(std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("timeout must be greater than zero")]
    InvalidTimeout,

    #[error("request id {0} is already pending")]
    DuplicateRequest(RequestId),

    #[error("remote error: {code} - {message}")]
    Application { code: ErrorCode, message: String },
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Send(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectTimeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Application { code, .. } => code.is_retryable(),
            _ => false,
        }
    }
}
