//! Relay error types.

use iris_protocol::ErrorCode;
use thiserror::Error;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] iris_protocol::ProtocolError),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("relay shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RelayError::Io(_) => ErrorCode::InternalError,
            RelayError::Protocol(_) => ErrorCode::BadRequest,
            RelayError::HandshakeFailed(_) => ErrorCode::BadRequest,
            RelayError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            RelayError::InvalidRequest(_) => ErrorCode::BadRequest,
            RelayError::ShuttingDown => ErrorCode::InternalError,
        }
    }
}
