//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'IRSX', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("envelope header too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the byte stream is still aligned on a frame boundary
    /// after this error, i.e. whether decoding may continue with the next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::CrcMismatch { .. } | ProtocolError::Envelope(_)
        )
    }
}

/// Stable error codes carried in error replies.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Session errors
    UnsupportedProtocol,
    BadRequest,

    // Serving-side failures
    HandlerFailed,
    HandlerPanicked,

    // Routing errors
    NoMembers,
    MemberLost,

    // System errors
    InternalError,
}

impl ErrorCode {
    /// Returns whether a request rejected with this code may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NoMembers | ErrorCode::MemberLost | ErrorCode::InternalError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::HandlerFailed => write!(f, "HANDLER_FAILED"),
            ErrorCode::HandlerPanicked => write!(f, "HANDLER_PANICKED"),
            ErrorCode::NoMembers => write!(f, "NO_MEMBERS"),
            ErrorCode::MemberLost => write!(f, "MEMBER_LOST"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}
