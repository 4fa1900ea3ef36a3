//! Message envelopes exchanged between clients and the relay.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::Frame;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection-scoped request identifier used for reply correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Reserved id for errors that do not belong to any request (handshake).
    pub const NONE: Self = Self(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error details carried by an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,
}

impl ReplyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Message envelope, serialized as JSON into the frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client -> relay: opens a session and joins `cluster`.
    Hello {
        protocol_version: u16,
        cluster: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_name: Option<String>,
    },

    /// Relay -> client: handshake accepted.
    Welcome { connection_id: String },

    /// A request addressed to a cluster. Payload carries the request body.
    Request {
        id: RequestId,
        cluster: String,
        timeout_ms: u64,
    },

    /// A successful reply. Payload carries the reply body.
    Reply { id: RequestId },

    /// A failed reply.
    ErrorReply { id: RequestId, error: ReplyError },

    /// Either side is closing the session.
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Envelope {
    /// Returns the correlation id, if this envelope carries one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Envelope::Request { id, .. } | Envelope::Reply { id } | Envelope::ErrorReply { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Welcome { .. } => "welcome",
            Envelope::Request { .. } => "request",
            Envelope::Reply { .. } => "reply",
            Envelope::ErrorReply { .. } => "error_reply",
            Envelope::Close { .. } => "close",
        }
    }
}

/// An envelope together with its application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub envelope: Envelope,
    pub payload: Bytes,
}

impl Message {
    pub fn new(envelope: Envelope, payload: Bytes) -> Self {
        Self { envelope, payload }
    }

    /// A message without payload.
    pub fn control(envelope: Envelope) -> Self {
        Self::new(envelope, Bytes::new())
    }

    pub fn hello(cluster: impl Into<String>, client_name: Option<String>) -> Self {
        Self::control(Envelope::Hello {
            protocol_version: crate::PROTOCOL_VERSION,
            cluster: cluster.into(),
            client_name,
        })
    }

    pub fn welcome(connection_id: impl Into<String>) -> Self {
        Self::control(Envelope::Welcome {
            connection_id: connection_id.into(),
        })
    }

    pub fn request(
        id: RequestId,
        cluster: impl Into<String>,
        timeout_ms: u64,
        payload: Bytes,
    ) -> Self {
        Self::new(
            Envelope::Request {
                id,
                cluster: cluster.into(),
                timeout_ms,
            },
            payload,
        )
    }

    pub fn reply(id: RequestId, payload: Bytes) -> Self {
        Self::new(Envelope::Reply { id }, payload)
    }

    pub fn error_reply(id: RequestId, error: ReplyError) -> Self {
        Self::control(Envelope::ErrorReply { id, error })
    }

    pub fn close(reason: Option<String>) -> Self {
        Self::control(Envelope::Close { reason })
    }

    /// Wraps the message into a frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let header = serde_json::to_vec(&self.envelope)?;
        Ok(Frame::new(Bytes::from(header), self.payload.clone()))
    }

    /// Parses the envelope out of a frame.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(&frame.header)?;
        Ok(Self::new(envelope, frame.payload))
    }
}
