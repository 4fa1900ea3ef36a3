//! # iris-protocol
//!
//! Wire protocol spoken between iris clients and the relay.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON message envelopes with raw binary payloads
//! - Request/reply correlation identifiers
//! - Error codes and protocol constants

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Envelope, Message, ReplyError, RequestId};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the relay.
pub const DEFAULT_PORT: u16 = 55555;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
