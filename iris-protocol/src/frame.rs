//! Binary frame format for the relay protocol.
//!
//! Frame layout (18 bytes fixed header + envelope header + payload):
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | header_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | header       | payload                                        |
//! | header_len   | payload_len bytes                              |
//! +--------------+------------------------------------------------+
//! ```
//!
//! The header holds the JSON message envelope, the payload holds the raw
//! application bytes. The CRC covers both.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying relay frames: "IRSX"
pub const MAGIC: [u8; 4] = *b"IRSX";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u16 = 0x0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed relay frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol version.
    pub version: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Encoded message envelope.
    pub header: Bytes,
    /// Application payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given envelope header and payload.
    pub fn new(header: Bytes, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            header,
            payload,
        }
    }

    fn checksum(header: &[u8], payload: &[u8]) -> u32 {
        crc32c::crc32c_append(crc32c::crc32c(header), payload)
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len() as u32;
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.header.len() > u16::MAX as usize {
            return Err(ProtocolError::HeaderTooLarge(self.header.len()));
        }

        let header_len = self.header.len() as u16;
        let total_size = FRAME_HEADER_SIZE + self.header.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(total_size);

        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(header_len);
        buf.put_u32(payload_len);

        let crc = if self.flags.has_crc() {
            Self::checksum(&self.header, &self.payload)
        } else {
            0
        };
        buf.put_u32(crc);

        buf.put_slice(&self.header);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// A CRC mismatch consumes the offending frame so the caller may keep
    /// decoding; every other error leaves the buffer untouched.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let header_len = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let payload_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);

        let total_len = FRAME_HEADER_SIZE + header_len + payload_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let header = buf.split_to(header_len).freeze();
        let payload = buf.split_to(payload_len).freeze();

        if flags.has_crc() {
            let crc_actual = Self::checksum(&header, &payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            header,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(header: &'static str, payload: &'static [u8]) -> Frame {
        Frame::new(Bytes::from_static(header.as_bytes()), Bytes::from_static(payload))
    }

    #[test]
    fn test_frame_roundtrip() {
        let original = frame(r#"{"type":"reply","id":7}"#, b"\x00\x01binary\xff");

        let mut buf = original.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.version, crate::PROTOCOL_VERSION);
        assert!(decoded.flags.has_crc());
        assert_eq!(decoded.header, original.header);
        assert_eq!(decoded.payload, original.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_covers_payload() {
        let mut encoded = frame(r#"{"type":"reply","id":1}"#, b"payload").encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
        // The corrupt frame is consumed so decoding can continue.
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_crc_covers_header() {
        let mut encoded = frame(r#"{"type":"reply","id":1}"#, b"payload").encode().unwrap();
        encoded[FRAME_HEADER_SIZE + 2] ^= 0x01;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf =
            BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_incomplete_frame() {
        let mut buf = BytesMut::from(&b"IRSX\x00\x01\x00\x01"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        let encoded = frame(r#"{"type":"close"}"#, b"").encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf =
            BytesMut::from(&b"IRSX\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0004);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0004))));
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
        let frame = Frame::new(Bytes::new(), Bytes::from(huge_payload));
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_without_crc() {
        let mut frame = frame(r#"{"type":"close"}"#, b"");
        frame.flags = FrameFlags::new();

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(r#"{"id":1}"#, b"one").encode().unwrap());
        buf.extend_from_slice(&frame(r#"{"id":2}"#, b"two").encode().unwrap());

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"one");

        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), b"two");

        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn payload_bytes_survive_framing(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let frame = Frame::new(Bytes::from_static(b"{}"), Bytes::from(payload.clone()));
            let mut buf = frame.encode().unwrap();
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }
    }
}
