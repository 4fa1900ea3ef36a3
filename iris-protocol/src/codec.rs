//! Encoder and decoder for relay messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use bytes::BytesMut;

/// Encodes messages into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a frame.
    pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
        message.to_frame()?.encode()
    }
}

/// Incremental decoder: feed it socket reads, pull complete messages out.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// On a recoverable error (see [`ProtocolError::is_recoverable`]) the bad
    /// frame has already been consumed and the next call continues with the
    /// following frame.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Message::from_frame(frame).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use bytes::Bytes;
    use crate::message::{Envelope, ReplyError, RequestId};

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let message = Message::request(RequestId(42), "cluster-a", 250, Bytes::from_static(b"ping"));
        let encoded = Encoder::encode(&message).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_decoding() {
        let message = Message::reply(RequestId(1), Bytes::from_static(b"pong"));
        let encoded = Encoder::encode(&message).unwrap();

        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_message().unwrap().is_none());

        decoder.extend(&encoded[10..]);
        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.envelope, Envelope::Reply { id: RequestId(1) });
    }

    #[test]
    fn test_decoding_continues_after_bad_envelope() {
        let bad = Frame::new(Bytes::from_static(br#"{"type":"mystery"}"#), Bytes::new())
            .encode()
            .unwrap();
        let good = Encoder::encode(&Message::error_reply(
            RequestId(2),
            ReplyError::new(ErrorCode::NoMembers, "empty cluster"),
        ))
        .unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&bad);
        decoder.extend(&good);

        let err = decoder.decode_message().unwrap_err();
        assert!(err.is_recoverable());

        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.envelope.request_id(), Some(RequestId(2)));
    }

    #[test]
    fn test_decoder_buffered() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);
    }
}
