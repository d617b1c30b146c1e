//! Length-prefixed frame codec.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MessageKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum frame length (kind byte + payload): 16 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes messages into frames and decodes frames from a byte stream.
///
/// Decoding is resumable: bytes can arrive in arbitrary chunks, and
/// [`FrameCodec::decode`] returns `Ok(None)` until a whole frame is
/// buffered. The declared length is checked against the maximum before
/// any body bytes are buffered.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    skipped: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Creates a codec that rejects frames longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(1),
            skipped: 0,
        }
    }

    /// Returns the configured maximum frame length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Number of frames of unknown kind skipped so far.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    /// Encodes a message into a standalone frame.
    pub fn encode(&self, message: &Message) -> ProtocolResult<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_into(message, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Appends the frame for `message` to `dst`.
    pub fn encode_into(&self, message: &Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        let payload = encode_payload(message)?;
        let len = payload.len() + 1;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let len_prefix = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
            len,
            max: self.max_frame_len,
        })?;
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_u32(len_prefix);
        dst.put_u8(message.kind().as_u8());
        dst.put_slice(&payload);
        Ok(())
    }

    /// Decodes the next message from `src`.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a whole frame; the
    /// partial bytes stay in `src`. Frames of unknown kind are consumed and
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooLarge`] if the declared length exceeds
    ///   the maximum
    /// - [`ProtocolError::Corrupt`] if the frame is empty or its payload
    ///   cannot be decoded
    pub fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if len == 0 {
                src.advance(FRAME_HEADER_LEN);
                return Err(ProtocolError::corrupt(0, "empty frame"));
            }
            if len > self.max_frame_len {
                return Err(ProtocolError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
            let needed = FRAME_HEADER_LEN + len;
            if src.len() < needed {
                src.reserve(needed - src.len());
                return Ok(None);
            }

            src.advance(FRAME_HEADER_LEN);
            let frame = src.split_to(len);
            let kind_byte = frame[0];
            match MessageKind::from_u8(kind_byte) {
                Some(kind) => return decode_payload(kind, &frame[1..]).map(Some),
                None => self.skipped += 1,
            }
        }
    }
}

fn encode_payload(message: &Message) -> ProtocolResult<Vec<u8>> {
    match message {
        Message::Hello(m) => to_cbor(m),
        Message::HelloAck(m) => to_cbor(m),
        Message::SubscribeRequest(m) => to_cbor(m),
        Message::SubscribeAck(m) => to_cbor(m),
        Message::Transaction(m) => to_cbor(m),
        Message::Ack(m) => to_cbor(m),
        Message::SchemaChange(m) => to_cbor(m),
        Message::Error(m) => to_cbor(m),
        Message::Ping | Message::Pong => Ok(Vec::new()),
    }
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> ProtocolResult<Message> {
    let byte = kind.as_u8();
    Ok(match kind {
        MessageKind::Hello => Message::Hello(from_cbor(byte, payload)?),
        MessageKind::HelloAck => Message::HelloAck(from_cbor(byte, payload)?),
        MessageKind::SubscribeRequest => Message::SubscribeRequest(from_cbor(byte, payload)?),
        MessageKind::SubscribeAck => Message::SubscribeAck(from_cbor(byte, payload)?),
        MessageKind::Transaction => Message::Transaction(from_cbor(byte, payload)?),
        MessageKind::Ack => Message::Ack(from_cbor(byte, payload)?),
        MessageKind::SchemaChange => Message::SchemaChange(from_cbor(byte, payload)?),
        MessageKind::Error => Message::Error(from_cbor(byte, payload)?),
        MessageKind::Ping => Message::Ping,
        MessageKind::Pong => Message::Pong,
    })
}

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(kind: u8, payload: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(payload).map_err(|e| ProtocolError::corrupt(kind, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causality::CausalityTag;
    use crate::message::{Change, ChangeOp, ErrorCode, Hello, ProtocolVersion, WireTransaction};
    use satellite_storage::{row, SqlValue};

    fn transaction() -> Message {
        Message::Transaction(WireTransaction {
            tag: CausalityTag::new("r1", 4),
            timestamp: 1_000,
            observed: 2,
            commit_seq: None,
            changes: vec![Change {
                seq: 5,
                table: "items".into(),
                op: ChangeOp::Insert,
                pk: row([("id", SqlValue::from(1))]),
                values: row([("name", SqlValue::from("pen")), ("qty", SqlValue::Null)]),
            }],
        })
    }

    #[test]
    fn encode_decode_message() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&codec.encode(&transaction()).unwrap()[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(transaction()));
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_layout() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&Message::Ping).unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 1, 9]);
    }

    #[test]
    fn partial_frames_are_buffered() {
        let mut codec = FrameCodec::default();
        let frame = codec.encode(&transaction()).unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..2]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[2..frame.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(transaction()));
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode_into(&Message::Ping, &mut buf).unwrap();
        codec.encode_into(&Message::ack(7), &mut buf).unwrap();
        codec.encode_into(&Message::Pong, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Ping));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::ack(7)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Pong));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_rejected_before_body() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(65);
        buf.put_u8(5);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge { len: 65, max: 64 });
    }

    #[test]
    fn oversized_message_rejected_on_encode() {
        let codec = FrameCodec::new(8);
        let err = codec.encode(&transaction()).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn unknown_kind_is_skipped() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u8(42);
        buf.put_slice(&[1, 2, 3]);
        codec.encode_into(&Message::Pong, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Pong));
        assert_eq!(codec.skipped_frames(), 1);
    }

    #[test]
    fn corrupt_payload_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(1);
        buf.put_slice(&[0xff, 0xff]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Corrupt { kind: 1, .. }));
    }

    #[test]
    fn empty_frame_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Corrupt { kind: 0, .. })
        ));
    }

    #[test]
    fn handshake_and_error_messages() {
        let mut codec = FrameCodec::default();
        let messages = [
            Message::Hello(Hello {
                protocol_version: ProtocolVersion::CURRENT,
                replica_id: "r1".into(),
                schema_version: 3,
            }),
            Message::error(ErrorCode::CursorUnavailable, "cursor 9 pruned"),
        ];
        let mut buf = BytesMut::new();
        for m in &messages {
            codec.encode_into(m, &mut buf).unwrap();
        }
        for m in messages {
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(m));
        }
    }
}
