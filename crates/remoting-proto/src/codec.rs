//! Codecs for the negotiation stream and the multiplexed stream

use crate::messages::HandshakeMessage;
use crate::mux::{Frame, MuxError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maximum size of a single bincode-encoded message (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Serialize a message body with bincode
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
    let payload = bincode::serialize(msg)?;

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Deserialize a message body produced by [`encode_message`]
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }
    Ok(bincode::deserialize(payload)?)
}

/// Negotiation message codec
///
/// Format: [length: u32][payload: bincode serialized message]
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = HandshakeMessage;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let msg_bytes = buf.split_to(length);

        decode_message(&msg_bytes).map(Some)
    }
}

impl Encoder<HandshakeMessage> for HandshakeCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: HandshakeMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = encode_message(&msg)?;

        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }
}

/// Multiplexed frame codec used once a connection is established
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        // Length sits after channel_id (4) and frame_type (1)
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[5..9]);
        let length = u32::from_be_bytes(length_bytes);

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        let frame_size = Frame::HEADER_SIZE + length as usize;
        if buf.len() < frame_size {
            buf.reserve(frame_size - buf.len());
            return Ok(None);
        }

        let raw = buf.split_to(frame_size).freeze();
        Frame::decode(raw).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode_into(buf)
    }
}
