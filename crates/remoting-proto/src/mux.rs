//! Multiplexing primitives for established connections

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Channel identifier, unique within one connection
pub type ChannelId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Control = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel_id: ChannelId,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: channel_id (4) + frame_type (1) + length (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(channel_id: ChannelId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            channel_id,
            frame_type,
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_CHANNEL_ID, FrameType::Control, payload)
    }

    pub fn data(channel_id: ChannelId, payload: Bytes) -> Self {
        Self::new(channel_id, FrameType::Data, payload)
    }

    pub fn close(channel_id: ChannelId) -> Self {
        Self::new(channel_id, FrameType::Close, Bytes::new())
    }

    /// Encode frame into `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.channel_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MuxError::IncompleteFrame);
        }

        let channel_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(MuxError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            channel_id,
            frame_type,
            payload,
        })
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hands out channel IDs for one side of a connection.
///
/// The dialing side allocates odd IDs and the accepting side even IDs, so
/// both ends can open channels at the same time without coordinating.
/// ID 0 is the control channel and is never returned.
#[derive(Debug)]
pub struct ChannelIdAllocator {
    next: AtomicU32,
}

impl ChannelIdAllocator {
    pub fn new(dialer: bool) -> Self {
        Self {
            next: AtomicU32::new(if dialer { 1 } else { 2 }),
        }
    }

    /// Next candidate ID. Callers still check it against the live table,
    /// since IDs wrap after 2^31 allocations.
    pub fn allocate(&self) -> ChannelId {
        loop {
            let id = self.next.fetch_add(2, Ordering::Relaxed);
            if id != crate::CONTROL_CHANNEL_ID {
                return id;
            }
        }
    }

    /// Whether `id` could have been allocated by the peer
    pub fn is_peer_id(&self, id: ChannelId) -> bool {
        let ours = self.next.load(Ordering::Relaxed) % 2;
        id != crate::CONTROL_CHANNEL_ID && id % 2 != ours
    }
}
