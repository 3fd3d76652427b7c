//! Remoting Protocol Definitions
//!
//! This crate defines the wire types shared by both ends of a remoting
//! connection: the negotiation messages exchanged before a connection is
//! usable, the multiplexing frames that carry channels once it is, and the
//! request/response envelopes used by management traffic on a channel.

pub mod codec;
pub mod envelope;
pub mod messages;
pub mod mux;

pub use codec::{decode_message, encode_message, CodecError, FrameCodec, HandshakeCodec};
pub use envelope::{Envelope, Fault, FaultKind, Outcome};
pub use messages::*;
pub use mux::{ChannelId, ChannelIdAllocator, Frame, FrameType, MuxError};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved channel ID for control messages
pub const CONTROL_CHANNEL_ID: ChannelId = 0;

/// Port used when a dial address does not name one
pub const DEFAULT_PORT: u16 = 9999;

/// URI scheme under which the bundled TCP provider is normally registered
pub const DEFAULT_SCHEME: &str = "remote";
