//! Protocol message types

use serde::{Deserialize, Serialize};

use crate::mux::ChannelId;

/// Policy flags a peer enforces during negotiation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyFlags {
    /// Reject the ANONYMOUS mechanism
    pub no_anonymous: bool,
    /// Require an encrypted connection and reject mechanisms that send
    /// secrets in the clear
    pub no_plaintext: bool,
}

impl PolicyFlags {
    /// Combine two policies; a flag set on either side applies to both.
    pub fn merge(self, other: PolicyFlags) -> PolicyFlags {
        PolicyFlags {
            no_anonymous: self.no_anonymous || other.no_anonymous,
            no_plaintext: self.no_plaintext || other.no_plaintext,
        }
    }
}

/// TLS capability advertised by the accepting side
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsOffer {
    /// The acceptor can perform an in-band upgrade
    pub available: bool,
    /// The acceptor refuses to complete without one
    pub required: bool,
}

/// Why an authentication attempt was refused
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectKind {
    /// The mechanism failed; the dialer may try another one
    Retry,
    /// A policy flag forbids the attempt; negotiation is over
    Policy,
    /// Negotiation is over for any other reason
    Fatal,
}

/// Messages exchanged on the raw stream before a connection is established
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HandshakeMessage {
    /// Sent by the accepting side as soon as the stream is up
    Greeting {
        version: u32,
        endpoint_name: String,
        mechanisms: Vec<String>,
        policy: PolicyFlags,
        tls: TlsOffer,
    },
    /// Dialer selects a mechanism
    AuthRequest {
        endpoint_name: String,
        mechanism: String,
        initial_response: Option<Vec<u8>>,
        start_tls: bool,
    },
    AuthChallenge {
        data: Vec<u8>,
    },
    AuthResponse {
        data: Vec<u8>,
    },
    /// Mechanism completed. When `upgrade` is set both sides switch the
    /// stream to TLS right after this message.
    AuthSuccess {
        principal: String,
        upgrade: bool,
    },
    AuthRejected {
        reason: String,
        kind: RejectKind,
    },
    /// Dialer gives up on the current mechanism mid-exchange; the acceptor
    /// answers with a rejection and the dialer may select another one
    AuthAbort {
        reason: String,
    },
}

impl HandshakeMessage {
    /// Short name for logging without dumping credential bytes
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::Greeting { .. } => "Greeting",
            HandshakeMessage::AuthRequest { .. } => "AuthRequest",
            HandshakeMessage::AuthChallenge { .. } => "AuthChallenge",
            HandshakeMessage::AuthResponse { .. } => "AuthResponse",
            HandshakeMessage::AuthSuccess { .. } => "AuthSuccess",
            HandshakeMessage::AuthRejected { .. } => "AuthRejected",
            HandshakeMessage::AuthAbort { .. } => "AuthAbort",
        }
    }
}

/// Why a channel open request was refused
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpenRejection {
    NoSuchService(String),
    /// The service refuses more channels on this connection
    LimitReached(String),
    Closing,
}

/// Messages carried on the control channel of an established connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    OpenChannel {
        channel_id: ChannelId,
        service_name: String,
    },
    OpenChannelAck {
        channel_id: ChannelId,
    },
    OpenChannelRejected {
        channel_id: ChannelId,
        reason: OpenRejection,
    },
    CloseConnection {
        reason: String,
    },
}
