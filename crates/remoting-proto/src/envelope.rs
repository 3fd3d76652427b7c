//! Request/response envelopes carried on a management channel

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categories of failure a remote registry can report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FaultKind {
    InstanceNotFound,
    InstanceAlreadyExists,
    AttributeNotFound,
    OperationNotFound,
    ClassNotFound,
    InvalidArgument,
    MalformedObjectName,
    UnknownOperation,
    Decode,
    Runtime,
}

/// A remote failure, carried back in a response instead of closing the channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Result of one remote call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Outcome {
    Success(Vec<u8>),
    Fault(Fault),
}

/// One message on a dispatcher-managed channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Envelope {
    Request {
        correlation_id: u32,
        operation: String,
        payload: Vec<u8>,
    },
    Response {
        correlation_id: u32,
        outcome: Outcome,
    },
    /// Unsolicited event pushed by the serving side
    Notification {
        subscription_id: u64,
        payload: Vec<u8>,
    },
}
