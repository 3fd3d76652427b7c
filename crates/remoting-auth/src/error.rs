use crate::callback::UnsupportedCredential;
use thiserror::Error;

/// Negotiation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error(transparent)]
    UnsupportedCredential(#[from] UnsupportedCredential),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
