use remoting_auth::AuthError;
use remoting_proto::{CodecError, Fault, MuxError};
use remoting_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by endpoints, connections, channels and dispatchers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemotingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("A provider is already registered for scheme '{0}'")]
    DuplicateProvider(String),

    #[error("A service is already registered as '{0}'")]
    DuplicateService(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Unsupported credential: {0}")]
    UnsupportedCredential(String),

    #[error("No such service: {0}")]
    NoSuchService(String),

    #[error("Service '{0}' refused another channel")]
    ServiceUnavailable(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Remote fault: {0}")]
    RegistryFault(Fault),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out")]
    Timeout,
}

/// Result type for remoting operations
pub type RemotingResult<T> = Result<T, RemotingError>;

impl From<AuthError> for RemotingError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Configuration(msg) => RemotingError::Configuration(msg),
            AuthError::Authentication(msg) => RemotingError::Authentication(msg),
            AuthError::PolicyViolation(msg) => RemotingError::PolicyViolation(msg),
            AuthError::UnsupportedCredential(e) => RemotingError::UnsupportedCredential(e.0),
            AuthError::Protocol(msg) => RemotingError::Protocol(msg),
        }
    }
}

impl From<TransportError> for RemotingError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConfigurationError(msg) | TransportError::InvalidAddress(msg) => {
                RemotingError::Configuration(msg)
            }
            TransportError::Timeout => RemotingError::Timeout,
            other => RemotingError::Transport(other.to_string()),
        }
    }
}

impl From<CodecError> for RemotingError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => RemotingError::Transport(e.to_string()),
            other => RemotingError::Protocol(other.to_string()),
        }
    }
}

impl From<MuxError> for RemotingError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(e) => RemotingError::Transport(e.to_string()),
            other => RemotingError::Protocol(other.to_string()),
        }
    }
}

impl From<Fault> for RemotingError {
    fn from(fault: Fault) -> Self {
        RemotingError::RegistryFault(fault)
    }
}

impl From<std::io::Error> for RemotingError {
    fn from(err: std::io::Error) -> Self {
        RemotingError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoting_auth::UnsupportedCredential;
    use remoting_proto::FaultKind;

    #[test]
    fn test_auth_error_mapping() {
        assert_eq!(
            RemotingError::from(AuthError::PolicyViolation("x".into())),
            RemotingError::PolicyViolation("x".into())
        );
        assert_eq!(
            RemotingError::from(AuthError::UnsupportedCredential(UnsupportedCredential(
                "password".into()
            ))),
            RemotingError::UnsupportedCredential("password".into())
        );
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            RemotingError::from(TransportError::InvalidAddress("bad".into())),
            RemotingError::Configuration(_)
        ));
        assert_eq!(
            RemotingError::from(TransportError::Timeout),
            RemotingError::Timeout
        );
    }

    #[test]
    fn test_fault_display() {
        let err = RemotingError::from(Fault::new(FaultKind::InstanceNotFound, "a:b=c"));
        assert_eq!(err.to_string(), "Remote fault: InstanceNotFound: a:b=c");
    }
}
