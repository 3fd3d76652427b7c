//! Transport abstraction layer for remoting connections
//!
//! A remoting connection runs over any ordered, reliable byte stream. This
//! crate defines the seam between the connection layer and the concrete
//! socket code:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  remoting-connection                     │
//! │        (endpoint, negotiation, channel multiplexing)     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            remoting-transport (this crate)               │
//! │  - ProviderFactory      - ConnectionProvider             │
//! │  - TransportListener    - BoxedStream                    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────┬──────────────┐
//! │ tcp          │ memory       │
//! └──────────────┴──────────────┘
//! ```
//!
//! TLS is not a provider of its own: the connection layer upgrades an
//! already negotiated stream in place (see [`tls`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod memory;
pub mod self_signed;
pub mod tcp;
pub mod tls;

pub use memory::{MemoryNetwork, MemoryProviderFactory};
pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate, SelfSignedError};
pub use tcp::TcpProviderFactory;
pub use tls::TlsOptions;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream a connection runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream handed from providers to the connection layer
pub type BoxedStream = Box<dyn AsyncStream>;

/// A parsed dial or bind address: `scheme://host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse a destination URI. The port defaults to
    /// [`remoting_proto::DEFAULT_PORT`]; paths, queries, fragments and user
    /// info are rejected.
    pub fn parse(destination: &str) -> TransportResult<Self> {
        let url = url::Url::parse(destination)
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", destination, e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidAddress(format!("{}: missing host", destination)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(TransportError::InvalidAddress(format!(
                "{}: paths, queries and fragments are not supported",
                destination
            )));
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(TransportError::InvalidAddress(format!(
                "{}: credentials belong in the callback, not the address",
                destination
            )));
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port().unwrap_or(remoting_proto::DEFAULT_PORT),
        })
    }

    /// `host:port` form for socket APIs
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Options applied when a provider is instantiated for an endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProviderOptions {
    /// Dial timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm on TCP sockets
    pub nodelay: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            nodelay: true,
        }
    }
}

impl ProviderOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.connect_timeout_ms == 0 {
            return Err(TransportError::ConfigurationError(
                "connect-timeout-ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Dials and binds byte streams for one URI scheme
#[async_trait]
pub trait ConnectionProvider: Send + Sync + Debug {
    /// Open a raw stream to `address`
    async fn connect(&self, address: &PeerAddress) -> TransportResult<BoxedStream>;

    /// Start accepting raw streams on `address`
    async fn bind(&self, address: &PeerAddress) -> TransportResult<Box<dyn TransportListener>>;

    /// Release any resources held by the provider
    async fn close(&self) {}
}

/// Accepts inbound raw streams
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Wait for the next inbound stream. Returns the stream and a
    /// printable description of the peer.
    async fn accept(&self) -> TransportResult<(BoxedStream, String)>;

    /// The address actually bound (with the assigned port when 0 was asked for)
    fn local_address(&self) -> PeerAddress;

    /// Stop accepting
    async fn close(&self);
}

/// Creates providers; registered with an endpoint under a scheme
pub trait ProviderFactory: Send + Sync {
    fn create_provider(
        &self,
        options: &ProviderOptions,
    ) -> TransportResult<Arc<dyn ConnectionProvider>>;
}
