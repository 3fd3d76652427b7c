//! Endpoint and service configuration

use crate::error::{RemotingError, RemotingResult};
use remoting_auth::{NegotiationOptions, ServerAuthConfig};
use remoting_transport::TlsOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use remoting_transport::ProviderOptions;

/// Settings shared by every connection an endpoint creates or accepts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EndpointOptions {
    /// Policy applied to inbound negotiations
    pub negotiation: NegotiationOptions,
    /// Mechanisms and credential stores for inbound negotiations
    pub server_auth: ServerAuthConfig,
    /// TLS material; an acceptor is only built when it holds a certificate
    pub tls: TlsOptions,
    /// Upper bound on a whole negotiation, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Inbound messages buffered per channel before the reader waits
    pub channel_buffer: usize,
    /// Outbound frames buffered per connection before senders wait
    pub write_queue: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            negotiation: NegotiationOptions::default(),
            server_auth: ServerAuthConfig::default(),
            tls: TlsOptions::default(),
            handshake_timeout_ms: 30_000,
            channel_buffer: 256,
            write_queue: 1024,
        }
    }
}

impl EndpointOptions {
    /// Load options from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> RemotingResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RemotingError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options: EndpointOptions = serde_json::from_str(&content).map_err(|e| {
            RemotingError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_negotiation(mut self, negotiation: NegotiationOptions) -> Self {
        self.negotiation = negotiation;
        self
    }

    pub fn with_server_auth(mut self, server_auth: ServerAuthConfig) -> Self {
        self.server_auth = server_auth;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> RemotingResult<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(RemotingError::Configuration(
                "handshake-timeout-ms must be greater than zero".to_string(),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(RemotingError::Configuration(
                "channel-buffer must be greater than zero".to_string(),
            ));
        }
        if self.write_queue == 0 {
            return Err(RemotingError::Configuration(
                "write-queue must be greater than zero".to_string(),
            ));
        }
        self.negotiation.validate()?;
        self.server_auth.validate()?;
        self.tls.validate()?;
        Ok(())
    }
}

/// Per-service limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceOptions {
    /// Maximum inbound channels open at once on one connection
    pub max_channels: Option<usize>,
}

impl ServiceOptions {
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = Some(max);
        self
    }

    pub fn validate(&self) -> RemotingResult<()> {
        if self.max_channels == Some(0) {
            return Err(RemotingError::Configuration(
                "max-channels must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
