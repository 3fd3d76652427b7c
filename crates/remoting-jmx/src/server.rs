//! A ready-made management server
//!
//! Owns an [`Endpoint`] with the TCP provider registered under the
//! `remote` scheme and the management service bound to a registry, and
//! listens on the configured host and port.

use crate::registry::ManagedObjectRegistry;
use crate::service::ManagementService;
use remoting_connection::{
    Acceptor, Endpoint, EndpointOptions, PeerAddress, ProviderOptions, Registration,
    RemotingError, RemotingResult, ServiceOptions, TcpProviderFactory,
};
use remoting_proto::{DEFAULT_PORT, DEFAULT_SCHEME};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Endpoint name announced to peers
    pub name: String,
    pub host: String,
    /// Port to listen on; 0 picks a free one
    pub port: u16,
    pub endpoint: EndpointOptions,
    pub provider: ProviderOptions,
    pub service: ServiceOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "management-server".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            endpoint: EndpointOptions::default(),
            provider: ProviderOptions::default(),
            service: ServiceOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> RemotingResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RemotingError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ServerConfig = serde_json::from_str(&text).map_err(|e| {
            RemotingError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointOptions) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn validate(&self) -> RemotingResult<()> {
        if self.name.is_empty() {
            return Err(RemotingError::Configuration(
                "name must not be empty".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(RemotingError::Configuration(
                "host must not be empty".to_string(),
            ));
        }
        self.endpoint.validate()?;
        self.provider.validate()?;
        self.service.validate()
    }

    fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub struct ManagementServer {
    endpoint: Endpoint,
    registration: Registration,
    acceptor: Acceptor,
    registry: Arc<dyn ManagedObjectRegistry>,
}

impl ManagementServer {
    /// Create the endpoint, register the management service and listen
    pub async fn start(
        config: ServerConfig,
        registry: Arc<dyn ManagedObjectRegistry>,
    ) -> RemotingResult<Self> {
        config.validate()?;

        let endpoint = Endpoint::create(config.name.as_str(), config.endpoint.clone())?;
        endpoint.add_connection_provider(
            DEFAULT_SCHEME,
            &TcpProviderFactory,
            config.provider.clone(),
        )?;
        let registration = ManagementService::new(registry.clone())
            .register(&endpoint, config.service.clone())?;

        let acceptor = match endpoint
            .start_listening(DEFAULT_SCHEME, &config.bind_address())
            .await
        {
            Ok(acceptor) => acceptor,
            Err(e) => {
                endpoint.close().await;
                return Err(e);
            }
        };

        info!(
            "Management server '{}' listening on {}",
            config.name,
            acceptor.local_address()
        );

        Ok(Self {
            endpoint,
            registration,
            acceptor,
            registry,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn registry(&self) -> &Arc<dyn ManagedObjectRegistry> {
        &self.registry
    }

    pub fn local_addr(&self) -> &PeerAddress {
        self.acceptor.local_address()
    }

    /// Dial address of this server, e.g. `remote://127.0.0.1:9999`
    pub fn address(&self) -> String {
        self.acceptor.local_address().to_string()
    }

    /// Stop listening, unregister the service and close every connection
    pub async fn stop(&self) {
        info!("Stopping management server '{}'", self.endpoint.name());
        self.acceptor.close();
        self.registration.close();
        self.endpoint.close().await;
    }
}
