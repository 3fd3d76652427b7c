//! Endpoints: the local identity that owns providers, services and connections

use crate::config::{EndpointOptions, ServiceOptions};
use crate::connection::{Connection, ConnectionContext};
use crate::error::{RemotingError, RemotingResult};
use crate::future::IoFuture;
use crate::handshake::{negotiate_inbound, negotiate_outbound};
use crate::listener::OpenListener;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remoting_auth::{CredentialCallback, NegotiationOptions, ServerAuthConfig};
use remoting_transport::{
    BoxedStream, ConnectionProvider, PeerAddress, ProviderFactory, ProviderOptions,
    TransportError, TransportListener,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct ServiceEntry {
    pub listener: Arc<dyn OpenListener>,
    pub options: ServiceOptions,
    registration: u64,
}

pub(crate) type ServiceTable = DashMap<String, ServiceEntry>;

struct EndpointInner {
    name: String,
    options: EndpointOptions,
    server_auth: Arc<ServerAuthConfig>,
    providers: DashMap<String, Arc<dyn ConnectionProvider>>,
    services: Arc<ServiceTable>,
    connections: Arc<DashMap<String, Connection>>,
    connector: TlsConnector,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_registration: AtomicU64,
}

/// A named local participant in remoting
///
/// Transports are plugged in per URI scheme with
/// [`add_connection_provider`](Endpoint::add_connection_provider). Services
/// registered here accept channels on every connection of the endpoint,
/// whichever side dialed it.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn create(name: impl Into<String>, options: EndpointOptions) -> RemotingResult<Endpoint> {
        let name = name.into();
        if name.is_empty() {
            return Err(RemotingError::Configuration(
                "endpoint name must not be empty".to_string(),
            ));
        }
        options.validate()?;

        let connector = options.tls.build_connector()?;
        let acceptor = if options.tls.can_accept() {
            Some(options.tls.build_acceptor()?)
        } else {
            None
        };

        info!(
            "Endpoint {} created (TLS upgrade {})",
            name,
            if acceptor.is_some() {
                "available"
            } else {
                "unavailable"
            }
        );

        Ok(Endpoint {
            inner: Arc::new(EndpointInner {
                name,
                server_auth: Arc::new(options.server_auth.clone()),
                options,
                providers: DashMap::new(),
                services: Arc::new(DashMap::new()),
                connections: Arc::new(DashMap::new()),
                connector,
                acceptor,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                next_registration: AtomicU64::new(1),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a transport for `scheme`
    pub fn add_connection_provider(
        &self,
        scheme: &str,
        factory: &dyn ProviderFactory,
        options: ProviderOptions,
    ) -> RemotingResult<()> {
        self.ensure_open()?;
        options.validate()?;

        match self.inner.providers.entry(scheme.to_string()) {
            Entry::Occupied(_) => Err(RemotingError::DuplicateProvider(scheme.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(factory.create_provider(&options)?);
                debug!("[{}] Provider registered for {}", self.inner.name, scheme);
                Ok(())
            }
        }
    }

    /// Dial `destination` and negotiate a connection
    pub fn connect(
        &self,
        destination: &str,
        options: NegotiationOptions,
        callback: Arc<dyn CredentialCallback>,
    ) -> IoFuture<Connection> {
        let (completion, future) = IoFuture::pair();
        let endpoint = self.clone();
        let destination = destination.to_string();

        tokio::spawn(async move {
            let result = endpoint.dial(&destination, options, callback).await;
            if let Err(e) = &result {
                warn!(
                    "[{}] Connection to {} failed: {}",
                    endpoint.inner.name, destination, e
                );
            }
            completion.complete(result);
        });

        future
    }

    async fn dial(
        &self,
        destination: &str,
        options: NegotiationOptions,
        callback: Arc<dyn CredentialCallback>,
    ) -> RemotingResult<Connection> {
        self.ensure_open()?;
        options.validate()?;
        let address = PeerAddress::parse(destination)?;
        let provider = self.provider(&address.scheme)?;

        debug!("[{}] Dialing {}", self.inner.name, address);
        let stream = provider.connect(&address).await?;

        let server_name = self
            .inner
            .options
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| address.host.clone());

        let negotiation = negotiate_outbound(
            stream,
            &self.inner.name,
            options,
            callback,
            &self.inner.connector,
            &server_name,
        );
        let (framed, session) =
            tokio::time::timeout(self.inner.options.handshake_timeout(), negotiation)
                .await
                .map_err(|_| RemotingError::Timeout)??;

        let connection = Connection::establish(
            framed,
            session,
            self.connection_context(),
            true,
            address.to_string(),
        );
        self.track(&connection)?;
        Ok(connection)
    }

    /// Accept channels named `service_name` on every connection
    pub fn register_service(
        &self,
        service_name: &str,
        listener: Arc<dyn OpenListener>,
        options: ServiceOptions,
    ) -> RemotingResult<Registration> {
        self.ensure_open()?;
        options.validate()?;

        let registration = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        match self.inner.services.entry(service_name.to_string()) {
            Entry::Occupied(_) => {
                return Err(RemotingError::DuplicateService(service_name.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ServiceEntry {
                    listener,
                    options,
                    registration,
                });
            }
        }

        info!(
            "[{}] Service registered: {}",
            self.inner.name, service_name
        );

        Ok(Registration {
            service_name: service_name.to_string(),
            registration,
            services: Arc::downgrade(&self.inner.services),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind `scheme`'s provider to `bind_addr` (`host[:port]`) and accept
    /// inbound connections until the acceptor or the endpoint is closed
    pub async fn start_listening(&self, scheme: &str, bind_addr: &str) -> RemotingResult<Acceptor> {
        self.ensure_open()?;
        let address = PeerAddress::parse(&format!("{}://{}", scheme, bind_addr))?;
        let provider = self.provider(scheme)?;

        let listener = provider.bind(&address).await?;
        let local_address = listener.local_address();
        let token = self.inner.shutdown.child_token();

        info!("[{}] Listening on {}", self.inner.name, local_address);

        let endpoint = self.clone();
        let accept_token = token.clone();
        tokio::spawn(async move {
            endpoint.accept_loop(listener, accept_token).await;
        });

        Ok(Acceptor {
            local_address,
            token,
        })
    }

    async fn accept_loop(self, listener: Box<dyn TransportListener>, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = token.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("[{}] Accepted stream from {}", self.inner.name, peer);
                    let endpoint = self.clone();
                    tokio::spawn(async move {
                        endpoint.accept_stream(stream, peer).await;
                    });
                }
                Err(TransportError::ConnectionError(e)) => {
                    debug!("[{}] Listener stopped: {}", self.inner.name, e);
                    break;
                }
                Err(e) => {
                    error!("[{}] Accept failed: {}", self.inner.name, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        listener.close().await;
        debug!(
            "[{}] Stopped listening on {}",
            self.inner.name,
            listener.local_address()
        );
    }

    async fn accept_stream(&self, stream: BoxedStream, peer: String) {
        let negotiation = negotiate_inbound(
            stream,
            &self.inner.name,
            &self.inner.options.negotiation,
            self.inner.server_auth.clone(),
            self.inner.acceptor.as_ref(),
        );

        match tokio::time::timeout(self.inner.options.handshake_timeout(), negotiation).await {
            Ok(Ok((framed, session))) => {
                let connection = Connection::establish(
                    framed,
                    session,
                    self.connection_context(),
                    false,
                    peer,
                );
                if let Err(e) = self.track(&connection) {
                    debug!("[{}] Dropping accepted connection: {}", self.inner.name, e);
                }
            }
            Ok(Err(e)) => {
                warn!(
                    "[{}] Inbound negotiation from {} failed: {}",
                    self.inner.name, peer, e
                );
            }
            Err(_) => {
                warn!(
                    "[{}] Inbound negotiation from {} timed out",
                    self.inner.name, peer
                );
            }
        }
    }

    /// Connections currently open on this endpoint, dialed or accepted
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close every connection and acceptor, withdraw every service and
    /// release the providers. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Closing endpoint", self.inner.name);

        self.inner.shutdown.cancel();

        for connection in self.connections() {
            connection.close();
        }
        self.inner.connections.clear();

        let services: Vec<String> = self
            .inner
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for service_name in services {
            if let Some((_, entry)) = self.inner.services.remove(&service_name) {
                entry.listener.registration_terminated();
            }
        }

        let providers: Vec<Arc<dyn ConnectionProvider>> = self
            .inner
            .providers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.providers.clear();
        for provider in providers {
            provider.close().await;
        }
    }

    fn ensure_open(&self) -> RemotingResult<()> {
        if self.is_closed() {
            return Err(RemotingError::ConnectionClosed(format!(
                "endpoint {} is closed",
                self.inner.name
            )));
        }
        Ok(())
    }

    fn provider(&self, scheme: &str) -> RemotingResult<Arc<dyn ConnectionProvider>> {
        self.inner
            .providers
            .get(scheme)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                RemotingError::Configuration(format!("no provider registered for '{}'", scheme))
            })
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            local_name: self.inner.name.clone(),
            services: self.inner.services.clone(),
            tracker: Arc::downgrade(&self.inner.connections),
            channel_buffer: self.inner.options.channel_buffer,
            write_queue: self.inner.options.write_queue,
        }
    }

    fn track(&self, connection: &Connection) -> RemotingResult<()> {
        self.inner
            .connections
            .insert(connection.id().to_string(), connection.clone());

        // close() may have swept the table just before the insert
        if self.is_closed() {
            connection.close();
            self.inner.connections.remove(connection.id());
            return Err(RemotingError::ConnectionClosed(format!(
                "endpoint {} is closed",
                self.inner.name
            )));
        }
        if connection.is_closed() {
            self.inner.connections.remove(connection.id());
        }
        Ok(())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("connections", &self.inner.connections.len())
            .field("services", &self.inner.services.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle for a service registered with [`Endpoint::register_service`]
#[derive(Clone)]
pub struct Registration {
    service_name: String,
    registration: u64,
    services: Weak<ServiceTable>,
    closed: Arc<AtomicBool>,
}

impl Registration {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Withdraw the service. Channels already open stay open. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(services) = self.services.upgrade() else {
            return;
        };
        let removed = services.remove_if(&self.service_name, |_, entry| {
            entry.registration == self.registration
        });
        if let Some((_, entry)) = removed {
            debug!("Service {} withdrawn", self.service_name);
            entry.listener.registration_terminated();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self
                .services
                .upgrade()
                .map(|services| {
                    services
                        .get(&self.service_name)
                        .map(|entry| entry.registration != self.registration)
                        .unwrap_or(true)
                })
                .unwrap_or(true)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("service_name", &self.service_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A running accept loop started by [`Endpoint::start_listening`]
#[derive(Debug)]
pub struct Acceptor {
    local_address: PeerAddress,
    token: CancellationToken,
}

impl Acceptor {
    /// The bound address, with the real port when port 0 was requested
    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    /// Stop accepting. Connections already accepted stay open.
    pub fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use remoting_transport::{MemoryNetwork, MemoryProviderFactory, TlsOptions};

    fn ignore() -> Arc<dyn OpenListener> {
        Arc::new(|_channel: Channel| {})
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::create(name, EndpointOptions::default()).unwrap()
    }

    #[test]
    fn test_create_rejects_bad_options() {
        assert!(matches!(
            Endpoint::create("", EndpointOptions::default()),
            Err(RemotingError::Configuration(_))
        ));

        let options = EndpointOptions::default()
            .with_tls(TlsOptions::server_with_files("/nonexistent/cert.pem", "/nonexistent/key.pem"));
        assert!(matches!(
            Endpoint::create("e", options),
            Err(RemotingError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let endpoint = endpoint("e");
        let factory = MemoryProviderFactory::new(MemoryNetwork::new());

        endpoint
            .add_connection_provider("local", &factory, ProviderOptions::default())
            .unwrap();
        assert_eq!(
            endpoint.add_connection_provider("local", &factory, ProviderOptions::default()),
            Err(RemotingError::DuplicateProvider("local".to_string()))
        );
    }

    #[test]
    fn test_duplicate_service_and_withdraw() {
        let endpoint = endpoint("e");
        let terminated = Arc::new(AtomicU64::new(0));

        struct Counting(Arc<AtomicU64>);
        impl OpenListener for Counting {
            fn channel_opened(&self, _channel: Channel) {}
            fn registration_terminated(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registration = endpoint
            .register_service(
                "svc",
                Arc::new(Counting(terminated.clone())),
                ServiceOptions::default(),
            )
            .unwrap();
        assert!(matches!(
            endpoint.register_service("svc", ignore(), ServiceOptions::default()),
            Err(RemotingError::DuplicateService(_))
        ));

        registration.close();
        registration.close();
        assert!(registration.is_closed());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);

        // The name is free again
        endpoint
            .register_service("svc", ignore(), ServiceOptions::default())
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_provider_fails() {
        let endpoint = endpoint("e");
        let result = endpoint
            .connect(
                "remote://localhost:1",
                NegotiationOptions::default(),
                Arc::new(remoting_auth::NameCallback::anonymous()),
            )
            .await_timeout(Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RemotingError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let endpoint = endpoint("e");
        endpoint.close().await;
        endpoint.close().await;
        assert!(endpoint.is_closed());
        assert!(endpoint
            .register_service("svc", ignore(), ServiceOptions::default())
            .is_err());
    }
}
