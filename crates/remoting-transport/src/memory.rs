//! In-process provider backed by `tokio::io::duplex`
//!
//! Endpoints that share a [`MemoryNetwork`] can dial each other by
//! `scheme://name:port` without touching sockets.

use crate::{
    BoxedStream, ConnectionProvider, PeerAddress, ProviderFactory, ProviderOptions,
    TransportError, TransportListener, TransportResult,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const DUPLEX_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 32;

type Backlog = mpsc::Sender<(DuplexStream, String)>;

/// Shared namespace of in-memory listeners
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    listeners: DashMap<(String, u16), Backlog>,
    next_port: AtomicU16,
    next_client: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn allocate_port(&self) -> u16 {
        // Ephemeral range, skipping 0
        49152 + (self.inner.next_port.fetch_add(1, Ordering::Relaxed) % 16000)
    }
}

/// Factory for providers attached to one [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryProviderFactory {
    network: MemoryNetwork,
}

impl MemoryProviderFactory {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }
}

impl ProviderFactory for MemoryProviderFactory {
    fn create_provider(
        &self,
        options: &ProviderOptions,
    ) -> TransportResult<Arc<dyn ConnectionProvider>> {
        options.validate()?;
        Ok(Arc::new(MemoryProvider {
            network: self.network.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct MemoryProvider {
    network: MemoryNetwork,
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn connect(&self, address: &PeerAddress) -> TransportResult<BoxedStream> {
        let key = (address.host.clone(), address.port);
        let backlog = self
            .network
            .inner
            .listeners
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TransportError::ConnectionError(format!("{}: connection refused", address))
            })?;

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let client_id = self.network.inner.next_client.fetch_add(1, Ordering::Relaxed);

        backlog
            .send((server, format!("memory-client-{}", client_id)))
            .await
            .map_err(|_| {
                TransportError::ConnectionError(format!("{}: connection refused", address))
            })?;

        debug!("In-memory stream opened to {}", address);
        Ok(Box::new(client))
    }

    async fn bind(&self, address: &PeerAddress) -> TransportResult<Box<dyn TransportListener>> {
        let port = if address.port == 0 {
            self.network.allocate_port()
        } else {
            address.port
        };
        let key = (address.host.clone(), port);

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        match self.network.inner.listeners.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::ConnectionError(format!(
                    "{}:{} already in use",
                    key.0, key.1
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            key,
            local_address: PeerAddress::new(address.scheme.clone(), address.host.clone(), port),
            backlog: tx,
            rx: Mutex::new(rx),
        }))
    }
}

#[derive(Debug)]
pub struct MemoryListener {
    network: MemoryNetwork,
    key: (String, u16),
    local_address: PeerAddress,
    backlog: Backlog,
    rx: Mutex<mpsc::Receiver<(DuplexStream, String)>>,
}

impl MemoryListener {
    fn unregister(&self) {
        // Only remove our own entry; the name may have been rebound since
        self.network
            .inner
            .listeners
            .remove_if(&self.key, |_, tx| tx.same_channel(&self.backlog));
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> TransportResult<(BoxedStream, String)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((stream, peer)) => Ok((Box::new(stream), peer)),
            None => Err(TransportError::ConnectionError(
                "listener closed".to_string(),
            )),
        }
    }

    fn local_address(&self) -> PeerAddress {
        self.local_address.clone()
    }

    async fn close(&self) {
        self.unregister();
        self.rx.lock().await.close();
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}
