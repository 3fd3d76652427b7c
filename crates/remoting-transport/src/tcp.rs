//! Plain TCP provider

use crate::{
    BoxedStream, ConnectionProvider, PeerAddress, ProviderFactory, ProviderOptions,
    TransportError, TransportListener, TransportResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Factory for [`TcpProvider`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProviderFactory;

impl ProviderFactory for TcpProviderFactory {
    fn create_provider(
        &self,
        options: &ProviderOptions,
    ) -> TransportResult<Arc<dyn ConnectionProvider>> {
        options.validate()?;
        Ok(Arc::new(TcpProvider {
            options: options.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct TcpProvider {
    options: ProviderOptions,
}

#[async_trait]
impl ConnectionProvider for TcpProvider {
    async fn connect(&self, address: &PeerAddress) -> TransportResult<BoxedStream> {
        let authority = address.authority();
        debug!("Dialing {}", authority);

        let stream = tokio::time::timeout(
            self.options.connect_timeout(),
            TcpStream::connect(&authority),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionError(format!("{}: {}", authority, e)))?;

        stream.set_nodelay(self.options.nodelay)?;
        Ok(Box::new(stream))
    }

    async fn bind(&self, address: &PeerAddress) -> TransportResult<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(address.authority()).await?;
        let local = listener.local_addr()?;
        info!("TCP listener bound on {}", local);

        Ok(Box::new(TcpTransportListener {
            listener,
            local_address: PeerAddress::new(
                address.scheme.clone(),
                local.ip().to_string(),
                local.port(),
            ),
            nodelay: self.options.nodelay,
        }))
    }
}

#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
    local_address: PeerAddress,
    nodelay: bool,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> TransportResult<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        debug!("Accepted TCP stream from {}", peer);
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_address(&self) -> PeerAddress {
        self.local_address.clone()
    }

    async fn close(&self) {
        // The socket closes when the listener is dropped; the acceptor loop
        // stops polling us before that.
        debug!("Closing TCP listener on {}", self.local_address);
    }
}
