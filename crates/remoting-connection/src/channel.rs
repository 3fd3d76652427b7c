//! Channels: ordered duplex message streams multiplexed over a connection

use crate::connection::Connection;
use crate::error::{RemotingError, RemotingResult};
use bytes::Bytes;
use remoting_proto::ChannelId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One logical stream on a [`Connection`]
///
/// Cloning yields another handle onto the same stream. The stream is
/// released when [`Channel::close`] is called, when the connection closes,
/// or when the last handle is dropped.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    service_name: String,
    connection: Connection,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    token: CancellationToken,
    released: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        service_name: String,
        connection: Connection,
        rx: mpsc::Receiver<Bytes>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                service_name,
                connection,
                rx: Mutex::new(rx),
                token,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// The connection this channel lives on
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Queue one message. Messages arrive at the peer in send order.
    pub async fn send(&self, payload: Bytes) -> RemotingResult<()> {
        if self.inner.connection.is_closed() {
            return Err(self.inner.connection.closed_error());
        }
        if self.is_closed() {
            return Err(RemotingError::ChannelClosed);
        }
        self.inner
            .connection
            .send_data(self.inner.id, payload)
            .await
    }

    /// Next message from the peer, or `None` once the channel is closed and
    /// everything already received has been consumed
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = self.inner.token.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Close this channel. The connection stays usable. Idempotent.
    pub fn close(&self) {
        self.inner.release();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the channel is closed by either side or by its connection
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }
}

impl ChannelInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer_closed = self.token.is_cancelled();
        self.token.cancel();
        debug!(
            "[{}] Channel {} ({}) released",
            self.connection.id(),
            self.id,
            self.service_name
        );
        self.connection.release_channel(self.id, !peer_closed);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("service_name", &self.inner.service_name)
            .field("connection", &self.inner.connection.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
