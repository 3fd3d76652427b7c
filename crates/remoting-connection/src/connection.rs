//! Established connections
//!
//! A [`Connection`] owns two tasks: a writer that drains a single frame
//! queue onto the stream (so frames of one channel keep their order) and a
//! reader that routes inbound frames to channels and answers control
//! messages. Both stop when the connection closes.

use crate::attachments::Attachments;
use crate::channel::Channel;
use crate::endpoint::ServiceTable;
use crate::error::{RemotingError, RemotingResult};
use crate::future::{Completion, IoFuture};
use crate::listener::ChannelOpener;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use remoting_auth::{NegotiatedSession, Principal};
use remoting_proto::{
    decode_message, encode_message, ChannelId, ChannelIdAllocator, ControlMessage, Frame,
    FrameCodec, FrameType, OpenRejection, CONTROL_CHANNEL_ID,
};
use remoting_transport::BoxedStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type FrameSink = SplitSink<Framed<BoxedStream, FrameCodec>, Frame>;
type FrameSource = SplitStream<Framed<BoxedStream, FrameCodec>>;

/// Whether the byte stream under a connection is encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Plaintext,
    Encrypted,
}

/// Everything a connection borrows from the endpoint that produced it
pub(crate) struct ConnectionContext {
    pub local_name: String,
    pub services: Arc<ServiceTable>,
    pub tracker: Weak<DashMap<String, Connection>>,
    pub channel_buffer: usize,
    pub write_queue: usize,
}

struct ChannelSlot {
    service_name: String,
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
    inbound: bool,
}

struct PendingOpen {
    service_name: String,
    completion: Completion<Channel>,
}

struct ConnectionInner {
    id: String,
    local_name: String,
    session: NegotiatedSession,
    peer: String,
    dialer: bool,
    frame_tx: mpsc::Sender<Frame>,
    channels: DashMap<ChannelId, ChannelSlot>,
    pending_opens: DashMap<ChannelId, PendingOpen>,
    ids: ChannelIdAllocator,
    services: Arc<ServiceTable>,
    tracker: Weak<DashMap<String, Connection>>,
    channel_buffer: usize,
    attachments: Attachments,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_reason: OnceLock<String>,
}

/// An authenticated, multiplexed connection between two endpoints
///
/// Cheap to clone; every clone refers to the same connection. Once
/// established the connection is symmetric: either side may open channels.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a negotiated stream and start its reader and writer tasks
    pub(crate) fn establish(
        framed: Framed<BoxedStream, FrameCodec>,
        session: NegotiatedSession,
        context: ConnectionContext,
        dialer: bool,
        peer: String,
    ) -> Connection {
        let id = format!("conn-{}", uuid::Uuid::new_v4());
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(context.write_queue);
        let shutdown = CancellationToken::new();

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: id.clone(),
                local_name: context.local_name,
                session,
                peer,
                dialer,
                frame_tx,
                channels: DashMap::new(),
                pending_opens: DashMap::new(),
                ids: ChannelIdAllocator::new(dialer),
                services: context.services,
                tracker: context.tracker,
                channel_buffer: context.channel_buffer,
                attachments: Attachments::new(),
                shutdown: shutdown.clone(),
                closed: AtomicBool::new(false),
                close_reason: OnceLock::new(),
            }),
        };

        info!(
            "[{}] Connection established with {} ({}, principals: {:?}, {:?})",
            id,
            connection.remote_endpoint(),
            connection.inner.peer,
            connection
                .principals()
                .iter()
                .map(Principal::name)
                .collect::<Vec<_>>(),
            connection.security()
        );

        let (sink, source) = framed.split();

        let writer_token = shutdown.clone();
        let writer_id = id.clone();
        tokio::spawn(async move {
            Self::writer_task(sink, frame_rx, writer_token, writer_id).await;
        });

        let reader = connection.clone();
        tokio::spawn(async move {
            reader.reader_task(source).await;
        });

        connection
    }

    /// Writer task - drains the frame queue onto the stream
    async fn writer_task(
        mut sink: FrameSink,
        mut rx: mpsc::Receiver<Frame>,
        shutdown: CancellationToken,
        conn_id: String,
    ) {
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    trace!(
                        "[{}] Sending frame: channel={}, type={:?}, len={}",
                        conn_id,
                        frame.channel_id,
                        frame.frame_type,
                        frame.payload.len()
                    );
                    if let Err(e) = sink.send(frame).await {
                        error!("[{}] Write error: {}", conn_id, e);
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Whatever was queued before shutdown still goes out
        while let Ok(frame) = rx.try_recv() {
            if sink.send(frame).await.is_err() {
                break;
            }
        }

        if let Err(e) = sink.close().await {
            debug!("[{}] Stream close failed: {}", conn_id, e);
        }
        shutdown.cancel();
        debug!("[{}] Writer task ended", conn_id);
    }

    /// Reader task - routes inbound frames
    async fn reader_task(self, mut source: FrameSource) {
        let reason = loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = self.inner.shutdown.cancelled() => break "shutdown".to_string(),
            };

            match next {
                Some(Ok(frame)) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        warn!("[{}] Protocol error: {}", self.inner.id, e);
                        break e.to_string();
                    }
                }
                Some(Err(e)) => {
                    error!("[{}] Read error: {}", self.inner.id, e);
                    break e.to_string();
                }
                None => break "stream ended".to_string(),
            }
        };

        debug!("[{}] Reader task ended: {}", self.inner.id, reason);
        self.terminate(&reason);
    }

    async fn handle_frame(&self, frame: Frame) -> RemotingResult<()> {
        trace!(
            "[{}] Received frame: channel={}, type={:?}, len={}",
            self.inner.id,
            frame.channel_id,
            frame.frame_type,
            frame.payload.len()
        );

        match (frame.channel_id, frame.frame_type) {
            (CONTROL_CHANNEL_ID, FrameType::Control) => {
                let message: ControlMessage = decode_message(&frame.payload)?;
                self.handle_control(message).await
            }
            (CONTROL_CHANNEL_ID, other) => Err(RemotingError::Protocol(format!(
                "{:?} frame on the control channel",
                other
            ))),
            (channel_id, FrameType::Data) => {
                self.route_data(channel_id, frame.payload);
                Ok(())
            }
            (channel_id, FrameType::Close) => {
                if let Some((_, slot)) = self.inner.channels.remove(&channel_id) {
                    debug!(
                        "[{}] Channel {} ({}) closed by peer",
                        self.inner.id, channel_id, slot.service_name
                    );
                    slot.token.cancel();
                }
                Ok(())
            }
            (channel_id, FrameType::Control) => Err(RemotingError::Protocol(format!(
                "control frame on channel {}",
                channel_id
            ))),
        }
    }

    /// Hand a data frame to its channel without ever waiting on the reader
    fn route_data(&self, channel_id: ChannelId, payload: Bytes) {
        let target = self
            .inner
            .channels
            .get(&channel_id)
            .map(|slot| slot.tx.clone());

        let Some(tx) = target else {
            // Late data for a channel this side already closed
            trace!(
                "[{}] Dropping data for unknown channel {}",
                self.inner.id,
                channel_id
            );
            return;
        };

        match tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.overflow(channel_id),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("[{}] Channel {} receiver dropped", self.inner.id, channel_id);
            }
        }
    }

    /// Close a channel whose reader fell a full queue behind. Other channels
    /// on the connection are unaffected.
    fn overflow(&self, channel_id: ChannelId) {
        let Some((_, slot)) = self.inner.channels.remove(&channel_id) else {
            return;
        };
        warn!(
            "[{}] Channel {} ({}) inbound queue overflowed, closing it",
            self.inner.id, channel_id, slot.service_name
        );
        slot.token.cancel();
        self.send_close(channel_id);
    }

    async fn handle_control(&self, message: ControlMessage) -> RemotingResult<()> {
        match message {
            ControlMessage::OpenChannel {
                channel_id,
                service_name,
            } => self.accept_open(channel_id, service_name).await,
            ControlMessage::OpenChannelAck { channel_id } => {
                match self.inner.pending_opens.remove(&channel_id) {
                    Some((_, pending)) => {
                        let channel =
                            self.register_channel(channel_id, pending.service_name, false);
                        debug!(
                            "[{}] Channel {} ({}) opened",
                            self.inner.id,
                            channel_id,
                            channel.service_name()
                        );
                        pending.completion.complete(Ok(channel));
                    }
                    None => {
                        warn!(
                            "[{}] Ack for channel {} that is not being opened",
                            self.inner.id, channel_id
                        );
                        self.send_frame(Frame::close(channel_id)).await?;
                    }
                }
                Ok(())
            }
            ControlMessage::OpenChannelRejected { channel_id, reason } => {
                if let Some((_, pending)) = self.inner.pending_opens.remove(&channel_id) {
                    debug!(
                        "[{}] Open of {} refused: {:?}",
                        self.inner.id, pending.service_name, reason
                    );
                    let error = match reason {
                        OpenRejection::NoSuchService(name) => RemotingError::NoSuchService(name),
                        OpenRejection::LimitReached(name) => {
                            RemotingError::ServiceUnavailable(name)
                        }
                        OpenRejection::Closing => {
                            RemotingError::ConnectionClosed("peer is closing".to_string())
                        }
                    };
                    pending.completion.complete(Err(error));
                }
                Ok(())
            }
            ControlMessage::CloseConnection { reason } => {
                info!("[{}] Peer closed the connection: {}", self.inner.id, reason);
                self.terminate(&format!("closed by peer: {}", reason));
                Ok(())
            }
        }
    }

    async fn accept_open(&self, channel_id: ChannelId, service_name: String) -> RemotingResult<()> {
        if !self.inner.ids.is_peer_id(channel_id) || self.inner.channels.contains_key(&channel_id)
        {
            return Err(RemotingError::Protocol(format!(
                "peer tried to open channel {} which it does not own",
                channel_id
            )));
        }

        let entry = self
            .inner
            .services
            .get(&service_name)
            .map(|entry| (entry.listener.clone(), entry.options.max_channels));

        let listener = match entry {
            _ if self.is_closed() => {
                return self.reject_open(channel_id, OpenRejection::Closing).await;
            }
            None => {
                return self
                    .reject_open(channel_id, OpenRejection::NoSuchService(service_name))
                    .await;
            }
            Some((_, Some(max))) if self.inbound_count(&service_name) >= max => {
                return self
                    .reject_open(channel_id, OpenRejection::LimitReached(service_name))
                    .await;
            }
            Some((listener, _)) => listener,
        };

        let channel = self.register_channel(channel_id, service_name, true);
        self.send_control(&ControlMessage::OpenChannelAck { channel_id })
            .await?;

        debug!(
            "[{}] Channel {} ({}) accepted",
            self.inner.id,
            channel_id,
            channel.service_name()
        );
        listener.channel_opened(channel);
        Ok(())
    }

    async fn reject_open(
        &self,
        channel_id: ChannelId,
        reason: OpenRejection,
    ) -> RemotingResult<()> {
        debug!(
            "[{}] Refusing channel {}: {:?}",
            self.inner.id, channel_id, reason
        );
        self.send_control(&ControlMessage::OpenChannelRejected { channel_id, reason })
            .await
    }

    fn inbound_count(&self, service_name: &str) -> usize {
        self.inner
            .channels
            .iter()
            .filter(|slot| slot.inbound && slot.service_name == service_name)
            .count()
    }

    fn register_channel(&self, id: ChannelId, service_name: String, inbound: bool) -> Channel {
        let (tx, rx) = mpsc::channel(self.inner.channel_buffer);
        let token = self.inner.shutdown.child_token();
        self.inner.channels.insert(
            id,
            ChannelSlot {
                service_name: service_name.clone(),
                tx,
                token: token.clone(),
                inbound,
            },
        );
        Channel::new(id, service_name, self.clone(), rx, token)
    }

    /// Ask the peer for a channel to `service_name`
    pub fn open_channel(&self, service_name: &str) -> IoFuture<Channel> {
        if self.is_closed() {
            return IoFuture::ready(Err(self.closed_error()));
        }

        let (completion, future) = IoFuture::pair();
        let channel_id = self.allocate_channel_id();
        self.inner.pending_opens.insert(
            channel_id,
            PendingOpen {
                service_name: service_name.to_string(),
                completion,
            },
        );

        // terminate() may have drained the table between the check above
        // and the insert
        if self.is_closed() {
            if let Some((_, pending)) = self.inner.pending_opens.remove(&channel_id) {
                pending.completion.complete(Err(self.closed_error()));
            }
            return future;
        }

        debug!(
            "[{}] Opening channel {} to {}",
            self.inner.id, channel_id, service_name
        );

        let connection = self.clone();
        let message = ControlMessage::OpenChannel {
            channel_id,
            service_name: service_name.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = connection.send_control(&message).await {
                if let Some((_, pending)) = connection.inner.pending_opens.remove(&channel_id) {
                    pending.completion.complete(Err(e));
                }
            }
        });

        future
    }

    fn allocate_channel_id(&self) -> ChannelId {
        loop {
            let id = self.inner.ids.allocate();
            if !self.inner.channels.contains_key(&id) && !self.inner.pending_opens.contains_key(&id)
            {
                return id;
            }
        }
    }

    async fn send_control(&self, message: &ControlMessage) -> RemotingResult<()> {
        let payload = encode_message(message)?;
        self.send_frame(Frame::control(payload)).await
    }

    pub(crate) async fn send_data(&self, channel_id: ChannelId, payload: Bytes) -> RemotingResult<()> {
        self.send_frame(Frame::data(channel_id, payload)).await
    }

    async fn send_frame(&self, frame: Frame) -> RemotingResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner
            .frame_tx
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Forget a channel closed on this side and tell the peer
    pub(crate) fn release_channel(&self, channel_id: ChannelId, notify_peer: bool) {
        self.inner.channels.remove(&channel_id);
        if notify_peer {
            self.send_close(channel_id);
        }
    }

    fn send_close(&self, channel_id: ChannelId) {
        if self.is_closed() {
            return;
        }
        match self.inner.frame_tx.try_send(Frame::close(channel_id)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let tx = self.inner.frame_tx.clone();
                let id = self.inner.id.clone();
                tokio::spawn(async move {
                    if tx.send(frame).await.is_err() {
                        debug!("[{}] Close for channel {} not sent: writer gone", id, channel_id);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Close the connection and every channel on it. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.notify_close("closed by peer endpoint");
        self.terminate("closed locally");
    }

    /// Close after a local protocol failure, telling the peer why
    pub(crate) fn abort(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.notify_close(reason);
        self.terminate(reason);
    }

    fn notify_close(&self, reason: &str) {
        let message = ControlMessage::CloseConnection {
            reason: reason.to_string(),
        };
        let payload = match encode_message(&message) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("[{}] CloseConnection not encodable: {}", self.inner.id, e);
                return;
            }
        };
        if self.inner.frame_tx.try_send(Frame::control(payload)).is_err() {
            debug!("[{}] CloseConnection not queued", self.inner.id);
        }
    }

    /// Tear down local state. Runs once, from close(), the reader or the writer.
    fn terminate(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.close_reason.set(reason.to_string());
        info!("[{}] Connection closed: {}", self.inner.id, reason);

        self.inner.shutdown.cancel();

        let pending: Vec<ChannelId> = self
            .inner
            .pending_opens
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for channel_id in pending {
            if let Some((_, open)) = self.inner.pending_opens.remove(&channel_id) {
                open.completion.complete(Err(self.closed_error()));
            }
        }
        self.inner.channels.clear();

        if let Some(tracker) = self.inner.tracker.upgrade() {
            tracker.remove(&self.inner.id);
        }
    }

    pub(crate) fn closed_error(&self) -> RemotingError {
        RemotingError::ConnectionClosed(
            self.inner
                .close_reason
                .get()
                .cloned()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn local_endpoint(&self) -> &str {
        &self.inner.local_name
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.inner.session.remote_endpoint
    }

    /// Description of the remote transport address
    pub fn peer_address(&self) -> &str {
        &self.inner.peer
    }

    /// Principals established by negotiation; fixed for the connection's life
    pub fn principals(&self) -> &[Principal] {
        &self.inner.session.principals
    }

    pub fn mechanism(&self) -> &str {
        &self.inner.session.mechanism
    }

    pub fn security(&self) -> SecurityState {
        if self.inner.session.encrypted {
            SecurityState::Encrypted
        } else {
            SecurityState::Plaintext
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.security() == SecurityState::Encrypted
    }

    /// Whether this side dialed the connection
    pub fn is_dialer(&self) -> bool {
        self.inner.dialer
    }

    pub fn attachments(&self) -> &Attachments {
        &self.inner.attachments
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }
}

impl ChannelOpener for Connection {
    fn open_channel(&self, service_name: &str) -> IoFuture<Channel> {
        Connection::open_channel(self, service_name)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local_name)
            .field("remote", &self.inner.session.remote_endpoint)
            .field("security", &self.security())
            .field("closed", &self.is_closed())
            .finish()
    }
}
