//! Correlated request/response traffic over a channel
//!
//! Each side of a channel may run a [`RequestDispatcher`]. Outbound calls
//! get a correlation id that is unique among the calls still outstanding on
//! the channel; inbound requests are handled concurrently, each in its own
//! task, and answered with the id they arrived with.

use crate::channel::Channel;
use crate::error::{RemotingError, RemotingResult};
use crate::future::{Completion, IoFuture};
use async_trait::async_trait;
use bytes::Bytes;
use remoting_proto::{decode_message, encode_message, Envelope, Fault, FaultKind, Outcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Serves requests arriving on a channel
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        operation: &str,
        payload: Bytes,
        context: &RequestContext,
    ) -> Result<Bytes, Fault>;

    /// The channel closed; no further requests will arrive
    fn on_close(&self, _context: &RequestContext) {}
}

/// Receives notifications pushed by the peer
pub trait NotificationHandler: Send + Sync {
    fn notify(&self, subscription_id: u64, payload: Bytes);
}

impl<F> NotificationHandler for F
where
    F: Fn(u64, Bytes) + Send + Sync,
{
    fn notify(&self, subscription_id: u64, payload: Bytes) {
        self(subscription_id, payload)
    }
}

/// Pushes notifications to the peer of a channel
#[derive(Debug, Clone)]
pub struct Notifier {
    channel: Channel,
}

impl Notifier {
    pub async fn notify(&self, subscription_id: u64, payload: Bytes) -> RemotingResult<()> {
        let envelope = Envelope::Notification {
            subscription_id,
            payload: payload.to_vec(),
        };
        self.channel.send(encode_message(&envelope)?).await
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

/// What a handler knows about the request it is serving
#[derive(Debug, Clone)]
pub struct RequestContext {
    channel: Channel,
    notifier: Notifier,
}

impl RequestContext {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

struct PendingCall {
    operation: String,
    submitted: Instant,
    completion: Completion<Bytes>,
}

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u32, PendingCall>,
    closed: bool,
}

struct DispatcherInner {
    channel: Channel,
    pending: Mutex<PendingCalls>,
    next_id: AtomicU32,
}

/// Request/response multiplexer bound to one channel
///
/// Runs until the channel closes; every call still outstanding then fails.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl RequestDispatcher {
    /// Start dispatching on `channel`. Without a request handler, inbound
    /// requests are answered with an `UnknownOperation` fault.
    pub fn start(
        channel: Channel,
        handler: Option<Arc<dyn RequestHandler>>,
        notifications: Option<Arc<dyn NotificationHandler>>,
    ) -> RequestDispatcher {
        let inner = Arc::new(DispatcherInner {
            channel,
            pending: Mutex::new(PendingCalls::default()),
            next_id: AtomicU32::new(1),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            reader.run(handler, notifications).await;
        });

        RequestDispatcher { inner }
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Handle for pushing notifications to the peer outside of a request
    pub fn notifier(&self) -> Notifier {
        Notifier {
            channel: self.inner.channel.clone(),
        }
    }

    /// Send a request; the returned future resolves with the peer's answer
    pub fn call(&self, operation: &str, payload: Bytes) -> IoFuture<Bytes> {
        let (completion, future) = IoFuture::pair();

        let correlation_id = {
            let mut pending = self.inner.lock();
            if pending.closed {
                drop(pending);
                completion.complete(Err(self.inner.closed_error()));
                return future;
            }
            let id = self.inner.allocate_id(&pending);
            pending.calls.insert(
                id,
                PendingCall {
                    operation: operation.to_string(),
                    submitted: Instant::now(),
                    completion,
                },
            );
            id
        };

        trace!(
            "Channel {}: call {} -> {}",
            self.inner.channel.id(),
            correlation_id,
            operation
        );

        let envelope = Envelope::Request {
            correlation_id,
            operation: operation.to_string(),
            payload: payload.to_vec(),
        };
        let frame = match encode_message(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.fail(correlation_id, e.into());
                return future;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.channel.send(frame).await {
                inner.fail(correlation_id, e);
            }
        });

        future
    }

    /// Send a request and wait for the answer
    pub async fn invoke(&self, operation: &str, payload: Bytes) -> RemotingResult<Bytes> {
        self.call(operation, payload).await
    }

    /// Calls sent and not yet answered
    pub fn pending_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Close the channel; outstanding calls fail with `ChannelClosed`
    pub fn close(&self) {
        self.inner.channel.close();
        self.inner.fail_all(RemotingError::ChannelClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate_id(&self, pending: &PendingCalls) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.calls.contains_key(&id) {
                return id;
            }
        }
    }

    fn closed_error(&self) -> RemotingError {
        let connection = self.channel.connection();
        if connection.is_closed() {
            connection.closed_error()
        } else {
            RemotingError::ChannelClosed
        }
    }

    fn fail(&self, correlation_id: u32, error: RemotingError) {
        let call = self.lock().calls.remove(&correlation_id);
        if let Some(call) = call {
            call.completion.complete(Err(error));
        }
    }

    /// Resolve every outstanding call with `error`; later calls fail at once
    fn fail_all(&self, error: RemotingError) {
        let calls: Vec<PendingCall> = {
            let mut pending = self.lock();
            pending.closed = true;
            pending.calls.drain().map(|(_, call)| call).collect()
        };
        if !calls.is_empty() {
            debug!(
                "Channel {}: failing {} outstanding calls",
                self.channel.id(),
                calls.len()
            );
        }
        for call in calls {
            call.completion.complete(Err(error.clone()));
        }
    }

    async fn run(
        self: Arc<Self>,
        handler: Option<Arc<dyn RequestHandler>>,
        notifications: Option<Arc<dyn NotificationHandler>>,
    ) {
        let context = RequestContext {
            channel: self.channel.clone(),
            notifier: Notifier {
                channel: self.channel.clone(),
            },
        };

        while let Some(message) = self.channel.recv().await {
            let envelope: Envelope = match decode_message(&message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // The stream is out of step; nothing after this can be trusted
                    let reason = format!(
                        "undecodable message on channel {}: {}",
                        self.channel.id(),
                        e
                    );
                    error!("{}", reason);
                    self.fail_all(RemotingError::Protocol(reason.clone()));
                    self.channel.connection().abort(&reason);
                    break;
                }
            };

            match envelope {
                Envelope::Request {
                    correlation_id,
                    operation,
                    payload,
                } => {
                    let handler = handler.clone();
                    let context = context.clone();
                    tokio::spawn(async move {
                        serve(handler, context, correlation_id, operation, payload).await;
                    });
                }
                Envelope::Response {
                    correlation_id,
                    outcome,
                } => self.resolve(correlation_id, outcome),
                Envelope::Notification {
                    subscription_id,
                    payload,
                } => match &notifications {
                    Some(notifications) => notifications.notify(subscription_id, payload.into()),
                    None => debug!(
                        "Channel {}: notification {} ignored, no handler",
                        self.channel.id(),
                        subscription_id
                    ),
                },
            }
        }

        debug!("Channel {}: dispatcher stopped", self.channel.id());
        self.fail_all(self.closed_error());
        if let Some(handler) = handler {
            handler.on_close(&context);
        }
    }

    fn resolve(&self, correlation_id: u32, outcome: Outcome) {
        let call = self.lock().calls.remove(&correlation_id);
        let Some(call) = call else {
            warn!(
                "Channel {}: response {} matches no outstanding call",
                self.channel.id(),
                correlation_id
            );
            return;
        };

        trace!(
            "Channel {}: call {} ({}) answered in {:?}",
            self.channel.id(),
            correlation_id,
            call.operation,
            call.submitted.elapsed()
        );

        let result = match outcome {
            Outcome::Success(payload) => Ok(Bytes::from(payload)),
            Outcome::Fault(fault) => Err(RemotingError::RegistryFault(fault)),
        };
        call.completion.complete(result);
    }
}

async fn serve(
    handler: Option<Arc<dyn RequestHandler>>,
    context: RequestContext,
    correlation_id: u32,
    operation: String,
    payload: Vec<u8>,
) {
    let outcome = match handler {
        Some(handler) => match handler.handle(&operation, payload.into(), &context).await {
            Ok(result) => Outcome::Success(result.to_vec()),
            Err(fault) => {
                debug!("Request {} ({}) faulted: {}", correlation_id, operation, fault);
                Outcome::Fault(fault)
            }
        },
        None => Outcome::Fault(Fault::new(
            FaultKind::UnknownOperation,
            format!("no request handler for {}", operation),
        )),
    };

    let response = Envelope::Response {
        correlation_id,
        outcome,
    };
    match encode_message(&response) {
        Ok(frame) => {
            if let Err(e) = context.channel.send(frame).await {
                debug!("Response {} not delivered: {}", correlation_id, e);
            }
        }
        Err(e) => error!("Response {} could not be encoded: {}", correlation_id, e),
    }
}
