//! Serving side of the management bridge

use crate::object_name::ObjectName;
use crate::protocol::{self, encode_result, Arguments};
use crate::registry::{ManagedObjectRegistry, Notification, NotificationSink};
use crate::value::Value;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remoting_connection::{
    Channel, Endpoint, Notifier, OpenListener, Registration, RemotingResult, RequestContext,
    RequestDispatcher, RequestHandler, ServiceOptions,
};
use remoting_proto::{encode_message, Fault, FaultKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Answers management requests against one registry
///
/// Every channel opened to the service gets its own dispatcher; listeners a
/// client adds live as long as its channel.
pub struct ManagementService {
    registry: Arc<dyn ManagedObjectRegistry>,
}

impl ManagementService {
    pub fn new(registry: Arc<dyn ManagedObjectRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn ManagedObjectRegistry> {
        &self.registry
    }

    /// Register under the management service name on `endpoint`
    pub fn register(
        self,
        endpoint: &Endpoint,
        options: ServiceOptions,
    ) -> RemotingResult<Registration> {
        endpoint.register_service(protocol::MANAGEMENT_SERVICE, Arc::new(self), options)
    }
}

impl OpenListener for ManagementService {
    fn channel_opened(&self, channel: Channel) {
        info!(
            "[{}] Management channel {} opened by {}",
            channel.connection().id(),
            channel.id(),
            channel.connection().remote_endpoint()
        );

        let (notifications, pending) = mpsc::unbounded_channel();
        let session: Arc<dyn RequestHandler> = Arc::new(ChannelSession {
            registry: self.registry.clone(),
            listeners: DashMap::new(),
            notifications,
            closed: AtomicBool::new(false),
        });

        let dispatcher = RequestDispatcher::start(channel, Some(session), None);
        tokio::spawn(forward_notifications(dispatcher.notifier(), pending));
    }

    fn registration_terminated(&self) {
        debug!("Management service unregistered");
    }
}

impl fmt::Debug for ManagementService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementService").finish_non_exhaustive()
    }
}

type PendingNotification = (u64, Notification);

/// Per-channel state: which client listener maps to which subscription
struct ChannelSession {
    registry: Arc<dyn ManagedObjectRegistry>,
    /// client listener id -> registry subscription id
    listeners: DashMap<u64, u64>,
    notifications: mpsc::UnboundedSender<PendingNotification>,
    closed: AtomicBool,
}

struct ChannelSink {
    listener_id: u64,
    notifications: mpsc::UnboundedSender<PendingNotification>,
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, _subscription_id: u64, notification: Notification) {
        let _ = self.notifications.send((self.listener_id, notification));
    }
}

impl ChannelSession {
    fn add_listener(&self, name: &ObjectName, listener_id: u64) -> Result<(), Fault> {
        match self.listeners.entry(listener_id) {
            Entry::Occupied(_) => Err(Fault::new(
                FaultKind::InvalidArgument,
                format!("listener {} already added", listener_id),
            )),
            Entry::Vacant(slot) => {
                let sink = Arc::new(ChannelSink {
                    listener_id,
                    notifications: self.notifications.clone(),
                });
                let subscription = self.registry.subscribe(name, sink)?;
                slot.insert(subscription);
                Ok(())
            }
        }?;

        // Lost the race with channel closure
        if self.closed.load(Ordering::Acquire) {
            self.drop_listeners();
        }
        Ok(())
    }

    fn remove_listener(&self, listener_id: u64) -> Result<(), Fault> {
        let (_, subscription) = self.listeners.remove(&listener_id).ok_or_else(|| {
            Fault::new(
                FaultKind::InvalidArgument,
                format!("no listener {}", listener_id),
            )
        })?;
        // Already gone when the object was unregistered
        let _ = self.registry.unsubscribe(subscription);
        Ok(())
    }

    fn drop_listeners(&self) {
        let subscriptions: Vec<u64> = self.listeners.iter().map(|l| *l.value()).collect();
        self.listeners.clear();
        for subscription in subscriptions {
            let _ = self.registry.unsubscribe(subscription);
        }
    }

    fn serve(&self, operation: &str, payload: &[u8]) -> Result<Value, Fault> {
        let mut args = Arguments::decode(operation, payload)?;
        let registry = &self.registry;

        let result = match operation {
            protocol::IS_REGISTERED => Value::Bool(registry.is_registered(&args.next_name()?)),
            protocol::CREATE_OBJECT => {
                let class_name = args.next_text()?;
                let name = args.next_name()?;
                registry
                    .create_object(&class_name, &name, &args.rest())?
                    .into()
            }
            protocol::UNREGISTER => {
                registry.unregister(&args.next_name()?)?;
                Value::Null
            }
            protocol::GET_OBJECT_INSTANCE => registry.object_instance(&args.next_name()?)?.into(),
            protocol::GET_ATTRIBUTE => {
                let name = args.next_name()?;
                let attribute = args.next_text()?;
                registry.get_attribute(&name, &attribute)?
            }
            protocol::SET_ATTRIBUTE => {
                let name = args.next_name()?;
                let attribute = args.next_text()?;
                let value = args.next_value()?;
                registry.set_attribute(&name, &attribute, value)?;
                Value::Null
            }
            protocol::INVOKE => {
                let name = args.next_name()?;
                let target = args.next_text()?;
                registry.invoke(&name, &target, args.rest())?
            }
            protocol::QUERY_NAMES => {
                let pattern = args.next_optional_name()?;
                Value::List(
                    registry
                        .query_names(pattern.as_ref())
                        .into_iter()
                        .map(Value::Name)
                        .collect(),
                )
            }
            protocol::GET_OBJECT_COUNT => Value::Int(registry.object_count() as i64),
            protocol::GET_DEFAULT_DOMAIN => Value::Text(registry.default_domain()),
            protocol::ADD_NOTIFICATION_LISTENER => {
                let name = args.next_name()?;
                let listener_id = args.next_u64()?;
                self.add_listener(&name, listener_id)?;
                Value::Null
            }
            protocol::REMOVE_NOTIFICATION_LISTENER => {
                self.remove_listener(args.next_u64()?)?;
                Value::Null
            }
            other => {
                return Err(Fault::new(
                    FaultKind::UnknownOperation,
                    format!("unknown operation {}", other),
                ))
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl RequestHandler for ChannelSession {
    async fn handle(
        &self,
        operation: &str,
        payload: Bytes,
        _context: &RequestContext,
    ) -> Result<Bytes, Fault> {
        let result = self.serve(operation, &payload)?;
        encode_result(&result)
    }

    fn on_close(&self, context: &RequestContext) {
        self.closed.store(true, Ordering::Release);
        debug!(
            "[{}] Management channel {} closed, dropping {} listeners",
            context.channel().connection().id(),
            context.channel().id(),
            self.listeners.len()
        );
        self.drop_listeners();
    }
}

async fn forward_notifications(
    notifier: Notifier,
    mut pending: mpsc::UnboundedReceiver<PendingNotification>,
) {
    while let Some((listener_id, notification)) = pending.recv().await {
        let payload = match encode_message(&notification) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Notification {} not encodable: {}", notification.sequence, e);
                continue;
            }
        };
        if let Err(e) = notifier.notify(listener_id, payload).await {
            debug!("Notification forwarding stopped: {}", e);
            break;
        }
    }
}
