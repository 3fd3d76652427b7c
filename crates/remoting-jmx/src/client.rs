//! Client side of the management bridge
//!
//! A [`ManagementClient`] turns registry calls into requests on one channel
//! to the peer's `jmx` service. It does not care which side dialed the
//! underlying connection: any [`ChannelOpener`] will do.

use crate::object_name::ObjectName;
use crate::protocol::{self, encode_arguments};
use crate::registry::{Notification, ObjectInstance};
use crate::value::Value;
use bytes::Bytes;
use dashmap::DashMap;
use remoting_connection::{
    ChannelOpener, NotificationHandler, RemotingError, RemotingResult, RequestDispatcher,
};
use remoting_proto::{decode_message, Fault, FaultKind};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives notifications for a listener added through a client
pub trait NotificationListener: Send + Sync {
    fn handle_notification(&self, notification: Notification);
}

impl<F> NotificationListener for F
where
    F: Fn(Notification) + Send + Sync,
{
    fn handle_notification(&self, notification: Notification) {
        self(notification)
    }
}

type ListenerTable = DashMap<u64, Arc<dyn NotificationListener>>;

/// Routes pushed notifications to the listener they were registered for
struct ListenerRouter {
    listeners: Arc<ListenerTable>,
}

impl NotificationHandler for ListenerRouter {
    fn notify(&self, subscription_id: u64, payload: Bytes) {
        let notification: Notification = match decode_message(&payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Undecodable notification for listener {}: {}", subscription_id, e);
                return;
            }
        };

        let listener = self
            .listeners
            .get(&subscription_id)
            .map(|l| l.value().clone());
        match listener {
            Some(listener) => listener.handle_notification(notification),
            None => debug!(
                "Notification {} for removed listener {} dropped",
                notification.sequence, subscription_id
            ),
        }
    }
}

pub struct ManagementClient {
    opener: Arc<dyn ChannelOpener>,
    dispatcher: RequestDispatcher,
    listeners: Arc<ListenerTable>,
    next_listener: AtomicU64,
}

impl ManagementClient {
    /// Open a channel to the management service through `opener`
    pub async fn connect(opener: Arc<dyn ChannelOpener>) -> RemotingResult<Self> {
        let channel = opener.open_channel(protocol::MANAGEMENT_SERVICE).await?;
        debug!(
            "Management channel {} open on {}",
            channel.id(),
            channel.connection().id()
        );

        let listeners: Arc<ListenerTable> = Arc::new(DashMap::new());
        let router: Arc<dyn NotificationHandler> = Arc::new(ListenerRouter {
            listeners: listeners.clone(),
        });
        let dispatcher = RequestDispatcher::start(channel, None, Some(router));

        Ok(Self {
            opener,
            dispatcher,
            listeners,
            next_listener: AtomicU64::new(1),
        })
    }

    /// The channel opener this client was bound to
    pub fn opener(&self) -> &Arc<dyn ChannelOpener> {
        &self.opener
    }

    pub async fn is_registered(&self, name: &ObjectName) -> RemotingResult<bool> {
        let value = self
            .call(protocol::IS_REGISTERED, &[name.clone().into()])
            .await?;
        value
            .as_bool()
            .ok_or_else(|| unexpected(protocol::IS_REGISTERED, &value))
    }

    /// Instantiate `class_name` on the peer and register it as `name`
    pub async fn create_object(
        &self,
        class_name: &str,
        name: &ObjectName,
        args: Vec<Value>,
    ) -> RemotingResult<ObjectInstance> {
        let mut arguments = vec![class_name.into(), name.clone().into()];
        arguments.extend(args);
        let value = self.call(protocol::CREATE_OBJECT, &arguments).await?;
        ObjectInstance::try_from(value).map_err(RemotingError::RegistryFault)
    }

    pub async fn unregister(&self, name: &ObjectName) -> RemotingResult<()> {
        self.call(protocol::UNREGISTER, &[name.clone().into()])
            .await
            .map(|_| ())
    }

    pub async fn object_instance(&self, name: &ObjectName) -> RemotingResult<ObjectInstance> {
        let value = self
            .call(protocol::GET_OBJECT_INSTANCE, &[name.clone().into()])
            .await?;
        ObjectInstance::try_from(value).map_err(RemotingError::RegistryFault)
    }

    pub async fn get_attribute(
        &self,
        name: &ObjectName,
        attribute: &str,
    ) -> RemotingResult<Value> {
        self.call(
            protocol::GET_ATTRIBUTE,
            &[name.clone().into(), attribute.into()],
        )
        .await
    }

    pub async fn set_attribute(
        &self,
        name: &ObjectName,
        attribute: &str,
        value: Value,
    ) -> RemotingResult<()> {
        self.call(
            protocol::SET_ATTRIBUTE,
            &[name.clone().into(), attribute.into(), value],
        )
        .await
        .map(|_| ())
    }

    pub async fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        args: Vec<Value>,
    ) -> RemotingResult<Value> {
        let mut arguments = vec![name.clone().into(), operation.into()];
        arguments.extend(args);
        self.call(protocol::INVOKE, &arguments).await
    }

    /// Names registered on the peer that `pattern` selects; all when `None`
    pub async fn query_names(
        &self,
        pattern: Option<&ObjectName>,
    ) -> RemotingResult<Vec<ObjectName>> {
        let value = self
            .call(protocol::QUERY_NAMES, &[pattern.cloned().into()])
            .await?;
        match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Name(name) => Ok(name),
                    other => Err(unexpected(protocol::QUERY_NAMES, &other)),
                })
                .collect(),
            other => Err(unexpected(protocol::QUERY_NAMES, &other)),
        }
    }

    pub async fn object_count(&self) -> RemotingResult<u64> {
        let value = self.call(protocol::GET_OBJECT_COUNT, &[]).await?;
        match value {
            Value::Int(count) if count >= 0 => Ok(count as u64),
            other => Err(unexpected(protocol::GET_OBJECT_COUNT, &other)),
        }
    }

    pub async fn default_domain(&self) -> RemotingResult<String> {
        match self.call(protocol::GET_DEFAULT_DOMAIN, &[]).await? {
            Value::Text(domain) => Ok(domain),
            other => Err(unexpected(protocol::GET_DEFAULT_DOMAIN, &other)),
        }
    }

    /// Receive notifications emitted by `name`; returns an id for
    /// [`remove_notification_listener`](Self::remove_notification_listener)
    pub async fn add_notification_listener(
        &self,
        name: &ObjectName,
        listener: Arc<dyn NotificationListener>,
    ) -> RemotingResult<u64> {
        // Listener must be routable before the peer can push for it
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);

        let result = self
            .call(
                protocol::ADD_NOTIFICATION_LISTENER,
                &[name.clone().into(), Value::Int(id as i64)],
            )
            .await;
        match result {
            Ok(_) => Ok(id),
            Err(e) => {
                self.listeners.remove(&id);
                Err(e)
            }
        }
    }

    pub async fn remove_notification_listener(&self, listener_id: u64) -> RemotingResult<()> {
        if self.listeners.remove(&listener_id).is_none() {
            return Err(RemotingError::RegistryFault(Fault::new(
                FaultKind::InvalidArgument,
                format!("no listener {}", listener_id),
            )));
        }
        self.call(
            protocol::REMOVE_NOTIFICATION_LISTENER,
            &[Value::Int(listener_id as i64)],
        )
        .await
        .map(|_| ())
    }

    /// Close the management channel; the connection stays open
    pub fn close(&self) {
        self.dispatcher.close();
        self.listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    async fn call(&self, operation: &str, args: &[Value]) -> RemotingResult<Value> {
        let payload = encode_arguments(args).map_err(RemotingError::RegistryFault)?;
        let reply = self.dispatcher.invoke(operation, payload).await?;
        protocol::decode_result(&reply).map_err(RemotingError::RegistryFault)
    }
}

impl Drop for ManagementClient {
    fn drop(&mut self) {
        self.dispatcher.close();
    }
}

impl fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementClient")
            .field("channel", &self.dispatcher.channel().id())
            .field("listeners", &self.listeners.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn unexpected(operation: &str, value: &Value) -> RemotingError {
    RemotingError::Protocol(format!(
        "{} answered with an unexpected {}",
        operation,
        value.type_name()
    ))
}
