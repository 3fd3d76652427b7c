//! Managed object registry
//!
//! The registry owns named [`ManagedObject`]s and is the only thing the
//! serving side of the bridge talks to. [`InMemoryRegistry`] is the bundled
//! implementation: objects and class factories live in `DashMap`s, and
//! notifications are fanned out to subscriptions keyed by object name.

use crate::object_name::ObjectName;
use crate::value::Value;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remoting_proto::{Fault, FaultKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Domain used by [`InMemoryRegistry::new`]
pub const DEFAULT_DOMAIN: &str = "DefaultDomain";

/// A registered object as seen from outside: its name and class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInstance {
    pub name: ObjectName,
    pub class_name: String,
}

impl ObjectInstance {
    pub fn new(name: ObjectName, class_name: impl Into<String>) -> Self {
        Self {
            name,
            class_name: class_name.into(),
        }
    }
}

/// Event emitted by a registered object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub source: ObjectName,
    /// Increases by one per notification emitted by a registry
    pub sequence: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub message: String,
    pub user_data: Value,
}

/// Something a registry can host
///
/// Every method has a default that reports the member as missing, so an
/// object only implements what it exposes.
pub trait ManagedObject: Send + Sync {
    fn class_name(&self) -> &str;

    fn get_attribute(&self, attribute: &str) -> Result<Value, Fault> {
        Err(Fault::new(FaultKind::AttributeNotFound, attribute))
    }

    fn set_attribute(&self, attribute: &str, _value: Value) -> Result<(), Fault> {
        Err(Fault::new(FaultKind::AttributeNotFound, attribute))
    }

    fn invoke(&self, operation: &str, _args: Vec<Value>) -> Result<Value, Fault> {
        Err(Fault::new(FaultKind::OperationNotFound, operation))
    }
}

/// Builds objects for `create_object`
pub trait ClassFactory: Send + Sync {
    fn instantiate(&self, args: &[Value]) -> Result<Arc<dyn ManagedObject>, Fault>;
}

impl<F> ClassFactory for F
where
    F: Fn(&[Value]) -> Result<Arc<dyn ManagedObject>, Fault> + Send + Sync,
{
    fn instantiate(&self, args: &[Value]) -> Result<Arc<dyn ManagedObject>, Fault> {
        self(args)
    }
}

/// Receives notifications for one subscription
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, subscription_id: u64, notification: Notification);
}

impl<F> NotificationSink for F
where
    F: Fn(u64, Notification) + Send + Sync,
{
    fn deliver(&self, subscription_id: u64, notification: Notification) {
        self(subscription_id, notification)
    }
}

/// The registry operations the bridge maps remote calls onto
pub trait ManagedObjectRegistry: Send + Sync {
    /// Instantiate a registered class and register the result as `name`
    fn create_object(
        &self,
        class_name: &str,
        name: &ObjectName,
        args: &[Value],
    ) -> Result<ObjectInstance, Fault>;

    fn register_object(
        &self,
        name: &ObjectName,
        object: Arc<dyn ManagedObject>,
    ) -> Result<ObjectInstance, Fault>;

    fn unregister(&self, name: &ObjectName) -> Result<(), Fault>;

    fn is_registered(&self, name: &ObjectName) -> bool;

    fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance, Fault>;

    fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value, Fault>;

    fn set_attribute(&self, name: &ObjectName, attribute: &str, value: Value)
        -> Result<(), Fault>;

    fn invoke(&self, name: &ObjectName, operation: &str, args: Vec<Value>)
        -> Result<Value, Fault>;

    /// Names selected by `pattern`, sorted; every name when `None`
    fn query_names(&self, pattern: Option<&ObjectName>) -> Vec<ObjectName>;

    fn object_count(&self) -> usize;

    fn default_domain(&self) -> String;

    /// Deliver notifications emitted by `name` to `sink` until unsubscribed
    fn subscribe(&self, name: &ObjectName, sink: Arc<dyn NotificationSink>)
        -> Result<u64, Fault>;

    fn unsubscribe(&self, subscription_id: u64) -> Result<(), Fault>;
}

struct RegisteredObject {
    class_name: String,
    object: Arc<dyn ManagedObject>,
}

struct Subscription {
    name: ObjectName,
    sink: Arc<dyn NotificationSink>,
}

pub struct InMemoryRegistry {
    default_domain: String,
    objects: DashMap<ObjectName, RegisteredObject>,
    classes: DashMap<String, Arc<dyn ClassFactory>>,
    subscriptions: DashMap<u64, Subscription>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_default_domain(DEFAULT_DOMAIN)
    }

    pub fn with_default_domain(domain: &str) -> Self {
        Self {
            default_domain: domain.to_string(),
            objects: DashMap::new(),
            classes: DashMap::new(),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            sequence: AtomicU64::new(1),
        }
    }

    /// Make `class_name` available to `create_object`; replaces any earlier
    /// factory for the same class
    pub fn register_class(&self, class_name: &str, factory: Arc<dyn ClassFactory>) {
        debug!("Registering class {}", class_name);
        self.classes.insert(class_name.to_string(), factory);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Emit a notification from `source` to its subscribers
    ///
    /// Returns how many subscriptions received it.
    pub fn emit(
        &self,
        source: &ObjectName,
        kind: &str,
        message: &str,
        user_data: Value,
    ) -> Result<usize, Fault> {
        let source = self.qualify(source);
        if !self.objects.contains_key(&source) {
            return Err(Fault::new(FaultKind::InstanceNotFound, source.to_string()));
        }

        let notification = Notification {
            kind: kind.to_string(),
            source: source.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            message: message.to_string(),
            user_data,
        };

        // Collect first so sinks run without holding shard locks
        let targets: Vec<(u64, Arc<dyn NotificationSink>)> = self
            .subscriptions
            .iter()
            .filter(|s| s.name == source)
            .map(|s| (*s.key(), s.sink.clone()))
            .collect();

        trace!(
            "Notification {} from {} to {} subscribers",
            notification.sequence,
            source,
            targets.len()
        );
        for (id, sink) in &targets {
            sink.deliver(*id, notification.clone());
        }
        Ok(targets.len())
    }

    /// Names without a domain live in the default domain
    fn qualify(&self, name: &ObjectName) -> ObjectName {
        if name.domain().is_empty() {
            name.in_domain(&self.default_domain)
        } else {
            name.clone()
        }
    }

    fn lookup(&self, name: &ObjectName) -> Result<Arc<dyn ManagedObject>, Fault> {
        let name = self.qualify(name);
        self.objects
            .get(&name)
            .map(|entry| entry.object.clone())
            .ok_or_else(|| Fault::new(FaultKind::InstanceNotFound, name.to_string()))
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedObjectRegistry for InMemoryRegistry {
    fn create_object(
        &self,
        class_name: &str,
        name: &ObjectName,
        args: &[Value],
    ) -> Result<ObjectInstance, Fault> {
        let factory = self
            .classes
            .get(class_name)
            .map(|f| f.clone())
            .ok_or_else(|| Fault::new(FaultKind::ClassNotFound, class_name))?;

        let object = factory.instantiate(args)?;
        self.register_object(name, object)
    }

    fn register_object(
        &self,
        name: &ObjectName,
        object: Arc<dyn ManagedObject>,
    ) -> Result<ObjectInstance, Fault> {
        if name.is_pattern() {
            return Err(Fault::new(
                FaultKind::MalformedObjectName,
                format!("cannot register a pattern: {}", name),
            ));
        }

        let name = self.qualify(name);
        match self.objects.entry(name.clone()) {
            Entry::Occupied(_) => Err(Fault::new(
                FaultKind::InstanceAlreadyExists,
                name.to_string(),
            )),
            Entry::Vacant(slot) => {
                let class_name = object.class_name().to_string();
                debug!("Registered {} ({})", name, class_name);
                slot.insert(RegisteredObject {
                    class_name: class_name.clone(),
                    object,
                });
                Ok(ObjectInstance::new(name, class_name))
            }
        }
    }

    fn unregister(&self, name: &ObjectName) -> Result<(), Fault> {
        let name = self.qualify(name);
        if self.objects.remove(&name).is_none() {
            return Err(Fault::new(FaultKind::InstanceNotFound, name.to_string()));
        }
        self.subscriptions.retain(|_, s| s.name != name);
        debug!("Unregistered {}", name);
        Ok(())
    }

    fn is_registered(&self, name: &ObjectName) -> bool {
        self.objects.contains_key(&self.qualify(name))
    }

    fn object_instance(&self, name: &ObjectName) -> Result<ObjectInstance, Fault> {
        let name = self.qualify(name);
        self.objects
            .get(&name)
            .map(|entry| ObjectInstance::new(name.clone(), entry.class_name.clone()))
            .ok_or_else(|| Fault::new(FaultKind::InstanceNotFound, name.to_string()))
    }

    fn get_attribute(&self, name: &ObjectName, attribute: &str) -> Result<Value, Fault> {
        self.lookup(name)?.get_attribute(attribute)
    }

    fn set_attribute(
        &self,
        name: &ObjectName,
        attribute: &str,
        value: Value,
    ) -> Result<(), Fault> {
        self.lookup(name)?.set_attribute(attribute, value)
    }

    fn invoke(
        &self,
        name: &ObjectName,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, Fault> {
        self.lookup(name)?.invoke(operation, args)
    }

    fn query_names(&self, pattern: Option<&ObjectName>) -> Vec<ObjectName> {
        let pattern = pattern.map(|p| self.qualify(p));
        let mut names: Vec<ObjectName> = self
            .objects
            .iter()
            .filter(|entry| pattern.as_ref().map_or(true, |p| p.matches(entry.key())))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn default_domain(&self) -> String {
        self.default_domain.clone()
    }

    fn subscribe(
        &self,
        name: &ObjectName,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<u64, Fault> {
        let name = self.qualify(name);
        if !self.objects.contains_key(&name) {
            return Err(Fault::new(FaultKind::InstanceNotFound, name.to_string()));
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        debug!("Subscription {} on {}", id, name);
        self.subscriptions.insert(id, Subscription { name, sink });
        Ok(id)
    }

    fn unsubscribe(&self, subscription_id: u64) -> Result<(), Fault> {
        self.subscriptions
            .remove(&subscription_id)
            .map(|_| ())
            .ok_or_else(|| {
                Fault::new(
                    FaultKind::InvalidArgument,
                    format!("no subscription {}", subscription_id),
                )
            })
    }
}

impl fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRegistry")
            .field("default_domain", &self.default_domain)
            .field("objects", &self.objects.len())
            .field("classes", &self.classes.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// A managed object that is just a bag of attributes
///
/// Supports the operations `attributeNames` (sorted list of attribute
/// names) and `reset` (clears every attribute).
pub struct AttributeObject {
    class_name: String,
    attributes: Mutex<BTreeMap<String, Value>>,
}

impl AttributeObject {
    pub fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            attributes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_attribute(self, name: &str, value: impl Into<Value>) -> Self {
        self.lock().insert(name.to_string(), value.into());
        self
    }

    /// Factory producing empty objects of `class_name`
    pub fn factory(class_name: &str) -> Arc<dyn ClassFactory> {
        let class_name = class_name.to_string();
        Arc::new(
            move |_args: &[Value]| -> Result<Arc<dyn ManagedObject>, Fault> {
                Ok(Arc::new(AttributeObject::new(&class_name)))
            },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ManagedObject for AttributeObject {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn get_attribute(&self, attribute: &str) -> Result<Value, Fault> {
        self.lock()
            .get(attribute)
            .cloned()
            .ok_or_else(|| Fault::new(FaultKind::AttributeNotFound, attribute))
    }

    fn set_attribute(&self, attribute: &str, value: Value) -> Result<(), Fault> {
        self.lock().insert(attribute.to_string(), value);
        Ok(())
    }

    fn invoke(&self, operation: &str, _args: Vec<Value>) -> Result<Value, Fault> {
        match operation {
            "attributeNames" => Ok(Value::List(
                self.lock().keys().map(|k| Value::from(k.as_str())).collect(),
            )),
            "reset" => {
                self.lock().clear();
                Ok(Value::Null)
            }
            _ => Err(Fault::new(FaultKind::OperationNotFound, operation)),
        }
    }
}

impl fmt::Debug for AttributeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeObject")
            .field("class_name", &self.class_name)
            .finish()
    }
}
