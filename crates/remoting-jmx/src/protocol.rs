//! Operation names and payload encoding of management calls
//!
//! A request payload is a bincode `Vec<Value>` of arguments; a successful
//! response payload is a single bincode `Value`.

use crate::object_name::ObjectName;
use crate::registry::ObjectInstance;
use crate::value::Value;
use bytes::Bytes;
use remoting_proto::{decode_message, encode_message, Fault, FaultKind};

/// Service name the bridge registers and opens channels to
pub const MANAGEMENT_SERVICE: &str = "jmx";

pub const IS_REGISTERED: &str = "isRegistered";
pub const CREATE_OBJECT: &str = "createObject";
pub const UNREGISTER: &str = "unregister";
pub const GET_OBJECT_INSTANCE: &str = "getObjectInstance";
pub const GET_ATTRIBUTE: &str = "getAttribute";
pub const SET_ATTRIBUTE: &str = "setAttribute";
pub const INVOKE: &str = "invoke";
pub const QUERY_NAMES: &str = "queryNames";
pub const GET_OBJECT_COUNT: &str = "getObjectCount";
pub const GET_DEFAULT_DOMAIN: &str = "getDefaultDomain";
pub const ADD_NOTIFICATION_LISTENER: &str = "addNotificationListener";
pub const REMOVE_NOTIFICATION_LISTENER: &str = "removeNotificationListener";

pub fn encode_arguments(args: &[Value]) -> Result<Bytes, Fault> {
    encode_message(&args).map_err(|e| Fault::new(FaultKind::Decode, e.to_string()))
}

pub fn encode_result(value: &Value) -> Result<Bytes, Fault> {
    encode_message(value).map_err(|e| Fault::new(FaultKind::Decode, e.to_string()))
}

pub fn decode_result(payload: &[u8]) -> Result<Value, Fault> {
    decode_message(payload).map_err(|e| Fault::new(FaultKind::Decode, e.to_string()))
}

impl From<ObjectInstance> for Value {
    fn from(instance: ObjectInstance) -> Self {
        Value::List(vec![
            Value::Name(instance.name),
            Value::Text(instance.class_name),
        ])
    }
}

impl TryFrom<Value> for ObjectInstance {
    type Error = Fault;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::List(items) => match <[Value; 2]>::try_from(items) {
                Ok([Value::Name(name), Value::Text(class_name)]) => {
                    Ok(ObjectInstance::new(name, class_name))
                }
                _ => Err(Fault::new(
                    FaultKind::Decode,
                    "malformed object instance",
                )),
            },
            other => Err(Fault::new(
                FaultKind::Decode,
                format!("expected an object instance, got {}", other.type_name()),
            )),
        }
    }
}

/// Positional arguments of one request
pub struct Arguments {
    operation: String,
    values: std::vec::IntoIter<Value>,
    position: usize,
}

impl Arguments {
    pub fn decode(operation: &str, payload: &[u8]) -> Result<Self, Fault> {
        let values: Vec<Value> = decode_message(payload).map_err(|e| {
            Fault::new(
                FaultKind::Decode,
                format!("{}: undecodable arguments: {}", operation, e),
            )
        })?;
        Ok(Self {
            operation: operation.to_string(),
            values: values.into_iter(),
            position: 0,
        })
    }

    pub fn next_value(&mut self) -> Result<Value, Fault> {
        self.position += 1;
        self.values.next().ok_or_else(|| {
            Fault::new(
                FaultKind::InvalidArgument,
                format!("{}: missing argument {}", self.operation, self.position),
            )
        })
    }

    pub fn next_name(&mut self) -> Result<ObjectName, Fault> {
        match self.next_value()? {
            Value::Name(name) => Ok(name),
            Value::Text(text) => Ok(ObjectName::parse(&text)?),
            other => Err(self.mismatch("object name", &other)),
        }
    }

    /// An object name or null
    pub fn next_optional_name(&mut self) -> Result<Option<ObjectName>, Fault> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Name(name) => Ok(Some(name)),
            Value::Text(text) => Ok(Some(ObjectName::parse(&text)?)),
            other => Err(self.mismatch("object name", &other)),
        }
    }

    pub fn next_text(&mut self) -> Result<String, Fault> {
        match self.next_value()? {
            Value::Text(text) => Ok(text),
            other => Err(self.mismatch("text", &other)),
        }
    }

    pub fn next_u64(&mut self) -> Result<u64, Fault> {
        match self.next_value()? {
            Value::Int(i) if i >= 0 => Ok(i as u64),
            other => Err(self.mismatch("non-negative int", &other)),
        }
    }

    /// Whatever arguments are left
    pub fn rest(self) -> Vec<Value> {
        self.values.collect()
    }

    fn mismatch(&self, expected: &str, got: &Value) -> Fault {
        Fault::new(
            FaultKind::InvalidArgument,
            format!(
                "{}: argument {} must be {}, got {}",
                self.operation,
                self.position,
                expected,
                got.type_name()
            ),
        )
    }
}
