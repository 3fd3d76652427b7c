//! Management bridge over remoting channels
//!
//! Carries registry operations (create, query, attribute access, invoke,
//! notifications) over a channel named `jmx` on any remoting
//! [`Connection`](remoting_connection::Connection). The side holding the
//! registry registers a [`ManagementService`]; the other side opens the
//! channel with a [`ManagementClient`]. Which of the two dialed the
//! connection does not matter.
//!
//! # Example
//!
//! ```ignore
//! use remoting_jmx::{InMemoryRegistry, ManagementClient, ManagementServer, ServerConfig};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! let server = ManagementServer::start(ServerConfig::default(), registry).await?;
//!
//! let connection = client_endpoint
//!     .connect(&server.address(), NegotiationOptions::default(), callback)
//!     .await?;
//! let client = ManagementClient::connect(Arc::new(connection)).await?;
//! let count = client.object_count().await?;
//! ```

pub mod client;
pub mod object_name;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod value;

pub use client::{ManagementClient, NotificationListener};
pub use object_name::{ObjectName, ObjectNameError};
pub use protocol::MANAGEMENT_SERVICE;
pub use registry::{
    AttributeObject, ClassFactory, InMemoryRegistry, ManagedObject, ManagedObjectRegistry,
    Notification, NotificationSink, ObjectInstance, DEFAULT_DOMAIN,
};
pub use server::{ManagementServer, ServerConfig};
pub use service::ManagementService;
pub use value::Value;
