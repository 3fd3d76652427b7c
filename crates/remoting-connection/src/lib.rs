//! Endpoints, connections and channels
//!
//! An [`Endpoint`] dials and accepts byte streams through pluggable
//! providers, negotiates authentication (and optionally an in-band TLS
//! upgrade) on each, and exposes the result as a [`Connection`]. Any number
//! of named [`Channel`]s are multiplexed over a connection, opened by either
//! side. A [`RequestDispatcher`] layers correlated request/response traffic
//! on top of a channel.
//!
//! ```text
//!  Endpoint ──connect / start_listening──▶ Connection ──open_channel──▶ Channel
//!     │                                        ▲                          │
//!     └──register_service(name, listener) ─────┘          RequestDispatcher
//! ```

pub mod attachments;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod future;
mod handshake;
pub mod listener;

pub use attachments::Attachments;
pub use channel::Channel;
pub use config::{EndpointOptions, ProviderOptions, ServiceOptions};
pub use connection::{Connection, SecurityState};
pub use dispatcher::{
    NotificationHandler, Notifier, RequestContext, RequestDispatcher, RequestHandler,
};
pub use endpoint::{Acceptor, Endpoint, Registration};
pub use error::{RemotingError, RemotingResult};
pub use future::{Completion, IoFuture, Status};
pub use listener::{ChannelOpener, OpenListener};

pub use remoting_auth::{
    CredentialCallback, NameCallback, NegotiationOptions, NoCredentials, PasswordCallback,
    PolicyMode, Principal, ServerAuthConfig, Toggle, TokenCallback, QUIET_LOCAL_AUTH,
};
pub use remoting_transport::{
    MemoryNetwork, MemoryProviderFactory, PeerAddress, ProviderFactory, TcpProviderFactory,
    TlsOptions,
};
