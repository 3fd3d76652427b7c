//! Authentication negotiation for remoting connections
//!
//! Everything here is transport-free: [`ClientNegotiator`] and
//! [`ServerNegotiator`] consume and produce
//! [`HandshakeMessage`](remoting_proto::HandshakeMessage)s and leave the
//! actual reads, writes and TLS upgrade to the caller.

pub mod callback;
pub mod error;
pub mod jwt;
pub mod mechanism;
pub mod negotiator;
pub mod password;
pub mod policy;

pub use callback::{
    Credential, CredentialCallback, NameCallback, NoCredentials, PasswordCallback, TokenCallback,
    UnsupportedCredential,
};
pub use error::AuthError;
pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use mechanism::{
    ClientMechanism, MechanismStep, ServerMechanism, ANONYMOUS, BEARER, LOCAL_USER, PLAIN,
};
pub use negotiator::{
    ClientAction, ClientNegotiator, ClientState, NegotiatedSession, Principal, ServerAction,
    ServerNegotiator, ServerState, MAX_AUTH_ATTEMPTS,
};
pub use password::{hash_password, verify_password, PasswordError};
pub use policy::{
    LocalUserConfig, NegotiationOptions, PolicyMode, ServerAuthConfig, Toggle, QUIET_LOCAL_AUTH,
};
