//! Authentication mechanisms
//!
//! Each mechanism has a client half, fed by a [`CredentialCallback`], and a
//! server half, fed by [`ServerAuthConfig`]. Both are plain step functions
//! over byte strings; the negotiators move the bytes.

use crate::callback::{Credential, CredentialCallback, UnsupportedCredential};
use crate::error::AuthError;
use crate::jwt::JwtValidator;
use crate::negotiator::Principal;
use crate::password::verify_password;
use crate::policy::{NegotiationOptions, ServerAuthConfig, QUIET_LOCAL_AUTH};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const ANONYMOUS: &str = "ANONYMOUS";
pub const PLAIN: &str = "PLAIN";
pub const LOCAL_USER: &str = "LOCAL-USER";
pub const BEARER: &str = "BEARER";

/// Outcome of one server-side evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismStep {
    Challenge(Vec<u8>),
    Success(Principal),
    Failure(String),
}

/// Client half of a mechanism
pub trait ClientMechanism: Send {
    fn name(&self) -> &'static str;

    /// Data sent along with the mechanism selection
    fn initial_response(&mut self) -> Option<Vec<u8>>;

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError>;
}

/// Server half of a mechanism
pub trait ServerMechanism: Send {
    fn name(&self) -> &'static str;

    /// `response` is the initial response on the first call and the
    /// dialer's answer to the previous challenge afterwards.
    fn evaluate_response(&mut self, response: Option<&[u8]>) -> MechanismStep;
}

/// Instantiate the client half of `name`, collecting its credentials up front.
///
/// Returns `Ok(None)` for mechanisms this crate does not implement.
pub(crate) fn client_mechanism(
    name: &str,
    callback: &dyn CredentialCallback,
    options: &NegotiationOptions,
) -> Result<Option<Box<dyn ClientMechanism>>, UnsupportedCredential> {
    let mechanism: Box<dyn ClientMechanism> = match name {
        ANONYMOUS => {
            let mut slots = [Credential::name("trace", None)];
            callback.handle(&mut slots)?;
            Box::new(AnonymousClient {
                trace: slots[0].require()?.to_string(),
            })
        }
        PLAIN => {
            let mut slots = [Credential::name("username", None), Credential::password("password")];
            callback.handle(&mut slots)?;
            Box::new(PlainClient {
                username: slots[0].require()?.to_string(),
                password: slots[1].require()?.to_string(),
            })
        }
        LOCAL_USER => {
            let username = if options.sasl_flag(QUIET_LOCAL_AUTH) {
                None
            } else {
                let mut slots = [Credential::name("username", None)];
                callback.handle(&mut slots)?;
                Some(slots[0].require()?.to_string())
            };
            Box::new(LocalUserClient { username })
        }
        BEARER => {
            let mut slots = [Credential::bearer_token()];
            callback.handle(&mut slots)?;
            Box::new(BearerClient {
                token: slots[0].require()?.to_string(),
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(mechanism))
}

/// Instantiate the server half of `name` if `config` can verify it
pub(crate) fn server_mechanism(
    name: &str,
    config: &ServerAuthConfig,
) -> Option<Box<dyn ServerMechanism>> {
    if !config.supports(name) {
        return None;
    }
    let mechanism: Box<dyn ServerMechanism> = match name {
        ANONYMOUS => Box::new(AnonymousServer),
        PLAIN => Box::new(PlainServer {
            config: config.clone(),
        }),
        LOCAL_USER => Box::new(LocalUserServer {
            challenge_dir: config.local_user.challenge_dir.clone(),
            default_user: config.local_user.default_user.clone(),
            state: LocalUserState::Start,
        }),
        BEARER => Box::new(BearerServer {
            validator: bearer_validator(config),
        }),
        _ => return None,
    };
    Some(mechanism)
}

fn unexpected_challenge(mechanism: &str) -> AuthError {
    AuthError::Protocol(format!("{} does not expect a challenge", mechanism))
}

// ANONYMOUS

struct AnonymousClient {
    trace: String,
}

impl ClientMechanism for AnonymousClient {
    fn name(&self) -> &'static str {
        ANONYMOUS
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(self.trace.clone().into_bytes())
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(unexpected_challenge(ANONYMOUS))
    }
}

struct AnonymousServer;

impl ServerMechanism for AnonymousServer {
    fn name(&self) -> &'static str {
        ANONYMOUS
    }

    fn evaluate_response(&mut self, response: Option<&[u8]>) -> MechanismStep {
        let trace = response.map(String::from_utf8_lossy).unwrap_or_default();
        debug!("Anonymous login (trace: {})", trace);
        MechanismStep::Success(Principal::anonymous())
    }
}

// PLAIN

struct PlainClient {
    username: String,
    password: String,
}

impl ClientMechanism for PlainClient {
    fn name(&self) -> &'static str {
        PLAIN
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        // authzid NUL authcid NUL passwd, with an empty authzid
        let mut response = Vec::with_capacity(2 + self.username.len() + self.password.len());
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        Some(response)
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(unexpected_challenge(PLAIN))
    }
}

struct PlainServer {
    config: ServerAuthConfig,
}

impl ServerMechanism for PlainServer {
    fn name(&self) -> &'static str {
        PLAIN
    }

    fn evaluate_response(&mut self, response: Option<&[u8]>) -> MechanismStep {
        let Some(response) = response else {
            return MechanismStep::Challenge(Vec::new());
        };

        let parts: Vec<&[u8]> = response.split(|b| *b == 0).collect();
        let [authzid, authcid, password] = parts.as_slice() else {
            return MechanismStep::Failure("malformed PLAIN response".to_string());
        };
        let (Ok(authzid), Ok(authcid), Ok(password)) = (
            std::str::from_utf8(authzid),
            std::str::from_utf8(authcid),
            std::str::from_utf8(password),
        ) else {
            return MechanismStep::Failure("malformed PLAIN response".to_string());
        };

        if !authzid.is_empty() && authzid != authcid {
            return MechanismStep::Failure(format!(
                "{} may not act as {}",
                authcid, authzid
            ));
        }

        let Some(hash) = self.config.users.get(authcid) else {
            return MechanismStep::Failure("invalid username or password".to_string());
        };

        match verify_password(password, hash) {
            Ok(true) => MechanismStep::Success(Principal::new(authcid)),
            Ok(false) => MechanismStep::Failure("invalid username or password".to_string()),
            Err(e) => {
                warn!("Stored hash for {} is unusable: {}", authcid, e);
                MechanismStep::Failure("invalid username or password".to_string())
            }
        }
    }
}

// LOCAL-USER
//
// The server writes a random nonce to a file only readable on its host and
// sends the path; the client proves it shares the host by echoing the nonce.
// The client only ever answers with something shaped like a nonce, never with
// arbitrary file contents.

/// File name prefix of every challenge file
const CHALLENGE_PREFIX: &str = ".remoting-challenge-";

/// Hex encoding of a 32 byte nonce
const NONCE_LEN: usize = 64;

struct LocalUserClient {
    username: Option<String>,
}

impl ClientMechanism for LocalUserClient {
    fn name(&self) -> &'static str {
        LOCAL_USER
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(
            self.username
                .as_deref()
                .unwrap_or_default()
                .as_bytes()
                .to_vec(),
        )
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        let path = std::str::from_utf8(challenge).map_err(|_| {
            AuthError::Authentication("local challenge path is not UTF-8".to_string())
        })?;
        read_challenge(Path::new(path))
    }
}

fn read_challenge(path: &Path) -> Result<Vec<u8>, AuthError> {
    let refuse = |reason: &str| {
        AuthError::Authentication(format!(
            "refusing local challenge {}: {}",
            path.display(),
            reason
        ))
    };

    let is_challenge_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(CHALLENGE_PREFIX));
    if !path.is_absolute() || !is_challenge_name {
        return Err(refuse("not a challenge file"));
    }

    let file = File::open(path).map_err(|e| refuse(&e.to_string()))?;
    let metadata = file.metadata().map_err(|e| refuse(&e.to_string()))?;
    if !metadata.is_file() {
        return Err(refuse("not a regular file"));
    }

    // One byte past the nonce tells an oversized file apart
    let mut nonce = Vec::with_capacity(NONCE_LEN + 1);
    file.take(NONCE_LEN as u64 + 1)
        .read_to_end(&mut nonce)
        .map_err(|e| refuse(&e.to_string()))?;
    if nonce.len() != NONCE_LEN || !nonce.iter().all(u8::is_ascii_hexdigit) {
        return Err(refuse("malformed nonce"));
    }
    Ok(nonce)
}

enum LocalUserState {
    Start,
    Challenged {
        // Removed from disk when dropped
        _file: NamedTempFile,
        nonce: Vec<u8>,
        user: String,
    },
    Done,
}

struct LocalUserServer {
    challenge_dir: Option<String>,
    default_user: String,
    state: LocalUserState,
}

impl LocalUserServer {
    fn write_challenge(&self) -> std::io::Result<(NamedTempFile, Vec<u8>)> {
        let nonce: [u8; 32] = rand::random();
        let nonce: Vec<u8> = nonce
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
            .into_bytes();

        let mut builder = tempfile::Builder::new();
        builder.prefix(CHALLENGE_PREFIX);
        let mut file = match &self.challenge_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(&nonce)?;
        file.flush()?;

        Ok((file, nonce))
    }
}

impl ServerMechanism for LocalUserServer {
    fn name(&self) -> &'static str {
        LOCAL_USER
    }

    fn evaluate_response(&mut self, response: Option<&[u8]>) -> MechanismStep {
        match std::mem::replace(&mut self.state, LocalUserState::Done) {
            LocalUserState::Start => {
                let user = response
                    .map(String::from_utf8_lossy)
                    .filter(|name| !name.is_empty())
                    .map(|name| name.into_owned())
                    .unwrap_or_else(|| self.default_user.clone());

                match self.write_challenge() {
                    Ok((file, nonce)) => {
                        let path = file.path().to_string_lossy().into_owned();
                        debug!("Issued local challenge for {} at {}", user, path);
                        self.state = LocalUserState::Challenged {
                            _file: file,
                            nonce,
                            user,
                        };
                        MechanismStep::Challenge(path.into_bytes())
                    }
                    Err(e) => MechanismStep::Failure(format!(
                        "cannot create local challenge: {}",
                        e
                    )),
                }
            }
            LocalUserState::Challenged { nonce, user, .. } => match response {
                Some(answer) if answer == nonce.as_slice() => {
                    MechanismStep::Success(Principal::new(user))
                }
                _ => MechanismStep::Failure("local challenge mismatch".to_string()),
            },
            LocalUserState::Done => {
                MechanismStep::Failure("mechanism already completed".to_string())
            }
        }
    }
}

// BEARER

struct BearerClient {
    token: String,
}

impl ClientMechanism for BearerClient {
    fn name(&self) -> &'static str {
        BEARER
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(self.token.clone().into_bytes())
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(unexpected_challenge(BEARER))
    }
}

struct BearerServer {
    validator: JwtValidator,
}

fn bearer_validator(config: &ServerAuthConfig) -> JwtValidator {
    let secret = config.jwt_secret.as_deref().unwrap_or_default();
    let mut validator = JwtValidator::new(secret.as_bytes());
    if let Some(issuer) = &config.jwt_issuer {
        validator = validator.with_issuer(issuer.clone());
    }
    if let Some(audience) = &config.jwt_audience {
        validator = validator.with_audience(audience.clone());
    }
    validator
}

impl ServerMechanism for BearerServer {
    fn name(&self) -> &'static str {
        BEARER
    }

    fn evaluate_response(&mut self, response: Option<&[u8]>) -> MechanismStep {
        let Some(token) = response.and_then(|r| std::str::from_utf8(r).ok()) else {
            return MechanismStep::Failure("missing bearer token".to_string());
        };

        match self.validator.validate(token) {
            Ok(claims) => MechanismStep::Success(Principal::new(claims.sub)),
            Err(e) => MechanismStep::Failure(e.to_string()),
        }
    }
}
