//! Negotiation state machines
//!
//! ```text
//! INIT → MECH_OFFER → MECH_SELECT → CHALLENGE_RESPONSE* → [STARTTLS_UPGRADE] → AUTHENTICATED
//!   └──────────────────────────── any ───────────────────────────────────────→ FAILED
//! ```
//!
//! Neither negotiator performs I/O on the connection. The caller feeds each
//! received [`HandshakeMessage`] in and acts on the returned action; when an
//! action asks for a TLS upgrade the caller wraps the stream and then calls
//! `upgrade_complete`.

use crate::callback::CredentialCallback;
use crate::error::AuthError;
use crate::mechanism::{
    client_mechanism, server_mechanism, ClientMechanism, MechanismStep, ServerMechanism, ANONYMOUS,
};
use crate::policy::{forbidden_by, NegotiationOptions, ServerAuthConfig};
use remoting_proto::{HandshakeMessage, PolicyFlags, RejectKind, TlsOffer, PROTOCOL_VERSION};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Failed mechanism attempts tolerated per negotiation
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// An authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Result of a successful negotiation, identical on both sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub remote_endpoint: String,
    pub principals: Vec<Principal>,
    pub mechanism: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    MechOffer,
    MechSelect,
    ChallengeResponse,
    StartTlsUpgrade,
    Authenticated,
    Failed,
}

/// What the dialing side must do next
#[derive(Debug)]
pub enum ClientAction {
    Send(HandshakeMessage),
    /// Wrap the stream in TLS, then call [`ClientNegotiator::upgrade_complete`]
    StartTls,
    Complete(NegotiatedSession),
}

/// Dialing side of a negotiation
pub struct ClientNegotiator {
    state: ClientState,
    local_name: String,
    options: NegotiationOptions,
    callback: Arc<dyn CredentialCallback>,
    remote_name: String,
    policy: PolicyFlags,
    candidates: VecDeque<String>,
    policy_excluded: bool,
    last_error: Option<String>,
    current: Option<Box<dyn ClientMechanism>>,
    start_tls: bool,
    attempts: u32,
    pending: Option<NegotiatedSession>,
}

impl ClientNegotiator {
    pub fn new(
        local_name: impl Into<String>,
        options: NegotiationOptions,
        callback: Arc<dyn CredentialCallback>,
    ) -> Self {
        Self {
            state: ClientState::Init,
            local_name: local_name.into(),
            policy: options.policy(),
            options,
            callback,
            remote_name: String::new(),
            candidates: VecDeque::new(),
            policy_excluded: false,
            last_error: None,
            current: None,
            start_tls: false,
            attempts: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Combined policy, valid once the greeting has been seen
    pub fn policy(&self) -> PolicyFlags {
        self.policy
    }

    /// Feed one message from the acceptor
    pub fn handle(&mut self, message: HandshakeMessage) -> Result<ClientAction, AuthError> {
        let result = self.transition(message);
        if result.is_err() {
            self.state = ClientState::Failed;
            self.current = None;
        }
        result
    }

    /// The TLS upgrade requested by [`ClientAction::StartTls`] finished
    pub fn upgrade_complete(&mut self) -> Result<NegotiatedSession, AuthError> {
        if self.state != ClientState::StartTlsUpgrade {
            self.state = ClientState::Failed;
            return Err(AuthError::Protocol(
                "no TLS upgrade in progress".to_string(),
            ));
        }
        match self.pending.take() {
            Some(session) => {
                self.state = ClientState::Authenticated;
                Ok(session)
            }
            None => {
                self.state = ClientState::Failed;
                Err(AuthError::Protocol("no pending session".to_string()))
            }
        }
    }

    fn transition(&mut self, message: HandshakeMessage) -> Result<ClientAction, AuthError> {
        match (self.state, message) {
            (
                ClientState::Init,
                HandshakeMessage::Greeting {
                    version,
                    endpoint_name,
                    mechanisms,
                    policy,
                    tls,
                },
            ) => {
                if version != PROTOCOL_VERSION {
                    return Err(AuthError::Protocol(format!(
                        "unsupported protocol version {}",
                        version
                    )));
                }
                self.remote_name = endpoint_name;
                self.state = ClientState::MechOffer;
                self.on_offer(mechanisms, policy, tls)?;
                self.select_next()
            }
            (
                ClientState::MechSelect | ClientState::ChallengeResponse,
                HandshakeMessage::AuthChallenge { data },
            ) => {
                let mechanism = self
                    .current
                    .as_mut()
                    .ok_or_else(|| AuthError::Protocol("no mechanism selected".to_string()))?;
                let name = mechanism.name();
                self.state = ClientState::ChallengeResponse;
                match mechanism.evaluate_challenge(&data) {
                    Ok(response) => Ok(ClientAction::Send(HandshakeMessage::AuthResponse {
                        data: response,
                    })),
                    Err(AuthError::Protocol(reason)) => Err(AuthError::Protocol(reason)),
                    Err(e) => {
                        // The rejection that follows moves on to the next candidate
                        debug!("Abandoning {} with {}: {}", name, self.remote_name, e);
                        self.last_error = Some(format!("{}: {}", name, e));
                        Ok(ClientAction::Send(HandshakeMessage::AuthAbort {
                            reason: format!("{} failed on the dialing side", name),
                        }))
                    }
                }
            }
            (
                ClientState::MechSelect | ClientState::ChallengeResponse,
                HandshakeMessage::AuthSuccess { principal, upgrade },
            ) => {
                if upgrade != self.start_tls {
                    return Err(AuthError::Protocol(format!(
                        "peer answered upgrade={} to a request with start_tls={}",
                        upgrade, self.start_tls
                    )));
                }
                let mechanism = self
                    .current
                    .take()
                    .map(|m| m.name())
                    .unwrap_or(ANONYMOUS)
                    .to_string();
                let session = NegotiatedSession {
                    remote_endpoint: self.remote_name.clone(),
                    principals: vec![Principal::new(principal)],
                    mechanism,
                    encrypted: upgrade,
                };
                info!(
                    "Authenticated to {} via {} as {}",
                    session.remote_endpoint, session.mechanism, session.principals[0]
                );

                if upgrade {
                    self.state = ClientState::StartTlsUpgrade;
                    self.pending = Some(session);
                    Ok(ClientAction::StartTls)
                } else {
                    self.state = ClientState::Authenticated;
                    Ok(ClientAction::Complete(session))
                }
            }
            (
                ClientState::MechSelect | ClientState::ChallengeResponse,
                HandshakeMessage::AuthRejected { reason, kind },
            ) => {
                let mechanism = self.current.take().map(|m| m.name()).unwrap_or("?");
                debug!("{} rejected by {}: {}", mechanism, self.remote_name, reason);
                match kind {
                    RejectKind::Retry => {
                        self.attempts += 1;
                        self.last_error = Some(reason.clone());
                        if self.attempts >= MAX_AUTH_ATTEMPTS {
                            return Err(AuthError::Authentication(reason));
                        }
                        self.select_next()
                    }
                    RejectKind::Policy => Err(AuthError::PolicyViolation(reason)),
                    RejectKind::Fatal => Err(AuthError::Authentication(reason)),
                }
            }
            (state, other) => Err(AuthError::Protocol(format!(
                "unexpected {} in state {:?}",
                other.kind(),
                state
            ))),
        }
    }

    fn on_offer(
        &mut self,
        offered: Vec<String>,
        peer_policy: PolicyFlags,
        tls: TlsOffer,
    ) -> Result<(), AuthError> {
        self.policy = self.options.policy().merge(peer_policy);
        self.start_tls = self.options.wants_starttls() && tls.available;

        if self.options.wants_starttls() && !tls.available {
            debug!(
                "{} offers no in-band TLS; continuing unencrypted",
                self.remote_name
            );
        }
        if !self.start_tls && (self.policy.no_plaintext || tls.required) {
            return Err(AuthError::PolicyViolation(format!(
                "an encrypted connection to {} is required but no TLS upgrade was negotiated",
                self.remote_name
            )));
        }

        for name in self.options.preference() {
            if !offered.contains(&name) {
                continue;
            }
            if forbidden_by(self.policy, &name) {
                debug!("{} excluded by policy", name);
                self.policy_excluded = true;
                continue;
            }
            self.candidates.push_back(name);
        }
        Ok(())
    }

    fn select_next(&mut self) -> Result<ClientAction, AuthError> {
        while let Some(name) = self.candidates.pop_front() {
            match client_mechanism(&name, self.callback.as_ref(), &self.options) {
                Ok(Some(mut mechanism)) => {
                    debug!("Selected mechanism {} for {}", name, self.remote_name);
                    let initial_response = mechanism.initial_response();
                    self.current = Some(mechanism);
                    self.state = ClientState::MechSelect;
                    return Ok(ClientAction::Send(HandshakeMessage::AuthRequest {
                        endpoint_name: self.local_name.clone(),
                        mechanism: name,
                        initial_response,
                        start_tls: self.start_tls,
                    }));
                }
                Ok(None) => continue,
                Err(unsupported) => {
                    debug!("Skipping {}: {}", name, unsupported);
                    self.last_error = Some(format!("{}: {}", name, unsupported));
                }
            }
        }

        if self.policy_excluded {
            Err(AuthError::PolicyViolation(
                "every remaining mechanism is forbidden by policy".to_string(),
            ))
        } else {
            Err(AuthError::Authentication(self.last_error.take().unwrap_or_else(
                || "no mutually acceptable mechanism".to_string(),
            )))
        }
    }
}

impl fmt::Debug for ClientNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientNegotiator")
            .field("state", &self.state)
            .field("local_name", &self.local_name)
            .field("remote_name", &self.remote_name)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    MechOffer,
    MechSelect,
    ChallengeResponse,
    StartTlsUpgrade,
    Authenticated,
    Failed,
}

/// What the accepting side must do next
#[derive(Debug)]
pub enum ServerAction {
    Send(HandshakeMessage),
    /// Send, then wrap the stream in TLS and call
    /// [`ServerNegotiator::upgrade_complete`]
    SendThenStartTls(HandshakeMessage),
    SendThenComplete(HandshakeMessage, NegotiatedSession),
    /// Send (best effort), then drop the stream
    Fail(HandshakeMessage, AuthError),
}

/// Accepting side of a negotiation
pub struct ServerNegotiator {
    state: ServerState,
    local_name: String,
    policy: PolicyFlags,
    config: Arc<ServerAuthConfig>,
    tls_available: bool,
    remote_name: String,
    current: Option<Box<dyn ServerMechanism>>,
    start_tls: bool,
    attempts: u32,
    pending: Option<NegotiatedSession>,
}

impl ServerNegotiator {
    pub fn new(
        local_name: impl Into<String>,
        options: &NegotiationOptions,
        config: Arc<ServerAuthConfig>,
        tls_available: bool,
    ) -> Self {
        Self {
            state: ServerState::Init,
            local_name: local_name.into(),
            policy: options.policy(),
            config,
            tls_available,
            remote_name: String::new(),
            current: None,
            start_tls: false,
            attempts: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Mechanisms this side offers: configured, usable and allowed by policy
    pub fn offered_mechanisms(&self) -> Vec<String> {
        self.config
            .mechanisms
            .iter()
            .filter(|m| self.config.supports(m) && !forbidden_by(self.policy, m))
            .cloned()
            .collect()
    }

    /// Opening message; moves to MECH_OFFER
    pub fn greeting(&mut self) -> HandshakeMessage {
        self.state = ServerState::MechOffer;
        HandshakeMessage::Greeting {
            version: PROTOCOL_VERSION,
            endpoint_name: self.local_name.clone(),
            mechanisms: self.offered_mechanisms(),
            policy: self.policy,
            tls: TlsOffer {
                available: self.tls_available,
                required: self.policy.no_plaintext,
            },
        }
    }

    /// Feed one message from the dialer
    pub fn handle(&mut self, message: HandshakeMessage) -> ServerAction {
        match (self.state, message) {
            (
                ServerState::MechOffer,
                HandshakeMessage::AuthRequest {
                    endpoint_name,
                    mechanism,
                    initial_response,
                    start_tls,
                },
            ) => {
                self.remote_name = endpoint_name;
                self.on_request(mechanism, initial_response, start_tls)
            }
            (ServerState::ChallengeResponse, HandshakeMessage::AuthResponse { data }) => {
                self.evaluate(Some(&data))
            }
            (ServerState::ChallengeResponse, HandshakeMessage::AuthAbort { reason }) => {
                self.current = None;
                self.reject(reason)
            }
            (state, other) => self.fail(
                RejectKind::Fatal,
                AuthError::Protocol(format!("unexpected {} in state {:?}", other.kind(), state)),
            ),
        }
    }

    /// The TLS upgrade requested by [`ServerAction::SendThenStartTls`] finished
    pub fn upgrade_complete(&mut self) -> Result<NegotiatedSession, AuthError> {
        match (self.state, self.pending.take()) {
            (ServerState::StartTlsUpgrade, Some(session)) => {
                self.state = ServerState::Authenticated;
                Ok(session)
            }
            _ => {
                self.state = ServerState::Failed;
                Err(AuthError::Protocol("no TLS upgrade in progress".to_string()))
            }
        }
    }

    fn on_request(
        &mut self,
        mechanism: String,
        initial_response: Option<Vec<u8>>,
        start_tls: bool,
    ) -> ServerAction {
        self.state = ServerState::MechSelect;

        if start_tls && !self.tls_available {
            return self.fail(
                RejectKind::Fatal,
                AuthError::Protocol("in-band TLS is not available".to_string()),
            );
        }

        if forbidden_by(self.policy, &mechanism) {
            return self.fail(
                RejectKind::Policy,
                AuthError::PolicyViolation(format!("{} is not permitted", mechanism)),
            );
        }

        if self.policy.no_plaintext && !start_tls {
            return self.fail(
                RejectKind::Policy,
                AuthError::PolicyViolation("unencrypted connections are not permitted".to_string()),
            );
        }

        let offered = self.offered_mechanisms();
        let selected = if offered.contains(&mechanism) {
            server_mechanism(&mechanism, &self.config)
        } else {
            None
        };
        let Some(selected) = selected else {
            return self.reject(format!("{} is not offered", mechanism));
        };

        debug!(
            "{} selected {} (start_tls={})",
            self.remote_name, mechanism, start_tls
        );
        self.start_tls = start_tls;
        self.current = Some(selected);
        self.evaluate(initial_response.as_deref())
    }

    fn evaluate(&mut self, response: Option<&[u8]>) -> ServerAction {
        let Some(mechanism) = self.current.as_mut() else {
            return self.fail(
                RejectKind::Fatal,
                AuthError::Protocol("no mechanism selected".to_string()),
            );
        };
        let mechanism_name = mechanism.name();

        match mechanism.evaluate_response(response) {
            MechanismStep::Challenge(data) => {
                self.state = ServerState::ChallengeResponse;
                ServerAction::Send(HandshakeMessage::AuthChallenge { data })
            }
            MechanismStep::Success(principal) => {
                self.current = None;
                info!(
                    "{} authenticated via {} as {}",
                    self.remote_name, mechanism_name, principal
                );
                let reply = HandshakeMessage::AuthSuccess {
                    principal: principal.name().to_string(),
                    upgrade: self.start_tls,
                };
                let session = NegotiatedSession {
                    remote_endpoint: self.remote_name.clone(),
                    principals: vec![principal],
                    mechanism: mechanism_name.to_string(),
                    encrypted: self.start_tls,
                };
                if self.start_tls {
                    self.state = ServerState::StartTlsUpgrade;
                    self.pending = Some(session);
                    ServerAction::SendThenStartTls(reply)
                } else {
                    self.state = ServerState::Authenticated;
                    ServerAction::SendThenComplete(reply, session)
                }
            }
            MechanismStep::Failure(reason) => {
                self.current = None;
                self.reject(reason)
            }
        }
    }

    /// A failed attempt; the dialer may retry until the limit is reached
    fn reject(&mut self, reason: String) -> ServerAction {
        self.attempts += 1;
        warn!(
            "Authentication attempt {} from {} failed: {}",
            self.attempts, self.remote_name, reason
        );
        if self.attempts >= MAX_AUTH_ATTEMPTS {
            return self.fail(RejectKind::Fatal, AuthError::Authentication(reason));
        }
        self.state = ServerState::MechOffer;
        ServerAction::Send(HandshakeMessage::AuthRejected {
            reason,
            kind: RejectKind::Retry,
        })
    }

    fn fail(&mut self, kind: RejectKind, error: AuthError) -> ServerAction {
        self.state = ServerState::Failed;
        self.current = None;
        let reason = match &error {
            AuthError::Authentication(reason)
            | AuthError::PolicyViolation(reason)
            | AuthError::Protocol(reason)
            | AuthError::Configuration(reason) => reason.clone(),
            other => other.to_string(),
        };
        ServerAction::Fail(HandshakeMessage::AuthRejected { reason, kind }, error)
    }
}

impl fmt::Debug for ServerNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerNegotiator")
            .field("state", &self.state)
            .field("local_name", &self.local_name)
            .field("remote_name", &self.remote_name)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{NameCallback, NoCredentials, PasswordCallback};
    use crate::mechanism::{LOCAL_USER, PLAIN};
    use crate::password::hash_password;
    use crate::policy::{PolicyMode, QUIET_LOCAL_AUTH};

    fn client(options: NegotiationOptions, callback: impl CredentialCallback + 'static) -> ClientNegotiator {
        ClientNegotiator::new("client", options, Arc::new(callback))
    }

    fn server(options: NegotiationOptions, config: ServerAuthConfig, tls: bool) -> ServerNegotiator {
        ServerNegotiator::new("server", &options, Arc::new(config), tls)
    }

    enum Outcome {
        Done(NegotiatedSession, NegotiatedSession),
        Failed(AuthError, Option<AuthError>),
    }

    /// Pump messages between the two state machines without a transport
    fn drive(client: &mut ClientNegotiator, server: &mut ServerNegotiator) -> Outcome {
        let mut to_client = server.greeting();
        let mut server_session: Option<NegotiatedSession> = None;

        for _ in 0..16 {
            let action = match client.handle(to_client) {
                Ok(action) => action,
                Err(e) => return Outcome::Failed(e, None),
            };
            let to_server = match action {
                ClientAction::Send(message) => message,
                ClientAction::Complete(session) => {
                    let server_session = server_session.expect("server finished first");
                    return Outcome::Done(session, server_session);
                }
                ClientAction::StartTls => {
                    let client_session = client.upgrade_complete().unwrap();
                    let server_session = server.upgrade_complete().unwrap();
                    return Outcome::Done(client_session, server_session);
                }
            };

            to_client = match server.handle(to_server) {
                ServerAction::Send(message) | ServerAction::SendThenStartTls(message) => message,
                ServerAction::SendThenComplete(message, session) => {
                    server_session = Some(session);
                    message
                }
                ServerAction::Fail(message, server_error) => match client.handle(message) {
                    Err(client_error) => {
                        return Outcome::Failed(client_error, Some(server_error))
                    }
                    Ok(_) => panic!("client accepted a fatal rejection"),
                },
            };
        }
        panic!("negotiation did not converge");
    }

    #[test]
    fn test_anonymous_success() {
        let mut c = client(NegotiationOptions::default(), NameCallback::anonymous());
        let mut s = server(
            NegotiationOptions::default(),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            false,
        );

        let Outcome::Done(cs, ss) = drive(&mut c, &mut s) else {
            panic!("negotiation failed");
        };
        assert_eq!(cs, ss.clone().with_remote("server"));
        assert_eq!(cs.mechanism, ANONYMOUS);
        assert_eq!(ss.remote_endpoint, "client");
        assert_eq!(ss.principals, vec![Principal::anonymous()]);
        assert!(!cs.encrypted);
        assert_eq!(c.state(), ClientState::Authenticated);
        assert_eq!(s.state(), ServerState::Authenticated);
    }

    #[test]
    fn test_quiet_local_user_is_preferred() {
        let options = NegotiationOptions::default().with_sasl_property(QUIET_LOCAL_AUTH, "true");
        let mut c = client(options, NameCallback::anonymous());
        let mut s = server(NegotiationOptions::default(), ServerAuthConfig::default(), false);

        let Outcome::Done(cs, ss) = drive(&mut c, &mut s) else {
            panic!("negotiation failed");
        };
        assert_eq!(cs.mechanism, LOCAL_USER);
        assert_eq!(ss.principals, vec![Principal::new("$local")]);
    }

    #[test]
    fn test_unsupported_credentials_skip_mechanism() {
        // PLAIN is offered but the callback only knows a name
        let config = ServerAuthConfig::default()
            .with_mechanisms(&[PLAIN, ANONYMOUS])
            .with_user("admin", &hash_password("pw").unwrap());
        let mut c = client(NegotiationOptions::default(), NameCallback::anonymous());
        let mut s = server(NegotiationOptions::default(), config, false);

        let Outcome::Done(cs, _) = drive(&mut c, &mut s) else {
            panic!("negotiation failed");
        };
        assert_eq!(cs.mechanism, ANONYMOUS);
    }

    fn greeting(mechanisms: &[&str]) -> HandshakeMessage {
        HandshakeMessage::Greeting {
            version: PROTOCOL_VERSION,
            endpoint_name: "server".to_string(),
            mechanisms: mechanisms.iter().map(|m| m.to_string()).collect(),
            policy: PolicyFlags::default(),
            tls: TlsOffer::default(),
        }
    }

    fn sent(action: Result<ClientAction, AuthError>) -> HandshakeMessage {
        match action {
            Ok(ClientAction::Send(message)) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_local_challenge_falls_back() {
        let options = NegotiationOptions::default().with_sasl_property(QUIET_LOCAL_AUTH, "true");
        let mut c = client(options, NameCallback::anonymous());

        let request = sent(c.handle(greeting(&[LOCAL_USER, ANONYMOUS])));
        assert!(matches!(
            request,
            HandshakeMessage::AuthRequest { ref mechanism, .. } if mechanism == LOCAL_USER
        ));

        // Challenge file lives on another host
        let abort = sent(c.handle(HandshakeMessage::AuthChallenge {
            data: b"/nonexistent/.remoting-challenge-0".to_vec(),
        }));
        assert!(matches!(abort, HandshakeMessage::AuthAbort { .. }));

        let retry = sent(c.handle(HandshakeMessage::AuthRejected {
            reason: "LOCAL-USER failed on the dialing side".to_string(),
            kind: RejectKind::Retry,
        }));
        assert!(matches!(
            retry,
            HandshakeMessage::AuthRequest { ref mechanism, .. } if mechanism == ANONYMOUS
        ));

        let done = c
            .handle(HandshakeMessage::AuthSuccess {
                principal: "anonymous".to_string(),
                upgrade: false,
            })
            .unwrap();
        let ClientAction::Complete(session) = done else {
            panic!("expected completion");
        };
        assert_eq!(session.mechanism, ANONYMOUS);
        assert_eq!(c.state(), ClientState::Authenticated);
    }

    #[test]
    fn test_hostile_challenge_path_is_not_answered() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("credentials");
        std::fs::write(&secret, "TOP-SECRET-PRIVATE-KEY").unwrap();

        let options = NegotiationOptions::default().with_sasl_property(QUIET_LOCAL_AUTH, "true");
        let mut c = client(options, NameCallback::anonymous());
        let _ = sent(c.handle(greeting(&[LOCAL_USER, ANONYMOUS])));

        let reply = sent(c.handle(HandshakeMessage::AuthChallenge {
            data: secret.to_string_lossy().into_owned().into_bytes(),
        }));
        let HandshakeMessage::AuthAbort { reason } = reply else {
            panic!("expected an abort, got {:?}", reply);
        };
        assert!(!reason.contains("TOP-SECRET"));
    }

    #[test]
    fn test_server_rejects_aborted_mechanism_for_retry() {
        let mut s = server(NegotiationOptions::default(), ServerAuthConfig::default(), false);
        let _ = s.greeting();

        let challenge = s.handle(HandshakeMessage::AuthRequest {
            endpoint_name: "client".to_string(),
            mechanism: LOCAL_USER.to_string(),
            initial_response: None,
            start_tls: false,
        });
        assert!(matches!(
            challenge,
            ServerAction::Send(HandshakeMessage::AuthChallenge { .. })
        ));
        assert_eq!(s.state(), ServerState::ChallengeResponse);

        let rejected = s.handle(HandshakeMessage::AuthAbort {
            reason: "gave up".to_string(),
        });
        assert!(matches!(
            rejected,
            ServerAction::Send(HandshakeMessage::AuthRejected {
                kind: RejectKind::Retry,
                ..
            })
        ));
        assert_eq!(s.state(), ServerState::MechOffer);

        let success = s.handle(HandshakeMessage::AuthRequest {
            endpoint_name: "client".to_string(),
            mechanism: ANONYMOUS.to_string(),
            initial_response: None,
            start_tls: false,
        });
        assert!(matches!(success, ServerAction::SendThenComplete(..)));
    }

    #[test]
    fn test_no_anonymous_on_dialer_is_policy_violation() {
        let options = NegotiationOptions::default().with_anonymous(PolicyMode::Deny);
        let mut c = client(options, NameCallback::anonymous());
        let mut s = server(
            NegotiationOptions::default(),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            false,
        );

        let Outcome::Failed(error, _) = drive(&mut c, &mut s) else {
            panic!("negotiation should fail");
        };
        assert!(matches!(error, AuthError::PolicyViolation(_)));
        assert_eq!(c.state(), ClientState::Failed);
    }

    #[test]
    fn test_no_anonymous_on_acceptor_is_enforced_independently() {
        let mut s = server(
            NegotiationOptions::default().with_anonymous(PolicyMode::Deny),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            false,
        );
        let _ = s.greeting();

        // A dialer ignoring the offer still cannot get in
        let action = s.handle(HandshakeMessage::AuthRequest {
            endpoint_name: "rogue".to_string(),
            mechanism: ANONYMOUS.to_string(),
            initial_response: None,
            start_tls: false,
        });
        assert!(matches!(
            action,
            ServerAction::Fail(
                HandshakeMessage::AuthRejected {
                    kind: RejectKind::Policy,
                    ..
                },
                AuthError::PolicyViolation(_)
            )
        ));
        assert_eq!(s.state(), ServerState::Failed);
    }

    #[test]
    fn test_no_plaintext_requires_tls() {
        let options = NegotiationOptions::default().with_plaintext(PolicyMode::Deny);
        let mut c = client(options, NameCallback::anonymous());
        let mut s = server(NegotiationOptions::default(), ServerAuthConfig::default(), false);

        let Outcome::Failed(error, _) = drive(&mut c, &mut s) else {
            panic!("negotiation should fail");
        };
        assert!(matches!(error, AuthError::PolicyViolation(_)));
    }

    #[test]
    fn test_starttls_upgrade() {
        let options = NegotiationOptions::default()
            .with_plaintext(PolicyMode::Deny)
            .with_starttls();
        let mut c = client(options, NameCallback::anonymous());
        let mut s = server(
            NegotiationOptions::default(),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            true,
        );

        let Outcome::Done(cs, ss) = drive(&mut c, &mut s) else {
            panic!("negotiation failed");
        };
        assert!(cs.encrypted);
        assert!(ss.encrypted);
        assert_eq!(c.state(), ClientState::Authenticated);
        assert_eq!(s.state(), ServerState::Authenticated);
    }

    #[test]
    fn test_starttls_without_server_tls_falls_back() {
        let mut c = client(NegotiationOptions::default().with_starttls(), NameCallback::anonymous());
        let mut s = server(NegotiationOptions::default(), ServerAuthConfig::default(), false);

        let Outcome::Done(cs, _) = drive(&mut c, &mut s) else {
            panic!("negotiation failed");
        };
        assert!(!cs.encrypted);
    }

    #[test]
    fn test_retry_then_give_up() {
        let config = ServerAuthConfig::default()
            .with_mechanisms(&[PLAIN])
            .with_user("admin", &hash_password("right").unwrap());
        let mut c = client(NegotiationOptions::default(), PasswordCallback::new("admin", "wrong"));
        let mut s = server(NegotiationOptions::default(), config, false);

        let Outcome::Failed(error, _) = drive(&mut c, &mut s) else {
            panic!("negotiation should fail");
        };
        assert_eq!(
            error,
            AuthError::Authentication("invalid username or password".to_string())
        );
    }

    #[test]
    fn test_no_usable_mechanism() {
        let mut c = client(NegotiationOptions::default(), NoCredentials);
        let mut s = server(
            NegotiationOptions::default(),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            false,
        );

        let Outcome::Failed(error, _) = drive(&mut c, &mut s) else {
            panic!("negotiation should fail");
        };
        assert!(matches!(error, AuthError::Authentication(_)));
    }

    #[test]
    fn test_step_by_step_states() {
        let mut c = client(NegotiationOptions::default(), NameCallback::anonymous());
        let mut s = server(
            NegotiationOptions::default(),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            false,
        );
        assert_eq!(c.state(), ClientState::Init);
        assert_eq!(s.state(), ServerState::Init);

        let greeting = s.greeting();
        assert_eq!(s.state(), ServerState::MechOffer);

        let ClientAction::Send(request) = c.handle(greeting).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(c.state(), ClientState::MechSelect);
        assert_eq!(request.kind(), "AuthRequest");

        let ServerAction::SendThenComplete(success, _) = s.handle(request) else {
            panic!("expected success");
        };
        assert!(matches!(c.handle(success).unwrap(), ClientAction::Complete(_)));

        // Anything after completion is a protocol error
        let late = HandshakeMessage::AuthChallenge { data: vec![] };
        assert!(matches!(c.handle(late), Err(AuthError::Protocol(_))));
        assert_eq!(c.state(), ClientState::Failed);
    }

    #[test]
    fn test_version_mismatch() {
        let mut c = client(NegotiationOptions::default(), NameCallback::anonymous());
        let result = c.handle(HandshakeMessage::Greeting {
            version: PROTOCOL_VERSION + 1,
            endpoint_name: "future".to_string(),
            mechanisms: vec![ANONYMOUS.to_string()],
            policy: PolicyFlags::default(),
            tls: TlsOffer::default(),
        });
        assert!(matches!(result, Err(AuthError::Protocol(_))));
    }

    impl NegotiatedSession {
        fn with_remote(mut self, remote: &str) -> Self {
            self.remote_endpoint = remote.to_string();
            self
        }
    }
}
