//! Credential callbacks supplying identity material on demand

use std::fmt;
use thiserror::Error;

/// The callback cannot supply a requested credential
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unsupported credential: {0}")]
pub struct UnsupportedCredential(pub String);

/// One credential slot a mechanism asks the callback to fill
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Name {
        prompt: String,
        default: Option<String>,
        value: Option<String>,
    },
    Password {
        prompt: String,
        value: Option<String>,
    },
    BearerToken {
        value: Option<String>,
    },
}

impl Credential {
    pub fn name(prompt: &str, default: Option<&str>) -> Self {
        Credential::Name {
            prompt: prompt.to_string(),
            default: default.map(str::to_string),
            value: None,
        }
    }

    pub fn password(prompt: &str) -> Self {
        Credential::Password {
            prompt: prompt.to_string(),
            value: None,
        }
    }

    pub fn bearer_token() -> Self {
        Credential::BearerToken { value: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Name { .. } => "name",
            Credential::Password { .. } => "password",
            Credential::BearerToken { .. } => "bearer-token",
        }
    }

    pub fn set(&mut self, new_value: impl Into<String>) {
        let new_value = Some(new_value.into());
        match self {
            Credential::Name { value, .. }
            | Credential::Password { value, .. }
            | Credential::BearerToken { value } => *value = new_value,
        }
    }

    /// The supplied value, falling back to a name's default
    pub fn value(&self) -> Option<&str> {
        match self {
            Credential::Name { value, default, .. } => value.as_deref().or(default.as_deref()),
            Credential::Password { value, .. } | Credential::BearerToken { value } => {
                value.as_deref()
            }
        }
    }

    /// Like [`value`](Self::value), failing when the slot was left empty
    pub fn require(&self) -> Result<&str, UnsupportedCredential> {
        self.value()
            .ok_or_else(|| UnsupportedCredential(format!("no value for {}", self.kind())))
    }
}

impl fmt::Debug for Credential {
    // Never print secrets
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Name { prompt, value, .. } => f
                .debug_struct("Name")
                .field("prompt", prompt)
                .field("value", value)
                .finish(),
            Credential::Password { prompt, value } => f
                .debug_struct("Password")
                .field("prompt", prompt)
                .field("set", &value.is_some())
                .finish(),
            Credential::BearerToken { value } => f
                .debug_struct("BearerToken")
                .field("set", &value.is_some())
                .finish(),
        }
    }
}

/// Supplies credentials to the dialing side of a negotiation.
///
/// Implementations fill every slot they understand and return
/// [`UnsupportedCredential`] for anything else; the mechanism that asked is
/// then skipped.
pub trait CredentialCallback: Send + Sync {
    fn handle(&self, credentials: &mut [Credential]) -> Result<(), UnsupportedCredential>;
}

/// Supplies a name and nothing else
#[derive(Debug, Clone)]
pub struct NameCallback {
    name: String,
}

impl NameCallback {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The callback used for anonymous access
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

impl CredentialCallback for NameCallback {
    fn handle(&self, credentials: &mut [Credential]) -> Result<(), UnsupportedCredential> {
        for credential in credentials.iter_mut() {
            match credential {
                Credential::Name { .. } => credential.set(self.name.clone()),
                other => return Err(UnsupportedCredential(other.kind().to_string())),
            }
        }
        Ok(())
    }
}

/// Supplies a name and password
#[derive(Clone)]
pub struct PasswordCallback {
    name: String,
    password: String,
}

impl PasswordCallback {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PasswordCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCallback")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CredentialCallback for PasswordCallback {
    fn handle(&self, credentials: &mut [Credential]) -> Result<(), UnsupportedCredential> {
        for credential in credentials.iter_mut() {
            match credential {
                Credential::Name { .. } => credential.set(self.name.clone()),
                Credential::Password { .. } => credential.set(self.password.clone()),
                other => return Err(UnsupportedCredential(other.kind().to_string())),
            }
        }
        Ok(())
    }
}

/// Supplies a bearer token
#[derive(Clone)]
pub struct TokenCallback {
    token: String,
}

impl TokenCallback {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for TokenCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCallback").finish_non_exhaustive()
    }
}

impl CredentialCallback for TokenCallback {
    fn handle(&self, credentials: &mut [Credential]) -> Result<(), UnsupportedCredential> {
        for credential in credentials.iter_mut() {
            match credential {
                Credential::BearerToken { .. } => credential.set(self.token.clone()),
                other => return Err(UnsupportedCredential(other.kind().to_string())),
            }
        }
        Ok(())
    }
}

/// Refuses every request
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialCallback for NoCredentials {
    fn handle(&self, credentials: &mut [Credential]) -> Result<(), UnsupportedCredential> {
        match credentials.first() {
            Some(credential) => Err(UnsupportedCredential(credential.kind().to_string())),
            None => Ok(()),
        }
    }
}
