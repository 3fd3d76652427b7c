//! Negotiation options and server-side authentication configuration

use crate::error::AuthError;
use crate::mechanism::{ANONYMOUS, BEARER, LOCAL_USER, PLAIN};
use remoting_proto::PolicyFlags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// SASL property that suppresses the name prompt of LOCAL-USER
pub const QUIET_LOCAL_AUTH: &str = "local-user.quiet-auth";

/// Mechanisms tried by a dialer that does not list its own
pub const DEFAULT_MECHANISM_PREFERENCE: [&str; 4] = [BEARER, PLAIN, LOCAL_USER, ANONYMOUS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Enabled,
    #[default]
    Disabled,
}

impl Toggle {
    pub fn is_enabled(self) -> bool {
        self == Toggle::Enabled
    }
}

/// Options one side brings to a negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NegotiationOptions {
    pub anonymous: PolicyMode,
    pub plaintext: PolicyMode,
    pub encryption: Toggle,
    pub in_band_upgrade: Toggle,
    /// Preference order; empty means [`DEFAULT_MECHANISM_PREFERENCE`]
    pub mechanisms: Vec<String>,
    /// Mechanism-specific properties
    pub sasl: BTreeMap<String, String>,
}

impl NegotiationOptions {
    /// Build options from textual key/value pairs.
    ///
    /// Recognised keys: `anonymous`, `plaintext` (`allow|deny`),
    /// `encryption`, `in-band-upgrade` (`enabled|disabled`), `mechanisms`
    /// (comma separated) and `sasl.<property>`.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();

        for (key, value) in pairs {
            let key = key.trim();
            let value = value.trim();
            match key {
                "anonymous" => options.anonymous = parse_mode(key, value)?,
                "plaintext" => options.plaintext = parse_mode(key, value)?,
                "encryption" => options.encryption = parse_toggle(key, value)?,
                "in-band-upgrade" => options.in_band_upgrade = parse_toggle(key, value)?,
                "mechanisms" => {
                    options.mechanisms = value
                        .split(',')
                        .map(|m| m.trim().to_ascii_uppercase())
                        .filter(|m| !m.is_empty())
                        .collect();
                }
                _ => match key.strip_prefix("sasl.") {
                    Some(property) if !property.is_empty() => {
                        options.sasl.insert(property.to_string(), value.to_string());
                    }
                    _ => {
                        return Err(AuthError::Configuration(format!(
                            "unknown negotiation option '{}'",
                            key
                        )))
                    }
                },
            }
        }

        options.validate()?;
        Ok(options)
    }

    pub fn with_anonymous(mut self, mode: PolicyMode) -> Self {
        self.anonymous = mode;
        self
    }

    pub fn with_plaintext(mut self, mode: PolicyMode) -> Self {
        self.plaintext = mode;
        self
    }

    /// Enable encryption through an in-band upgrade
    pub fn with_starttls(mut self) -> Self {
        self.encryption = Toggle::Enabled;
        self.in_band_upgrade = Toggle::Enabled;
        self
    }

    pub fn with_mechanisms(mut self, mechanisms: &[&str]) -> Self {
        self.mechanisms = mechanisms.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_sasl_property(mut self, key: &str, value: &str) -> Self {
        self.sasl.insert(key.to_string(), value.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        for mechanism in &self.mechanisms {
            if !is_known_mechanism(mechanism) {
                return Err(AuthError::Configuration(format!(
                    "unknown mechanism '{}'",
                    mechanism
                )));
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> PolicyFlags {
        PolicyFlags {
            no_anonymous: self.anonymous == PolicyMode::Deny,
            no_plaintext: self.plaintext == PolicyMode::Deny,
        }
    }

    /// Whether the dialer asks for an in-band TLS upgrade
    pub fn wants_starttls(&self) -> bool {
        self.encryption.is_enabled() && self.in_band_upgrade.is_enabled()
    }

    pub fn preference(&self) -> Vec<String> {
        if self.mechanisms.is_empty() {
            DEFAULT_MECHANISM_PREFERENCE
                .iter()
                .map(|m| m.to_string())
                .collect()
        } else {
            self.mechanisms.clone()
        }
    }

    pub fn sasl_flag(&self, key: &str) -> bool {
        self.sasl
            .get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

fn parse_mode(key: &str, value: &str) -> Result<PolicyMode, AuthError> {
    match value.to_ascii_lowercase().as_str() {
        "allow" => Ok(PolicyMode::Allow),
        "deny" => Ok(PolicyMode::Deny),
        _ => Err(AuthError::Configuration(format!(
            "{} must be allow or deny, got '{}'",
            key, value
        ))),
    }
}

fn parse_toggle(key: &str, value: &str) -> Result<Toggle, AuthError> {
    match value.to_ascii_lowercase().as_str() {
        "enabled" => Ok(Toggle::Enabled),
        "disabled" => Ok(Toggle::Disabled),
        _ => Err(AuthError::Configuration(format!(
            "{} must be enabled or disabled, got '{}'",
            key, value
        ))),
    }
}

pub(crate) fn is_known_mechanism(name: &str) -> bool {
    matches!(name, ANONYMOUS | PLAIN | LOCAL_USER | BEARER)
}

/// Mechanisms a policy forbids regardless of what the peers offer
pub(crate) fn forbidden_by(policy: PolicyFlags, mechanism: &str) -> bool {
    (policy.no_anonymous && mechanism == ANONYMOUS) || (policy.no_plaintext && mechanism == PLAIN)
}

/// LOCAL-USER settings for the accepting side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LocalUserConfig {
    /// Where challenge files are written; the system temp dir when unset
    pub challenge_dir: Option<String>,
    /// Identity given to quiet (nameless) local logins
    pub default_user: String,
}

impl Default for LocalUserConfig {
    fn default() -> Self {
        Self {
            challenge_dir: None,
            default_user: "$local".to_string(),
        }
    }
}

/// What the accepting side can verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerAuthConfig {
    /// Mechanisms to offer, in order; unusable ones are dropped
    pub mechanisms: Vec<String>,
    /// User name -> argon2 PHC hash, for PLAIN
    pub users: BTreeMap<String, String>,
    /// HS256 secret, for BEARER
    pub jwt_secret: Option<String>,
    /// Required `iss` claim of bearer tokens
    pub jwt_issuer: Option<String>,
    /// Required `aud` claim of bearer tokens
    pub jwt_audience: Option<String>,
    pub local_user: LocalUserConfig,
}

impl Default for ServerAuthConfig {
    fn default() -> Self {
        Self {
            mechanisms: vec![
                LOCAL_USER.to_string(),
                ANONYMOUS.to_string(),
                PLAIN.to_string(),
                BEARER.to_string(),
            ],
            users: BTreeMap::new(),
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            local_user: LocalUserConfig::default(),
        }
    }
}

impl ServerAuthConfig {
    /// Add a PLAIN user with an already hashed password
    pub fn with_user(mut self, name: &str, password_hash: &str) -> Self {
        self.users
            .insert(name.to_string(), password_hash.to_string());
        self
    }

    pub fn with_jwt_secret(mut self, secret: &str) -> Self {
        self.jwt_secret = Some(secret.to_string());
        self
    }

    /// Only accept bearer tokens issued by `issuer`
    pub fn with_jwt_issuer(mut self, issuer: &str) -> Self {
        self.jwt_issuer = Some(issuer.to_string());
        self
    }

    /// Only accept bearer tokens addressed to `audience`
    pub fn with_jwt_audience(mut self, audience: &str) -> Self {
        self.jwt_audience = Some(audience.to_string());
        self
    }

    pub fn with_mechanisms(mut self, mechanisms: &[&str]) -> Self {
        self.mechanisms = mechanisms.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        for mechanism in &self.mechanisms {
            if !is_known_mechanism(mechanism) {
                return Err(AuthError::Configuration(format!(
                    "unknown mechanism '{}'",
                    mechanism
                )));
            }
        }
        if let Some(dir) = &self.local_user.challenge_dir {
            if !std::path::Path::new(dir).is_dir() {
                return Err(AuthError::Configuration(format!(
                    "challenge-dir '{}' is not a directory",
                    dir
                )));
            }
        }
        Ok(())
    }

    /// Whether the configuration holds what `mechanism` needs
    pub fn supports(&self, mechanism: &str) -> bool {
        match mechanism {
            ANONYMOUS | LOCAL_USER => true,
            PLAIN => !self.users.is_empty(),
            BEARER => self.jwt_secret.is_some(),
            _ => false,
        }
    }
}
