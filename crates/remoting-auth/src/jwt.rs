//! JWT handling for the BEARER mechanism

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by a bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (becomes the connection principal)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Custom: roles granted to the subject
    #[serde(default)]
    pub roles: Vec<String>,
}

impl JwtClaims {
    pub fn new(subject: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates the signature and expiration only, unless
    /// [`with_issuer`](Self::with_issuer) or [`with_audience`](Self::with_audience)
    /// are used.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.validate_aud = true;
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn test_jwt_encode_decode() {
        let claims = JwtClaims::new(
            "operator".to_string(),
            "test-issuer".to_string(),
            "test-audience".to_string(),
            Duration::hours(1),
        )
        .with_roles(vec!["monitor".to_string()]);

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET)
            .with_issuer("test-issuer".to_string())
            .with_audience("test-audience".to_string());

        let decoded = validator.validate(&token).unwrap();
        assert_eq!(decoded.sub, "operator");
        assert_eq!(decoded.roles, vec!["monitor"]);
    }

    #[test]
    fn test_issuer_and_audience_are_enforced() {
        let claims = JwtClaims::new(
            "operator".to_string(),
            "someone-else".to_string(),
            "another-service".to_string(),
            Duration::hours(1),
        );
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        assert!(JwtValidator::new(TEST_SECRET).validate(&token).is_ok());
        assert!(JwtValidator::new(TEST_SECRET)
            .with_issuer("test-issuer".to_string())
            .validate(&token)
            .is_err());
        assert!(JwtValidator::new(TEST_SECRET)
            .with_audience("test-audience".to_string())
            .validate(&token)
            .is_err());
    }

    #[test]
    fn test_expired_token() {
        let claims = JwtClaims::new(
            "operator".to_string(),
            "issuer".to_string(),
            "audience".to_string(),
            Duration::seconds(-120),
        );
        assert!(claims.is_expired());

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        assert!(JwtValidator::new(TEST_SECRET).validate(&token).is_err());
    }

    #[test]
    fn test_wrong_secret() {
        let claims = JwtClaims::new(
            "operator".to_string(),
            "issuer".to_string(),
            "audience".to_string(),
            Duration::hours(1),
        );
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        assert!(JwtValidator::new(b"another-secret").validate(&token).is_err());
    }
}
