//! Self-signed certificate generation for development and testing
//!
//! Lets an endpoint offer an in-band TLS upgrade without provisioning
//! certificate files. Peers must skip verification or pin the certificate.

use rcgen::{CertificateParams, DistinguishedName, Ia5String, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
}

const VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Generate a self-signed certificate valid for localhost
///
/// **DO NOT use in production.**
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "Remoting Development Certificate");
    dn.push(rcgen::DnType::OrganizationName, "Remoting Dev");
    params.distinguished_name = dn;

    let dns = |name: &str| {
        Ia5String::try_from(name)
            .map(SanType::DnsName)
            .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))
    };
    params.subject_alt_names = vec![
        dns("localhost")?,
        dns("*.localhost")?,
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    let not_before = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let not_after = not_before + VALIDITY;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format (binary)
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &str, key_path: &str) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_cert() {
        let cert = generate_self_signed_cert().unwrap();

        assert!(!cert.cert_der.is_empty());
        assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.pem_key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_cert_can_be_used_with_rustls() {
        crate::tls::ensure_crypto_provider();
        let cert = generate_self_signed_cert().unwrap();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert_der], cert.key_der);

        assert!(server_config.is_ok());
    }
}
