//! In-band TLS upgrade of an established byte stream

use crate::self_signed::generate_self_signed_cert;
use crate::{BoxedStream, TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// TLS material and verification settings for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TlsOptions {
    /// Server certificate chain (PEM), used when accepting an upgrade
    pub cert_path: Option<String>,

    /// Server private key (PEM)
    pub key_path: Option<String>,

    /// Generate an ephemeral self-signed certificate when no files are given
    pub self_signed: bool,

    /// Verify the peer certificate when dialing
    pub verify_peer: bool,

    /// Extra trust anchors (PEM); webpki roots are used when absent
    pub ca_cert_path: Option<String>,

    /// Name to verify instead of the dialed host
    pub server_name: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            self_signed: false,
            verify_peer: true,
            ca_cert_path: None,
            server_name: None,
        }
    }
}

impl TlsOptions {
    /// Options for an endpoint that accepts upgrades with certificate files
    pub fn server_with_files(cert_path: &str, key_path: &str) -> Self {
        Self {
            cert_path: Some(cert_path.to_string()),
            key_path: Some(key_path.to_string()),
            ..Default::default()
        }
    }

    /// Options for an endpoint that accepts upgrades with a throwaway certificate
    pub fn server_self_signed() -> Self {
        Self {
            self_signed: true,
            ..Default::default()
        }
    }

    /// Disable peer certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    pub fn with_ca_cert(mut self, path: &str) -> Self {
        self.ca_cert_path = Some(path.to_string());
        self
    }

    pub fn with_server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    /// Whether this endpoint can act as the TLS server of an upgrade
    pub fn can_accept(&self) -> bool {
        self.self_signed || (self.cert_path.is_some() && self.key_path.is_some())
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(TransportError::ConfigurationError(
                "cert-path and key-path must be given together".to_string(),
            ));
        }
        for path in [&self.cert_path, &self.key_path, &self.ca_cert_path]
            .into_iter()
            .flatten()
        {
            if !Path::new(path).is_file() {
                return Err(TransportError::ConfigurationError(format!(
                    "TLS file not found: {}",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Build rustls TlsConnector for the dialing side
    pub fn build_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        match &self.ca_cert_path {
            Some(path) => {
                for cert in load_certs(Path::new(path))? {
                    roots.add(cert).map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let client_crypto = if self.verify_peer {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    /// Build rustls TlsAcceptor for the accepting side
    pub fn build_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        ensure_crypto_provider();

        let (certs, key) = match (&self.cert_path, &self.key_path) {
            (Some(cert_path), Some(key_path)) => (
                load_certs(Path::new(cert_path))?,
                load_private_key(Path::new(key_path))?,
            ),
            _ if self.self_signed => {
                let cert = generate_self_signed_cert()
                    .map_err(|e| TransportError::TlsError(e.to_string()))?;
                debug!("Generated self-signed certificate for in-band TLS");
                (vec![cert.cert_der], cert.key_der)
            }
            _ => {
                return Err(TransportError::ConfigurationError(
                    "Server cert path required".to_string(),
                ))
            }
        };

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

/// Run the client half of a TLS handshake over `stream`
pub async fn upgrade_client(
    connector: &tokio_rustls::TlsConnector,
    stream: BoxedStream,
    host: &str,
) -> TransportResult<BoxedStream> {
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::TlsError(format!("Invalid server name {}: {}", host, e)))?;

    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

    Ok(Box::new(tls))
}

/// Run the server half of a TLS handshake over `stream`
pub async fn upgrade_server(
    acceptor: &tokio_rustls::TlsAcceptor,
    stream: BoxedStream,
) -> TransportResult<BoxedStream> {
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

    Ok(Box::new(tls))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
