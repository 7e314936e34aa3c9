//! TLS context for forwarder connections (DNS-over-TLS, RFC 7858).
//!
//! One `ClientConfig` is built at startup and shared by every connection.
//! Forwarders are trusted by pin rather than by a CA chain, so the
//! handshake-time verifier accepts any chain but still checks the handshake
//! signatures against the presented key. Hostname and pin are checked once
//! the handshake has finished (see `forwarder::verify`).

use ferrous_dot_domain::DomainError;
use rustls::client::Resumption;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use rustls::SupportedCipherSuite;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Build the shared client configuration. `ciphers` restricts the
    /// provider's suites by name (e.g. `TLS13_AES_256_GCM_SHA384`); an empty
    /// list keeps the defaults.
    pub fn new(ciphers: &[String]) -> Result<Self, DomainError> {
        let provider = restrict_cipher_suites(rustls::crypto::ring::default_provider(), ciphers)?;
        let verifier = PinnedServerVerifier {
            algorithms: provider.signature_verification_algorithms,
        };

        let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| DomainError::TlsConfig(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        // the pin must be checked against a certificate sent in this handshake
        config.resumption = Resumption::disabled();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// A fresh client session whose SNI is `hostname`.
    pub fn session(&self, hostname: &str) -> Result<ClientConnection, DomainError> {
        let server_name = ServerName::try_from(hostname.to_string()).map_err(|e| {
            DomainError::InvalidForwarder(format!("Invalid TLS hostname '{}': {}", hostname, e))
        })?;
        ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(|e| DomainError::TlsConfig(e.to_string()))
    }
}

fn restrict_cipher_suites(
    mut provider: CryptoProvider,
    ciphers: &[String],
) -> Result<CryptoProvider, DomainError> {
    if ciphers.is_empty() {
        return Ok(provider);
    }

    provider.cipher_suites.retain(|suite| {
        let name = suite_name(suite);
        ciphers.iter().any(|c| c.eq_ignore_ascii_case(&name))
    });
    if provider.cipher_suites.is_empty() {
        return Err(DomainError::TlsConfig(format!(
            "None of the configured ciphers are supported: {}",
            ciphers.join(", ")
        )));
    }

    debug!(
        suites = ?provider.cipher_suites.iter().map(suite_name).collect::<Vec<_>>(),
        "Restricted TLS cipher suites"
    );
    Ok(provider)
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

#[derive(Debug)]
struct PinnedServerVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
