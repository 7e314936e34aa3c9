//! Identity checks run on a forwarder's certificate once the TLS handshake
//! has completed. A successful handshake alone never makes a forwarder
//! trusted: its leaf certificate must name the configured hostname and its
//! public key must hash to the configured pin.

use ferrous_dot_domain::{DomainError, Pin};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("no peer certificate was presented")]
    NoCertificate,

    #[error("unparseable certificate: {0}")]
    Malformed(String),

    #[error("certificate is not valid for {0}")]
    HostnameMismatch(String),

    #[error("public key does not match the pin")]
    PinMismatch,
}

impl TrustError {
    pub fn into_domain(self, server: SocketAddr) -> DomainError {
        let server = server.to_string();
        match self {
            Self::NoCertificate => DomainError::InvalidCertificate {
                server,
                reason: "no peer certificate".to_string(),
            },
            Self::Malformed(reason) => DomainError::InvalidCertificate { server, reason },
            Self::HostnameMismatch(hostname) => DomainError::HostnameMismatch { server, hostname },
            Self::PinMismatch => DomainError::PinMismatch { server },
        }
    }
}

/// SHA-256 of the DER encoded SubjectPublicKeyInfo of `cert_der`.
pub fn spki_pin(cert_der: &[u8]) -> Result<Pin, TrustError> {
    let cert = parse(cert_der)?;
    Ok(pin_of(&cert))
}

/// Check a leaf certificate against the expected hostname and pin.
pub fn verify_peer(cert_der: &[u8], hostname: &str, pin: &Pin) -> Result<(), TrustError> {
    let cert = parse(cert_der)?;

    if !certificate_names(&cert)?
        .iter()
        .any(|name| name.matches(hostname))
    {
        return Err(TrustError::HostnameMismatch(hostname.to_string()));
    }

    if !pin.matches(&Sha256::digest(cert.public_key().raw)) {
        return Err(TrustError::PinMismatch);
    }
    Ok(())
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, TrustError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| TrustError::Malformed(e.to_string()))
}

fn pin_of(cert: &X509Certificate<'_>) -> Pin {
    Pin::new(Sha256::digest(cert.public_key().raw).into())
}

#[derive(Debug, PartialEq, Eq)]
enum CertName {
    Dns(String),
    Ip(IpAddr),
}

impl CertName {
    fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Ip(ip) => hostname
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .is_ok_and(|expected| expected == *ip),
            Self::Dns(pattern) => dns_name_matches(pattern, hostname),
        }
    }
}

/// SAN entries, or the subject common names when there is no SAN extension.
fn certificate_names(cert: &X509Certificate<'_>) -> Result<Vec<CertName>, TrustError> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| TrustError::Malformed(e.to_string()))?;

    if let Some(san) = san {
        return Ok(san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(CertName::Dns(dns.to_string())),
                GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(CertName::Ip),
                _ => None,
            })
            .collect());
    }

    Ok(cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(|cn| CertName::Dns(cn.to_string()))
        .collect())
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Case-insensitive match; `*` is only honoured as the whole left-most label
/// and covers exactly one label.
fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || hostname.is_empty() {
        return false;
    }

    match pattern.strip_prefix("*.") {
        Some(suffix) => match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && !suffix.contains('*') && rest == suffix,
            None => false,
        },
        None => pattern == hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_name_exact_and_case() {
        assert!(dns_name_matches("dns.google", "dns.google"));
        assert!(dns_name_matches("DNS.Google", "dns.google."));
        assert!(!dns_name_matches("dns.google", "dns.google.com"));
        assert!(!dns_name_matches("", "dns.google"));
    }

    #[test]
    fn test_dns_name_wildcard_single_label() {
        assert!(dns_name_matches("*.example.net", "dot.example.net"));
        assert!(!dns_name_matches("*.example.net", "a.b.example.net"));
        assert!(!dns_name_matches("*.example.net", "example.net"));
        assert!(!dns_name_matches("dot.*.net", "dot.example.net"));
    }

    #[test]
    fn test_ip_names() {
        let name = CertName::Ip("1.1.1.1".parse().unwrap());
        assert!(name.matches("1.1.1.1"));
        assert!(!name.matches("1.0.0.1"));
        assert!(!name.matches("one.one.one.one"));

        let v6 = CertName::Ip("2606:4700:4700::1111".parse().unwrap());
        assert!(v6.matches("[2606:4700:4700::1111]"));
    }

    #[test]
    fn test_ip_from_bytes() {
        assert_eq!(
            ip_from_bytes(&[9, 9, 9, 9]),
            Some("9.9.9.9".parse().unwrap())
        );
        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn test_malformed_certificate() {
        let pin = Pin::new([0; 32]);
        assert!(matches!(
            verify_peer(b"not a certificate", "dns.google", &pin),
            Err(TrustError::Malformed(_))
        ));
    }

    #[test]
    fn test_trust_error_classification() {
        let server: SocketAddr = "9.9.9.9:853".parse().unwrap();
        let err = TrustError::PinMismatch.into_domain(server);
        assert!(err.is_trust_failure());
        assert_eq!(
            TrustError::HostnameMismatch("dns.quad9.net".into()).into_domain(server),
            DomainError::HostnameMismatch {
                server: "9.9.9.9:853".into(),
                hostname: "dns.quad9.net".into()
            }
        );
    }
}
