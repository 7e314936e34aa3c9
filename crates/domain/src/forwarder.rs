use crate::errors::DomainError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Length in bytes of a SHA-256 public key pin.
pub const PIN_LEN: usize = 32;

/// SHA-256 digest of a certificate's DER encoded `SubjectPublicKeyInfo`.
///
/// Configured as standard base64, the same encoding HPKP style
/// `pin-sha256` values use.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pin([u8; PIN_LEN]);

impl Pin {
    pub fn new(digest: [u8; PIN_LEN]) -> Self {
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; PIN_LEN] {
        &self.0
    }

    /// Compare against a computed digest of arbitrary length.
    pub fn matches(&self, digest: &[u8]) -> bool {
        self.0.as_slice() == digest
    }
}

impl FromStr for Pin {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = STANDARD
            .decode(s.trim())
            .map_err(|e| DomainError::InvalidPin(format!("'{}' is not base64: {}", s, e)))?;
        let digest: [u8; PIN_LEN] = decoded.as_slice().try_into().map_err(|_| {
            DomainError::InvalidPin(format!(
                "'{}' decodes to {} bytes, expected {}",
                s,
                decoded.len(),
                PIN_LEN
            ))
        })?;
        Ok(Self(digest))
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin({})", self)
    }
}

/// An upstream DNS-over-TLS resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarder {
    /// Where to connect.
    pub remote: SocketAddr,
    /// Name the certificate must be issued for.
    pub hostname: String,
    /// Expected public key pin of the certificate.
    pub pin: Pin,
}

impl Forwarder {
    pub fn new(remote: SocketAddr, hostname: impl Into<String>, pin: Pin) -> Self {
        Self {
            remote,
            hostname: hostname.into(),
            pin,
        }
    }

    /// Build a descriptor from its configuration strings.
    pub fn parse(address: &str, hostname: &str, pin: &str) -> Result<Self, DomainError> {
        let remote: SocketAddr = address.parse().map_err(|e| {
            DomainError::InvalidForwarder(format!("Invalid address '{}': {}", address, e))
        })?;
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(DomainError::InvalidForwarder(format!(
                "Forwarder {} has no hostname",
                remote
            )));
        }
        Ok(Self::new(remote, hostname, pin.parse()?))
    }
}

impl fmt::Display for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.remote, self.hostname)
    }
}
