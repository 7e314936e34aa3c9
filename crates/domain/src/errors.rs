use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid forwarder: {0}")]
    InvalidForwarder(String),

    #[error("Invalid public key pin: {0}")]
    InvalidPin(String),

    #[error("No forwarders configured")]
    NoForwarders,

    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Transport error with {server}: {reason}")]
    TransportError { server: String, reason: String },

    #[error("Transport timeout with {server}")]
    TransportTimeout { server: String },

    #[error("TLS handshake with {server} failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    #[error("Certificate of {server} does not match hostname {hostname}")]
    HostnameMismatch { server: String, hostname: String },

    #[error("Certificate public key of {server} does not match the configured pin")]
    PinMismatch { server: String },

    #[error("Invalid certificate from {server}: {reason}")]
    InvalidCertificate { server: String, reason: String },
}

impl DomainError {
    /// True for failures that mean the forwarder cannot be trusted, as
    /// opposed to failures of the network path to it.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::HostnameMismatch { .. } | Self::PinMismatch { .. } | Self::InvalidCertificate { .. }
        )
    }
}

impl From<std::io::Error> for DomainError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}
