use crate::errors::DomainError;
use crate::forwarder::Forwarder;
use serde::{Deserialize, Serialize};

/// One `[[forwarders]]` table, kept as strings until validated.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ForwarderEntry {
    /// `ip:port` of the resolver, usually port 853
    pub address: String,

    /// Name the resolver's certificate is issued for
    pub hostname: String,

    /// Base64 SHA-256 of the certificate's SubjectPublicKeyInfo
    pub pin: String,
}

impl ForwarderEntry {
    pub fn to_forwarder(&self) -> Result<Forwarder, DomainError> {
        Forwarder::parse(&self.address, &self.hostname, &self.pin)
    }
}

impl TryFrom<&ForwarderEntry> for Forwarder {
    type Error = DomainError;

    fn try_from(entry: &ForwarderEntry) -> Result<Self, Self::Error> {
        entry.to_forwarder()
    }
}
