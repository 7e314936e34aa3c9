use crate::errors::DomainError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Where plaintext DNS clients are accepted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub udp: bool,

    #[serde(default = "default_true")]
    pub tcp: bool,
}

impl ServerConfig {
    pub fn listen_address(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, DomainError> {
        let address = self.listen_address();
        address
            .parse()
            .map_err(|e| DomainError::InvalidListenAddress(format!("{}: {}", address, e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            udp: true,
            tcp: true,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    53
}

fn default_true() -> bool {
    true
}
