use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits applied to outbound forwarder connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Concurrent forwarder connections; further requests wait
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds allowed for TCP connect plus TLS handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds an open connection may sit without receiving data
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds a blocked write may wait for the socket
    #[serde(default = "default_io_timeout")]
    pub io_timeout: u64,

    /// rustls cipher suite names, e.g. `TLS13_AES_256_GCM_SHA384`.
    /// Empty keeps the provider defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            io_timeout: default_io_timeout(),
            ciphers: Vec::new(),
        }
    }
}

fn default_max_connections() -> usize {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    5
}
