use serde::{Deserialize, Serialize};

use super::connection::ConnectionConfig;
use super::errors::ConfigError;
use super::forwarders::ForwarderEntry;
use super::logging::LoggingConfig;
use super::server::ServerConfig;
use crate::forwarder::Forwarder;

const LOCAL_CONFIG_PATH: &str = "ferrous-dot.toml";
const SYSTEM_CONFIG_PATH: &str = "/etc/ferrous-dot/config.toml";

/// Main configuration structure for Ferrous DoT
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Listening side (bind address, port, protocols)
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream resolvers in preference order
    #[serde(default)]
    pub forwarders: Vec<ForwarderEntry>,

    /// Outbound connection limits and timeouts
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or use defaults
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. ferrous-dot.toml in current directory
    /// 3. /etc/ferrous-dot/config.toml
    /// 4. Default configuration
    pub fn load(path: Option<&str>, cli_overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if std::path::Path::new(LOCAL_CONFIG_PATH).exists() {
            Self::from_file(LOCAL_CONFIG_PATH)?
        } else if std::path::Path::new(SYSTEM_CONFIG_PATH).exists() {
            Self::from_file(SYSTEM_CONFIG_PATH)?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(cli_overrides);
        Ok(config)
    }

    /// Load configuration from a specific file
    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply command-line overrides to configuration
    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(bind) = overrides.bind_address {
            self.server.bind_address = bind;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(max) = overrides.max_connections {
            self.connection.max_connections = max;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Listen port cannot be 0".to_string()));
        }

        if !self.server.udp && !self.server.tcp {
            return Err(ConfigError::Validation(
                "At least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        self.server
            .socket_addr()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.forwarders.is_empty() {
            return Err(ConfigError::Validation(
                "No forwarders configured".to_string(),
            ));
        }

        if self.connection.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }

        self.forwarders()?;
        Ok(())
    }

    /// Forwarder descriptors in configured order
    pub fn forwarders(&self) -> Result<Vec<Forwarder>, ConfigError> {
        self.forwarders
            .iter()
            .map(|entry| {
                entry
                    .to_forwarder()
                    .map_err(|e| ConfigError::Validation(e.to_string()))
            })
            .collect()
    }
}

/// Command-line overrides for configuration
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub log_level: Option<String>,
}
