//! Ferrous DoT Domain Layer
pub mod config;
pub mod errors;
pub mod forwarder;

pub use config::{CliOverrides, Config, ConfigError};
pub use errors::DomainError;
pub use forwarder::{Forwarder, Pin, PIN_LEN};
